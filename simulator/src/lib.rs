pub mod config;
pub mod controller;
pub mod feeding;
pub mod filter;
pub mod hardware;
pub mod sync;
pub mod telemetry;
pub mod thermostat;
