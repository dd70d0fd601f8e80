pub mod alerts;
pub mod config;
pub mod config_sync;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod service;
pub mod store;
pub mod throttle;
pub mod validate;
pub mod worker;
