use anyhow::Result;
use chrono::{Local, Utc};
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zoocare_simulator::config::Args;
use zoocare_simulator::controller::Controller;
use zoocare_simulator::feeding::FeedingScheduler;
use zoocare_simulator::hardware::{Environment, SimulatedBoard, SimulatedDht22};
use zoocare_simulator::sync::ConfigClient;
use zoocare_simulator::telemetry::{ALERT_TOPIC, EVENT_TOPIC, TELEMETRY_TOPIC};
use zoocare_simulator::thermostat::Thermostat;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("Starting zoo controller simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Tick: {:?}",
        args.broker,
        args.port,
        args.devices,
        args.tick_interval()
    );

    let client_id = args.client_id();
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let config_client = match &args.backend_url {
        Some(url) => Some(ConfigClient::new(url.clone())?),
        None => None,
    };

    let mut devices = JoinSet::new();
    for index in 0..args.devices {
        let args = args.clone();
        let client = client.clone();
        let config_client = config_client.clone();
        devices.spawn(async move {
            if let Err(e) = run_device(index, args, client, config_client).await {
                error!("Device {} stopped: {:#}", index, e);
            }
        });
    }

    tokio::select! {
        _ = async { while devices.join_next().await.is_some() {} } => {
            warn!("All devices stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Drives one simulated enclosure until the process exits.
async fn run_device(
    index: u32,
    args: Args,
    client: AsyncClient,
    config_client: Option<ConfigClient>,
) -> Result<()> {
    let (aviary_id, mac) = args.identity(index);

    let env = Arc::new(Mutex::new(Environment::default()));
    let sensor = SimulatedDht22::new(env.clone(), args.noise, args.failure_rate, None);
    let board = SimulatedBoard::new(env);
    let mut controller = Controller::new(
        aviary_id.clone(),
        sensor,
        board,
        Thermostat::new(args.band(), args.hysteresis),
        FeedingScheduler::new(args.feeding_schedule.as_slice())?,
        args.servo_hold(),
    );

    if let Some(config_client) = &config_client {
        match config_client.fetch(&mac).await {
            Ok(Some(config)) => {
                if let Err(e) = controller.apply_config(&config) {
                    warn!(aviary_id = %aviary_id, "Ignoring backend schedule: {}", e);
                }
            }
            Ok(None) => warn!(aviary_id = %aviary_id, mac = %mac, "Device unknown to backend; using local config"),
            Err(e) => warn!(aviary_id = %aviary_id, "Config pull failed, using local config: {:#}", e),
        }
    }

    info!(aviary_id = %aviary_id, mac = %mac, band = ?controller.band(), "Controller online");

    let mut ticker = tokio::time::interval(args.tick_interval());
    loop {
        ticker.tick().await;

        let now = Utc::now();
        let timestamp = now.timestamp_millis() as f64 / 1000.0;
        let report = controller.tick(Local::now().naive_local(), timestamp).await;

        info!(
            aviary_id = %aviary_id,
            temp = ?report.telemetry.temp,
            hum = ?report.telemetry.hum,
            status = %report.telemetry.status,
            "Tick"
        );

        publish(&client, TELEMETRY_TOPIC, &report.telemetry).await;
        if let Some(alert) = &report.alert {
            publish(&client, ALERT_TOPIC, alert).await;
        }
        if let Some(event) = &report.feeding {
            publish(&client, EVENT_TOPIC, event).await;
        }
    }
}

async fn publish<T: Serialize>(client: &AsyncClient, topic: &str, message: &T) {
    let payload = match serde_json::to_vec(message) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize message for {}: {}", topic, e);
            return;
        }
    };

    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!("Failed to publish to {}: {}", topic, e);
    }
}
