use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL};
use crate::model::BusTelemetry;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Subscribes to `topic` and forwards every decoded telemetry message to
/// the worker channel. Runs until the channel closes.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    topic: String,
    client_id: String,
    tx: mpsc::Sender<BusTelemetry>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    client.subscribe(&topic, QoS::AtLeastOnce).await?;
    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                match process_message(&publish.payload, &tx).await {
                    Ok(()) => {}
                    Err(Error::ChannelSend) if tx.is_closed() => {
                        info!("Worker channel closed, stopping MQTT subscriber");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Dropping bus message: {}", e);
                        INVALID_MESSAGES_TOTAL.inc();
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // A fresh session loses the subscription.
                info!("Connected to broker");
                client.subscribe(&topic, QoS::AtLeastOnce).await?;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Decodes one payload and hands it to the worker.
///
/// Field-level checks happen in the service; here only the JSON shape
/// matters.
async fn process_message(payload: &[u8], tx: &mpsc::Sender<BusTelemetry>) -> Result<()> {
    let telemetry = serde_json::from_slice::<BusTelemetry>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    match tx.try_send(telemetry) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(telemetry)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(telemetry).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}
