use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device unknown: {0}")]
    DeviceUnknown(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device not ready: {0}")]
    NotReady(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
