use crate::config::PipelineSettings;
use crate::config_sync::ConfigSync;
use crate::errors::Error;
use crate::health::HealthMonitor;
use crate::model::{
    Alert, Device, DeviceConfig, HealthReport, IngestRequest, IngestResponse, NewDevice, Reading,
    TemperatureAverage,
};
use crate::service::TelemetryService;
use crate::store::Store;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_ALERT_HISTORY_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    service: TelemetryService,
    config_sync: ConfigSync,
    health: HealthMonitor,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, settings: PipelineSettings) -> Self {
        Self {
            service: TelemetryService::new(store.clone(), settings),
            config_sync: ConfigSync::new(store.clone()),
            health: HealthMonitor::new(store, settings.offline_after),
        }
    }

    pub fn service(&self) -> &TelemetryService {
        &self.service
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertHistoryQuery {
    enclosure_id: Option<i32>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingHistoryQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Detail {
    pub detail: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/telemetry", post(ingest_telemetry))
        .route("/api/v1/telemetry/enclosure/{id}/latest", get(latest_reading))
        .route("/api/v1/telemetry/history/{id}", get(reading_history))
        .route("/api/v1/reports/temperature-avg/{id}", get(temperature_average))
        .route("/api/v1/config/{mac}", get(device_config))
        .route("/api/v1/devices", post(register_device))
        .route("/api/v1/alerts", get(open_alerts))
        .route("/api/v1/alerts/history", get(alert_history))
        .route("/api/v1/alerts/{id}/resolve", put(resolve_alert))
        .route("/api/v1/system/health-check", get(health_check))
        .with_state(state)
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let outcome = state.service.ingest_reading(request, Utc::now()).await?;
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            status: "processed".to_string(),
            alerts: outcome.alerts_raised,
        }),
    ))
}

async fn latest_reading(
    State(state): State<AppState>,
    Path(enclosure_id): Path<i32>,
) -> Result<Json<Reading>, AppError> {
    let reading = state
        .service
        .latest_reading(enclosure_id)
        .await?
        .ok_or_else(|| Error::NotFound("No data found".to_string()))?;
    Ok(Json(reading))
}

async fn reading_history(
    State(state): State<AppState>,
    Path(enclosure_id): Path<i32>,
    Query(params): Query<ReadingHistoryQuery>,
) -> Result<Json<Vec<Reading>>, AppError> {
    let readings = state
        .service
        .reading_history(enclosure_id, params.start, params.end, params.limit)
        .await?;
    Ok(Json(readings))
}

async fn temperature_average(
    State(state): State<AppState>,
    Path(enclosure_id): Path<i32>,
) -> Result<Json<TemperatureAverage>, AppError> {
    let average = state
        .service
        .average_temperature(enclosure_id, Utc::now())
        .await?;
    Ok(Json(average))
}

async fn device_config(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<DeviceConfig>, AppError> {
    let config = state.config_sync.config_for(&mac).await?;
    info!(mac = %mac, "Served device config");
    Ok(Json(config))
}

async fn register_device(
    State(state): State<AppState>,
    Json(device): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    if device.mac_address.trim().is_empty() {
        return Err(Error::Validation("mac_address must not be empty".to_string()).into());
    }
    let device = state.service.store().register_device(device).await?;
    info!(device_id = device.device_id, mac = %device.mac_address, "Device registered");
    Ok((StatusCode::CREATED, Json(device)))
}

async fn open_alerts(State(state): State<AppState>) -> Result<Json<Vec<Alert>>, AppError> {
    Ok(Json(state.service.alerts().open_alerts().await?))
}

async fn alert_history(
    State(state): State<AppState>,
    Query(params): Query<AlertHistoryQuery>,
) -> Result<Json<Vec<Alert>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ALERT_HISTORY_LIMIT)
        .clamp(1, 1000);
    let alerts = state
        .service
        .alerts()
        .history(params.enclosure_id, limit)
        .await?;
    Ok(Json(alerts))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<Detail>, AppError> {
    state.service.alerts().resolve(alert_id).await?;
    Ok(Json(Detail {
        detail: "Alert resolved".to_string(),
    }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthReport>, AppError> {
    Ok(Json(state.health.sweep(Utc::now()).await?))
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::DeviceUnknown(_)) | Some(Error::NotFound(_)) | Some(Error::NotReady(_)) => {
                StatusCode::NOT_FOUND
            }
            Some(Error::Conflict(_)) => StatusCode::CONFLICT,
            Some(Error::Validation(_)) | Some(Error::Json(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self.0);
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(Detail { detail })).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum_test::TestServer;
    use serde_json::json;

    async fn server() -> (TestServer, MemoryStore) {
        let store = MemoryStore::new();
        store.add_animal(1, 1).await;
        store.add_climate_profile(1, 18.0, 24.0).await;
        let state = AppState::new(Arc::new(store.clone()), PipelineSettings::default());
        (TestServer::new(create_router(state)).unwrap(), store)
    }

    async fn register(server: &TestServer, mac: &str, enclosure_id: i32) {
        server
            .post("/api/v1/devices")
            .json(&json!({ "mac_address": mac, "enclosure_id": enclosure_id }))
            .await
            .assert_status(StatusCode::CREATED);
    }

    #[tokio::test]
    async fn telemetry_unknown_device_is_404() {
        let (server, _) = server().await;
        let response = server
            .post("/api/v1/telemetry")
            .json(&json!({ "mac_address": "FF:FF", "temperature": 21.0, "humidity": 50.0 }))
            .await;
        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn telemetry_out_of_range_is_422() {
        let (server, _) = server().await;
        register(&server, "AA:01", 1).await;
        let response = server
            .post("/api/v1/telemetry")
            .json(&json!({ "mac_address": "AA:01", "temperature": 140.0, "humidity": 50.0 }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn telemetry_reports_alerts() {
        let (server, store) = server().await;
        register(&server, "AA:01", 1).await;

        let response = server
            .post("/api/v1/telemetry")
            .json(&json!({ "mac_address": "AA:01", "temperature": 26.0, "humidity": 50.0 }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: IngestResponse = response.json();
        assert_eq!(body.status, "processed");
        assert_eq!(body.alerts, vec!["TEMP HIGH: 26.0°C".to_string()]);
        assert_eq!(store.readings().await.len(), 1);

        let latest: Reading = server
            .get("/api/v1/telemetry/enclosure/1/latest")
            .await
            .json();
        assert_eq!(latest.temperature, 26.0);
    }

    #[tokio::test]
    async fn duplicate_device_is_409() {
        let (server, _) = server().await;
        register(&server, "AA:01", 1).await;
        server
            .post("/api/v1/devices")
            .json(&json!({ "mac_address": "AA:01" }))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn config_endpoint() {
        let (server, _) = server().await;
        server
            .get("/api/v1/config/AA:09")
            .await
            .assert_status_not_found();

        register(&server, "AA:01", 1).await;
        let config: DeviceConfig = server.get("/api/v1/config/AA:01").await.json();
        assert_eq!(config.target_temperature_min, 18.0);
        assert_eq!(config.target_temperature_max, 24.0);
    }

    #[tokio::test]
    async fn resolve_flow() {
        let (server, _) = server().await;
        register(&server, "AA:01", 1).await;
        server
            .post("/api/v1/telemetry")
            .json(&json!({ "mac_address": "AA:01", "temperature": 12.0, "humidity": 50.0 }))
            .await
            .assert_status(StatusCode::CREATED);

        let open: Vec<Alert> = server.get("/api/v1/alerts").await.json();
        assert_eq!(open.len(), 1);

        let detail: Detail = server
            .put(&format!("/api/v1/alerts/{}/resolve", open[0].alert_id))
            .await
            .json();
        assert_eq!(detail.detail, "Alert resolved");

        let open: Vec<Alert> = server.get("/api/v1/alerts").await.json();
        assert!(open.is_empty());
        let history: Vec<Alert> = server
            .get("/api/v1/alerts/history")
            .add_query_param("enclosure_id", 1)
            .await
            .json();
        assert_eq!(history.len(), 1);

        server
            .put("/api/v1/alerts/999/resolve")
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn missing_latest_is_404_and_average_defaults() {
        let (server, _) = server().await;
        server
            .get("/api/v1/telemetry/enclosure/3/latest")
            .await
            .assert_status_not_found();

        let average: TemperatureAverage = server
            .get("/api/v1/reports/temperature-avg/3")
            .await
            .json();
        assert_eq!(average.avg_temp_24h, 0.0);
    }

    #[tokio::test]
    async fn health_check_reports_storage() {
        let (server, _) = server().await;
        let report: HealthReport = server.get("/api/v1/system/health-check").await.json();
        assert_eq!(report.status, "System Operational");
        assert_eq!(report.db_connection, "OK");
    }
}
