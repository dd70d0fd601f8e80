use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total bus messages dropped as malformed"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_persisted_total",
        "Total sensor readings written to storage"
    ))
    .unwrap();
    pub static ref THROTTLED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_throttled_total",
        "Total bus messages skipped by the per-device save interval"
    ))
    .unwrap();
    pub static ref READINGS_PRUNED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_pruned_total",
        "Total readings deleted by the retention window"
    ))
    .unwrap();
    pub static ref ALERTS_RAISED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ingestor_alerts_raised_total", "Alerts created, by type"),
        &["alert_type"]
    )
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to process one telemetry sample"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_PERSISTED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(THROTTLED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(READINGS_PRUNED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_RAISED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
