use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref FRAMES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_frames_total",
        "Total frames received from the event stream"
    ))
    .unwrap();
    pub static ref DROPPED_FRAMES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_dropped_frames_total",
        "Total malformed or unrecognized frames dropped"
    ))
    .unwrap();
    pub static ref EVENTS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_events_stored_total",
        "Total events persisted, including redeliveries"
    ))
    .unwrap();
    pub static ref POSITIONS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_positions_stored_total",
        "Total new position rows written"
    ))
    .unwrap();
    pub static ref INGEST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_ingest_failures_total",
        "Total events whose ingestion was abandoned"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database write failures"
    ))
    .unwrap();
    pub static ref RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_reconnects_total",
        "Total scheduled stream reconnects"
    ))
    .unwrap();
    pub static ref CONNECTED: IntGauge = IntGauge::with_opts(Opts::new(
        "ingestor_stream_connected",
        "1 while the event stream is open"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to persist and reconcile one event"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(FRAMES_TOTAL.clone()),
        Box::new(DROPPED_FRAMES_TOTAL.clone()),
        Box::new(EVENTS_STORED_TOTAL.clone()),
        Box::new(POSITIONS_STORED_TOTAL.clone()),
        Box::new(INGEST_FAILURES_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(RECONNECTS_TOTAL.clone()),
        Box::new(CONNECTED.clone()),
        Box::new(INGEST_LATENCY_SECONDS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
