use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, ObservableGauge, UpDownCounter};
use tracing::info;

use super::registry::{InstrumentOptions, MetricRegistry};
use crate::error::ObservabilityError;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
pub const HTTP_ACTIVE_REQUESTS: &str = "http_active_requests";
pub const DB_CONNECTIONS_ACTIVE: &str = "db_connections_active";
pub const DB_QUERIES_TOTAL: &str = "db_queries_total";
pub const DB_QUERY_DURATION: &str = "db_query_duration_seconds";
pub const ERRORS_TOTAL: &str = "errors_total";
pub const START_TIME: &str = "start_time_seconds";

const HTTP_DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const DB_DURATION_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

static PROCESS_START: OnceCell<i64> = OnceCell::new();

/// Unix timestamp (seconds) of the first call in this process.
fn process_start_seconds() -> i64 {
    *PROCESS_START.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default()
    })
}

/// Instruments shared by the HTTP and database adapters.
#[derive(Clone)]
pub struct CommonMetrics {
    pub http_requests_total: Counter<u64>,
    pub http_request_duration: Histogram<f64>,
    pub http_active_requests: UpDownCounter<i64>,
    pub db_connections_active: UpDownCounter<i64>,
    pub db_queries_total: Counter<u64>,
    pub db_query_duration: Histogram<f64>,
    pub errors_total: Counter<u64>,
    pub start_time: ObservableGauge<i64>,
}

impl std::fmt::Debug for CommonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonMetrics").finish_non_exhaustive()
    }
}

impl CommonMetrics {
    /// Registers the common instruments in a fixed order, stopping at the
    /// first failure.
    pub fn new(registry: &MetricRegistry) -> Result<Self, ObservabilityError> {
        let none = InstrumentOptions::new();
        let seconds = InstrumentOptions::new().with_unit("s");

        let http_requests_total = registry.counter(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests", &none)?;
        let http_request_duration = registry.histogram(
            HTTP_REQUEST_DURATION,
            "Duration of HTTP requests in seconds",
            &seconds.clone().with_boundaries(HTTP_DURATION_BUCKETS.to_vec()),
        )?;
        let http_active_requests =
            registry.up_down_counter(HTTP_ACTIVE_REQUESTS, "Number of active HTTP requests", &none)?;
        let db_connections_active =
            registry.up_down_counter(DB_CONNECTIONS_ACTIVE, "Number of active database connections", &none)?;
        let db_queries_total = registry.counter(DB_QUERIES_TOTAL, "Total number of database queries", &none)?;
        let db_query_duration = registry.histogram(
            DB_QUERY_DURATION,
            "Duration of database queries in seconds",
            &seconds.clone().with_boundaries(DB_DURATION_BUCKETS.to_vec()),
        )?;
        let errors_total = registry.counter(ERRORS_TOTAL, "Total number of errors", &none)?;

        let started = process_start_seconds();
        let start_time = registry.gauge(
            START_TIME,
            "Unix timestamp of when the application started",
            move |observer| observer.observe(started, &[]),
            &seconds,
        )?;

        info!(metrics = registry.len(), "Common metrics registered");

        Ok(Self {
            http_requests_total,
            http_request_duration,
            http_active_requests,
            db_connections_active,
            db_queries_total,
            db_query_duration,
            errors_total,
            start_time,
        })
    }
}
