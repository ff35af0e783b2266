//! Service Observability - OpenTelemetry setup and instrumentation helpers
//!
//! This crate wires tracing, metrics and logging for a service process and
//! provides wrappers so application code can emit spans, measurements and
//! structured logs without repeating provider boilerplate.
//!
//! # Features
//!
//! - One [`Provider`] owning the trace, metric and log pipelines (OTLP/gRPC,
//!   or stdout under `debug`) with a single coordinated shutdown
//! - Idempotent, concurrency-safe [`MetricRegistry`] and a prebuilt
//!   [`CommonMetrics`] set
//! - [`Tracer`]/[`Span`] wrappers mapping operation results to span status
//! - Tower middleware for HTTP servers and decorators for database handles
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use service_observability::{Provider, Settings, SpanOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::new("my-service")
//!     .with_endpoint("otel-collector:4317")
//!     .with_sampling_ratio(0.25);
//! let provider = Provider::init(settings)?;
//!
//! let parent = opentelemetry::Context::new();
//! provider.tracer().with_span(&parent, "load-config", SpanOptions::new(), |cx, _span| {
//!     provider.logger().info(cx, "Loading configuration");
//!     Ok::<_, std::io::Error>(())
//! })?;
//!
//! provider.shutdown(Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Variables
//!
//! Read by [`Settings::from_env`]:
//!
//! - `OTEL_SERVICE_NAME` or `SERVICE_NAME` - Service name
//! - `OTEL_SERVICE_VERSION` or `SERVICE_VERSION` - Service version
//! - `DEPLOYMENT_ENVIRONMENT` - Deployment environment
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - OTLP endpoint
//! - `OTEL_EXPORTER_OTLP_HEADERS` - Export headers as `key=value,key2=value2`
//! - `OTEL_TRACES_SAMPLER_ARG` - Sampling ratio
//! - `OTEL_LOG_LEVEL` or `RUST_LOG` - Log level filter
//! - `OTEL_DEBUG` - Export to stdout instead of OTLP

pub mod config;
pub mod error;
mod exporter;
pub mod logger;
pub mod metrics;
pub mod middleware;
pub mod resource;
mod sink_layer;
pub mod span;
pub mod telemetry;

pub use config::{LogSink, Settings, TlsSettings};
pub use error::{InitStage, ObservabilityError, ShutdownError, Signal, SignalFailure};
pub use exporter::METRIC_EXPORT_INTERVAL;
pub use logger::Logger;
pub use metrics::{CommonMetrics, InstrumentKind, InstrumentOptions, MetricRegistry};
pub use middleware::{DbTracer, HttpTelemetry, HttpTelemetryLayer, TracedDatabase};
pub use resource::ResourceDescriptor;
pub use span::{Span, SpanOptions, Tracer};
pub use telemetry::Provider;
