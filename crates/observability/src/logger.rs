//! Structured logger bound to the telemetry log pipeline.
//!
//! Every record is written to stdout (colored text under `debug`, JSON
//! otherwise) and bridged into the OpenTelemetry logger provider. `tracing`
//! spans opened inside the logger's dispatch become OpenTelemetry spans on
//! the provider's tracer.

use opentelemetry::{Context, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracer;
use tracing::dispatcher::{self, DefaultGuard};
use tracing::{Dispatch, Level};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::Settings;
use crate::error::{InitStage, ObservabilityError};
use crate::sink_layer;

// Event levels are static metadata, so each one needs its own call site.
macro_rules! event_at {
    ($level:expr, $logger:expr, $message:expr, $rendered:expr) => {
        match &$rendered {
            Some(attributes) => tracing::event!(
                $level,
                service = %$logger.service,
                version = %$logger.version,
                attributes = %attributes,
                "{}",
                $message
            ),
            None => tracing::event!(
                $level,
                service = %$logger.service,
                version = %$logger.version,
                "{}",
                $message
            ),
        }
    };
}

// Targets that emit while exporting; bridging them back would loop.
const EXPORT_PIPELINE_TARGETS: [&str; 5] = ["opentelemetry", "tonic", "h2", "hyper", "tower"];

/// Handle to the service's structured logger.
///
/// Not installed globally unless [`Logger::init_global`] is called.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    service: String,
    version: String,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("service", &self.service)
            .field("version", &self.version)
            .finish()
    }
}

impl Logger {
    pub(crate) fn new(
        settings: &Settings,
        logger_provider: &SdkLoggerProvider,
        tracer: SdkTracer,
    ) -> Result<Self, ObservabilityError> {
        let env_filter = EnvFilter::try_new(&settings.log_level).map_err(|e| {
            ObservabilityError::init(
                InitStage::Logger,
                format!("invalid log level {:?}: {}", settings.log_level, e),
            )
        })?;

        // Exactly one of these is present
        let pretty_layer = settings
            .debug
            .then(|| tracing_subscriber::fmt::layer().with_ansi(true));
        let json_layer = (!settings.debug).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_ansi(false)
        });

        let bridge = OpenTelemetryTracingBridge::new(logger_provider).with_filter(filter_fn(|metadata| {
            !EXPORT_PIPELINE_TARGETS
                .iter()
                .any(|target| metadata.target().starts_with(target))
        }));

        let subscriber = Registry::default()
            .with(env_filter)
            .with(pretty_layer)
            .with(json_layer)
            .with(bridge)
            .with(OpenTelemetryLayer::new(tracer))
            .with(sink_layer::sink_layer(settings.log_sink.clone()));

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            service: settings.service.name.clone(),
            version: settings.service.version.clone(),
        })
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `f` with this logger as the current subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Makes this logger the thread's default until the guard drops.
    pub fn set_default(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }

    /// Installs this logger as the process-wide subscriber.
    pub fn init_global(&self) -> Result<(), ObservabilityError> {
        dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|e| ObservabilityError::Config(format!("global subscriber already set: {}", e)))
    }

    /// Logs at info level, stamped with the trace and span of `cx`.
    pub fn info(&self, cx: &Context, message: &str) {
        self.log(cx, Level::INFO, message, &[]);
    }

    pub fn warn(&self, cx: &Context, message: &str) {
        self.log(cx, Level::WARN, message, &[]);
    }

    pub fn error(&self, cx: &Context, message: &str) {
        self.log(cx, Level::ERROR, message, &[]);
    }

    pub fn debug(&self, cx: &Context, message: &str) {
        self.log(cx, Level::DEBUG, message, &[]);
    }

    /// Logs `message` at `level` with `attributes` rendered as
    /// `key=value` pairs in an `attributes` field.
    ///
    /// For typed fields, emit `tracing` events inside [`Logger::in_scope`]:
    ///
    /// ```no_run
    /// # fn demo(logger: &service_observability::Logger) {
    /// logger.in_scope(|| tracing::info!(order_id = 42, region = "eu", "Order placed"));
    /// # }
    /// ```
    pub fn log(&self, cx: &Context, level: Level, message: &str, attributes: &[KeyValue]) {
        let rendered = render_attributes(attributes);
        self.emit(cx, || {
            if level == Level::ERROR {
                event_at!(Level::ERROR, self, message, rendered);
            } else if level == Level::WARN {
                event_at!(Level::WARN, self, message, rendered);
            } else if level == Level::INFO {
                event_at!(Level::INFO, self, message, rendered);
            } else if level == Level::DEBUG {
                event_at!(Level::DEBUG, self, message, rendered);
            } else {
                event_at!(Level::TRACE, self, message, rendered);
            }
        });
    }

    fn emit(&self, cx: &Context, log: impl FnOnce()) {
        let _attached = cx.clone().attach();
        self.in_scope(log);
    }
}

fn render_attributes(attributes: &[KeyValue]) -> Option<String> {
    if attributes.is_empty() {
        return None;
    }
    let pairs: Vec<String> = attributes
        .iter()
        .map(|kv| format!("{}={}", kv.key.as_str(), kv.value))
        .collect();
    Some(pairs.join(" "))
}
