//! Provider lifecycle: builds the resource, the three signal pipelines and
//! the handles derived from them, and shuts them down together.
//!
//! Nothing is installed process-wide unless [`Provider::install_global`] is
//! called; the handles are meant to be threaded through the application.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::InstrumentationScope;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{InitStage, ObservabilityError, ShutdownError, Signal, SignalFailure};
use crate::exporter;
use crate::logger::Logger;
use crate::metrics::{CommonMetrics, MetricRegistry};
use crate::resource::ResourceDescriptor;
use crate::span::Tracer;

/// Deadline used when tearing down pipelines after a failed initialization.
const ABANDON_TIMEOUT: Duration = Duration::from_secs(5);

/// The three signal providers, shut down as a unit.
struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Pipelines {
    /// Builds traces, then metrics, then logs. A failing step shuts down the
    /// providers built before it.
    fn build(settings: &Settings, resource: &ResourceDescriptor) -> Result<Self, ObservabilityError> {
        let tracer = exporter::build_tracer_provider(settings, resource)?;

        let meter = match exporter::build_meter_provider(settings, resource) {
            Ok(meter) => meter,
            Err(e) => {
                abandon(Signal::Traces, tracer.shutdown_with_timeout(ABANDON_TIMEOUT));
                return Err(e);
            }
        };

        let logger = match exporter::build_logger_provider(settings, resource) {
            Ok(logger) => logger,
            Err(e) => {
                abandon(Signal::Traces, tracer.shutdown_with_timeout(ABANDON_TIMEOUT));
                abandon(Signal::Metrics, meter.shutdown_with_timeout(ABANDON_TIMEOUT));
                return Err(e);
            }
        };

        Ok(Self { tracer, meter, logger })
    }

    /// Attempts every provider regardless of earlier failures.
    fn shutdown(&self, timeout: Duration) -> Vec<SignalFailure> {
        let outcomes = [
            (Signal::Traces, self.tracer.shutdown_with_timeout(timeout)),
            (Signal::Metrics, self.meter.shutdown_with_timeout(timeout)),
            (Signal::Logs, self.logger.shutdown_with_timeout(timeout)),
        ];

        outcomes
            .into_iter()
            .filter_map(|(signal, outcome)| outcome.err().map(|error| SignalFailure { signal, error }))
            .collect()
    }

    fn force_flush(&self) -> Vec<SignalFailure> {
        let outcomes = [
            (Signal::Traces, self.tracer.force_flush()),
            (Signal::Metrics, self.meter.force_flush()),
            (Signal::Logs, self.logger.force_flush()),
        ];

        outcomes
            .into_iter()
            .filter_map(|(signal, outcome)| outcome.err().map(|error| SignalFailure { signal, error }))
            .collect()
    }

    fn abandon(&self) {
        abandon(Signal::Traces, self.tracer.shutdown_with_timeout(ABANDON_TIMEOUT));
        abandon(Signal::Metrics, self.meter.shutdown_with_timeout(ABANDON_TIMEOUT));
        abandon(Signal::Logs, self.logger.shutdown_with_timeout(ABANDON_TIMEOUT));
    }
}

fn abandon(signal: Signal, outcome: OTelSdkResult) {
    if let Err(error) = outcome {
        warn!(%signal, %error, "Failed to shut down after aborted initialization");
    }
}

/// Owns the telemetry pipelines of one service process.
///
/// Cloning is not supported; share it behind an `Arc` or hand out the
/// individual handles instead.
pub struct Provider {
    settings: Settings,
    resource: ResourceDescriptor,
    pipelines: Pipelines,
    sdk_tracer: SdkTracer,
    tracer: Tracer,
    meter: Meter,
    logger: Logger,
    registry: Arc<MetricRegistry>,
    metrics: Arc<CommonMetrics>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("settings", &self.settings)
            .field("resource", &self.resource)
            .field("logger", &self.logger)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Builds every pipeline described by `settings`.
    ///
    /// Stages run in order (resource, trace exporter, metric exporter, log
    /// exporter, logger, common metrics) and the first failure is returned
    /// with its stage. Without `debug`, this must be called from within a
    /// Tokio runtime.
    pub fn init(settings: Settings) -> Result<Self, ObservabilityError> {
        let resource = ResourceDescriptor::from_settings(&settings)?;
        let pipelines = Pipelines::build(&settings, &resource)?;

        match Self::assemble(settings, resource, &pipelines) {
            Ok(handles) => {
                let provider = handles.into_provider(pipelines);
                info!(
                    service.name = %provider.settings.service.name,
                    service.version = %provider.settings.service.version,
                    deployment.environment = %provider.settings.service.environment,
                    debug = provider.settings.debug,
                    "Telemetry initialized"
                );
                Ok(provider)
            }
            Err(e) => {
                pipelines.abandon();
                Err(e)
            }
        }
    }

    fn assemble(
        settings: Settings,
        resource: ResourceDescriptor,
        pipelines: &Pipelines,
    ) -> Result<Handles, ObservabilityError> {
        let scope = InstrumentationScope::builder(settings.service.name.clone())
            .with_version(settings.service.version.clone())
            .build();

        let sdk_tracer = pipelines.tracer.tracer_with_scope(scope.clone());
        let meter = pipelines.meter.meter_with_scope(scope);
        let logger = Logger::new(&settings, &pipelines.logger, sdk_tracer.clone())?;

        let registry = Arc::new(MetricRegistry::new(meter.clone()));
        let metrics = CommonMetrics::new(&registry)
            .map_err(|e| ObservabilityError::init(InitStage::CommonMetrics, e))?;

        Ok(Handles {
            settings,
            resource,
            tracer: Tracer::new(sdk_tracer.clone()),
            sdk_tracer,
            meter,
            logger,
            registry,
            metrics: Arc::new(metrics),
        })
    }

    /// Tracer wrapper producing [`Span`](crate::Span)s.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The underlying SDK tracer, for `tracing-opentelemetry` or raw OTel use.
    pub fn sdk_tracer(&self) -> &SdkTracer {
        &self.sdk_tracer
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn registry(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.registry)
    }

    /// The instruments registered during initialization.
    pub fn metrics(&self) -> Arc<CommonMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// W3C trace-context propagator for the HTTP adapter and outbound calls.
    pub fn propagator(&self) -> Arc<dyn TextMapPropagator + Send + Sync> {
        Arc::clone(&self.propagator)
    }

    /// Exports everything buffered so far on all three signals.
    pub fn force_flush(&self) -> Result<(), ObservabilityError> {
        let failures = self.pipelines.force_flush();
        if failures.is_empty() {
            return Ok(());
        }
        let message = failures
            .iter()
            .map(|failure| format!("{}: {}", failure.signal, failure.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ObservabilityError::Flush(message))
    }

    /// Shuts down all three providers, each bounded by `timeout`.
    ///
    /// Every provider is attempted; all failures are reported together. A
    /// second call reports the providers as already shut down.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let failures = self.pipelines.shutdown(timeout);
        match ShutdownError::from_failures(failures) {
            None => {
                info!(service.name = %self.settings.service.name, "Telemetry shut down");
                Ok(())
            }
            Some(error) => {
                warn!(service.name = %self.settings.service.name, %error, "Telemetry shutdown incomplete");
                Err(error)
            }
        }
    }

    /// Installs the tracer and meter providers, the propagator and the
    /// logger as process-wide defaults.
    ///
    /// Fails without installing anything when a global `tracing` subscriber
    /// is already set.
    pub fn install_global(&self) -> Result<(), ObservabilityError> {
        self.logger.init_global()?;
        global::set_tracer_provider(self.pipelines.tracer.clone());
        global::set_meter_provider(self.pipelines.meter.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());
        info!(service.name = %self.settings.service.name, "Telemetry installed globally");
        Ok(())
    }
}

/// Everything derived from the pipelines, built before the provider exists
/// so a failure can still tear the pipelines down.
struct Handles {
    settings: Settings,
    resource: ResourceDescriptor,
    sdk_tracer: SdkTracer,
    tracer: Tracer,
    meter: Meter,
    logger: Logger,
    registry: Arc<MetricRegistry>,
    metrics: Arc<CommonMetrics>,
}

impl Handles {
    fn into_provider(self, pipelines: Pipelines) -> Provider {
        Provider {
            settings: self.settings,
            resource: self.resource,
            pipelines,
            sdk_tracer: self.sdk_tracer,
            tracer: self.tracer,
            meter: self.meter,
            logger: self.logger,
            registry: self.registry,
            metrics: self.metrics,
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }
}
