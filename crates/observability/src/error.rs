//! Error types for observability crate

use std::fmt;

use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

use crate::metrics::InstrumentKind;

/// Errors that can occur during observability initialization or operation
#[derive(Error, Debug)]
pub enum ObservabilityError {
    /// A provider initialization stage failed; nothing after it was attempted
    #[error("Failed to initialize {stage}: {message}")]
    InitFailed { stage: InitStage, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An instrument could not be created. Other instruments are unaffected.
    #[error("Failed to create {kind} {name}: {reason}")]
    Instrument {
        kind: InstrumentKind,
        name: String,
        reason: String,
    },

    /// One or more signal providers failed to flush
    #[error("Telemetry flush failed: {0}")]
    Flush(String),

    /// One or more signal providers failed to shut down
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl ObservabilityError {
    pub(crate) fn init(stage: InitStage, message: impl fmt::Display) -> Self {
        Self::InitFailed {
            stage,
            message: message.to_string(),
        }
    }

    /// The failing initialization stage, if this is an initialization error.
    pub fn stage(&self) -> Option<InitStage> {
        match self {
            Self::InitFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Steps of [`Provider::init`](crate::Provider::init), in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Resource,
    TraceExporter,
    MetricExporter,
    LogExporter,
    Logger,
    CommonMetrics,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resource => "resource",
            Self::TraceExporter => "trace exporter",
            Self::MetricExporter => "metric exporter",
            Self::LogExporter => "log exporter",
            Self::Logger => "logger",
            Self::CommonMetrics => "common metrics",
        };
        f.write_str(name)
    }
}

/// The three telemetry signals managed by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Traces => f.write_str("tracer provider"),
            Self::Metrics => f.write_str("meter provider"),
            Self::Logs => f.write_str("logger provider"),
        }
    }
}

/// A single provider that refused to shut down.
#[derive(Debug)]
pub struct SignalFailure {
    pub signal: Signal,
    pub error: OTelSdkError,
}

/// Every shutdown failure observed during one shutdown attempt.
#[derive(Error, Debug)]
pub struct ShutdownError {
    failures: Vec<SignalFailure>,
}

impl ShutdownError {
    pub(crate) fn from_failures(failures: Vec<SignalFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    pub fn failures(&self) -> &[SignalFailure] {
        &self.failures
    }

    /// Whether the given signal is among the failures.
    pub fn failed(&self, signal: Signal) -> bool {
        self.failures.iter().any(|f| f.signal == signal)
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Telemetry shutdown failed: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.signal, failure.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_names_stage() {
        let err = ObservabilityError::init(InitStage::MetricExporter, "connection refused");
        assert_eq!(err.stage(), Some(InitStage::MetricExporter));
        assert_eq!(
            err.to_string(),
            "Failed to initialize metric exporter: connection refused"
        );
    }

    #[test]
    fn test_shutdown_error_joins_all_failures() {
        let err = ShutdownError::from_failures(vec![
            SignalFailure {
                signal: Signal::Traces,
                error: OTelSdkError::AlreadyShutdown,
            },
            SignalFailure {
                signal: Signal::Logs,
                error: OTelSdkError::InternalFailure("boom".into()),
            },
        ])
        .unwrap();

        assert!(err.failed(Signal::Traces));
        assert!(err.failed(Signal::Logs));
        assert!(!err.failed(Signal::Metrics));

        let message = err.to_string();
        assert!(message.contains("tracer provider"));
        assert!(message.contains("logger provider"));
        assert!(message.contains("; "));
    }

    #[test]
    fn test_no_failures_is_not_an_error() {
        assert!(ShutdownError::from_failures(Vec::new()).is_none());
    }
}
