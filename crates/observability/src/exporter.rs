//! Exporter selection and provider construction for each signal.
//!
//! Under `debug` every signal goes to stdout. Otherwise each signal gets its
//! own OTLP/gRPC exporter built from the shared exporter settings.

use std::fs;
use std::path::Path;
use std::time::Duration;

use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::logs::{BatchLogProcessor, SdkLoggerProvider};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, Sampler, SdkTracerProvider};
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::info;

use crate::config::{Settings, TlsSettings};
use crate::error::{InitStage, ObservabilityError};
use crate::resource::ResourceDescriptor;

/// Fixed collection interval of the periodic metric reader.
pub const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Shared OTLP transport options, validated once per signal.
struct OtlpTransport {
    endpoint: String,
    timeout: Duration,
    metadata: MetadataMap,
    tls: Option<ClientTlsConfig>,
}

impl OtlpTransport {
    fn from_settings(settings: &Settings, stage: InitStage) -> Result<Self, ObservabilityError> {
        let mut metadata = MetadataMap::new();
        for (key, value) in &settings.exporter.headers {
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|e| ObservabilityError::init(stage, format!("invalid header name {:?}: {}", key, e)))?;
            let value = MetadataValue::try_from(value.as_str())
                .map_err(|e| ObservabilityError::init(stage, format!("invalid value for header {}: {}", key, e)))?;
            metadata.insert(name, value);
        }

        let tls = if settings.security.insecure {
            None
        } else {
            Some(tls_config(settings.security.tls.as_ref(), stage)?)
        };

        Ok(Self {
            endpoint: settings.endpoint_url(),
            timeout: settings.exporter.export_timeout,
            metadata,
            tls,
        })
    }
}

fn tls_config(tls: Option<&TlsSettings>, stage: InitStage) -> Result<ClientTlsConfig, ObservabilityError> {
    let mut config = ClientTlsConfig::new().with_native_roots();
    let Some(tls) = tls else {
        return Ok(config);
    };

    if let Some(ca) = &tls.ca_certificate {
        config = config.ca_certificate(Certificate::from_pem(read_pem(ca, stage)?));
    }
    match (&tls.client_certificate, &tls.client_key) {
        (Some(cert), Some(key)) => {
            config = config.identity(Identity::from_pem(read_pem(cert, stage)?, read_pem(key, stage)?));
        }
        (None, None) => {}
        _ => {
            return Err(ObservabilityError::init(
                stage,
                "client certificate and client key must be configured together",
            ))
        }
    }
    if let Some(domain) = &tls.domain_name {
        config = config.domain_name(domain.clone());
    }
    Ok(config)
}

fn read_pem(path: &Path, stage: InitStage) -> Result<Vec<u8>, ObservabilityError> {
    fs::read(path).map_err(|e| ObservabilityError::init(stage, format!("cannot read {}: {}", path.display(), e)))
}

/// Builds the tracer provider: parent-based ratio sampler, batch span
/// processor flushing every `batch_timeout`.
pub(crate) fn build_tracer_provider(
    settings: &Settings,
    resource: &ResourceDescriptor,
) -> Result<SdkTracerProvider, ObservabilityError> {
    let stage = InitStage::TraceExporter;
    let batch_config = BatchConfigBuilder::default()
        .with_scheduled_delay(settings.exporter.batch_timeout)
        .build();

    let processor = if settings.debug {
        BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
            .with_batch_config(batch_config)
            .build()
    } else {
        let transport = OtlpTransport::from_settings(settings, stage)?;
        let mut builder = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(transport.endpoint.clone())
            .with_timeout(transport.timeout)
            .with_metadata(transport.metadata);
        if let Some(tls) = transport.tls {
            builder = builder.with_tls_config(tls);
        }
        let exporter = builder.build().map_err(|e| ObservabilityError::init(stage, e))?;

        info!(otlp.endpoint = %transport.endpoint, "OTLP trace export enabled");
        BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build()
    };

    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(settings.sampling_ratio())));

    Ok(SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_span_processor(processor)
        .with_resource(resource.resource().clone())
        .build())
}

/// Builds the meter provider with a periodic reader on a fixed interval.
pub(crate) fn build_meter_provider(
    settings: &Settings,
    resource: &ResourceDescriptor,
) -> Result<SdkMeterProvider, ObservabilityError> {
    let stage = InitStage::MetricExporter;

    // Readers are generic over their exporter, so each branch attaches its own.
    let builder = if settings.debug {
        SdkMeterProvider::builder().with_reader(
            PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
                .with_interval(METRIC_EXPORT_INTERVAL)
                .build(),
        )
    } else {
        let transport = OtlpTransport::from_settings(settings, stage)?;
        let mut builder = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(transport.endpoint.clone())
            .with_timeout(transport.timeout)
            .with_metadata(transport.metadata);
        if let Some(tls) = transport.tls {
            builder = builder.with_tls_config(tls);
        }
        let exporter = builder.build().map_err(|e| ObservabilityError::init(stage, e))?;

        info!(otlp.endpoint = %transport.endpoint, "OTLP metric export enabled");
        SdkMeterProvider::builder().with_reader(
            PeriodicReader::builder(exporter)
                .with_interval(METRIC_EXPORT_INTERVAL)
                .build(),
        )
    };

    Ok(builder.with_resource(resource.resource().clone()).build())
}

/// Builds the logger provider with a batch log processor.
pub(crate) fn build_logger_provider(
    settings: &Settings,
    resource: &ResourceDescriptor,
) -> Result<SdkLoggerProvider, ObservabilityError> {
    let stage = InitStage::LogExporter;
    let batch_config = opentelemetry_sdk::logs::BatchConfigBuilder::default()
        .with_scheduled_delay(settings.exporter.batch_timeout)
        .build();

    let processor = if settings.debug {
        BatchLogProcessor::builder(opentelemetry_stdout::LogExporter::default())
            .with_batch_config(batch_config)
            .build()
    } else {
        let transport = OtlpTransport::from_settings(settings, stage)?;
        let mut builder = LogExporter::builder()
            .with_tonic()
            .with_endpoint(transport.endpoint.clone())
            .with_timeout(transport.timeout)
            .with_metadata(transport.metadata);
        if let Some(tls) = transport.tls {
            builder = builder.with_tls_config(tls);
        }
        let exporter = builder.build().map_err(|e| ObservabilityError::init(stage, e))?;

        info!(otlp.endpoint = %transport.endpoint, "OTLP log export enabled");
        BatchLogProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build()
    };

    Ok(SdkLoggerProvider::builder()
        .with_log_processor(processor)
        .with_resource(resource.resource().clone())
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_header_fails_with_signal_stage() {
        let settings = Settings::new("svc").with_header("bad header", "x");

        let err = OtlpTransport::from_settings(&settings, InitStage::LogExporter)
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(InitStage::LogExporter));
        assert!(err.to_string().contains("bad header"));
    }

    #[test]
    fn test_header_value_must_be_ascii() {
        let settings = Settings::new("svc").with_header("x-team", "caf\u{e9}\n");

        assert!(OtlpTransport::from_settings(&settings, InitStage::TraceExporter).is_err());
    }

    #[test]
    fn test_insecure_transport_has_no_tls() {
        let settings = Settings::new("svc").with_header("authorization", "Bearer t");

        let transport = OtlpTransport::from_settings(&settings, InitStage::TraceExporter).unwrap();
        assert!(transport.tls.is_none());
        assert_eq!(transport.endpoint, "http://localhost:4317");
        assert_eq!(transport.metadata.len(), 1);
        assert_eq!(transport.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_certificate_file_is_reported() {
        let settings = Settings::new("svc").with_tls(TlsSettings {
            ca_certificate: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        });

        let err = OtlpTransport::from_settings(&settings, InitStage::MetricExporter)
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(InitStage::MetricExporter));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_client_identity_requires_both_halves() {
        let settings = Settings::new("svc").with_tls(TlsSettings {
            client_certificate: Some("/tmp/cert.pem".into()),
            ..Default::default()
        });

        assert!(OtlpTransport::from_settings(&settings, InitStage::TraceExporter).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_otlp_mode_builds_all_providers() {
        let settings = Settings::new("svc").with_endpoint("127.0.0.1:1");
        let resource = ResourceDescriptor::from_settings(&settings).unwrap();

        let tracer_provider = build_tracer_provider(&settings, &resource).unwrap();
        let meter_provider = build_meter_provider(&settings, &resource).unwrap();
        let logger_provider = build_logger_provider(&settings, &resource).unwrap();

        let timeout = Duration::from_secs(1);
        let _ = tracer_provider.shutdown_with_timeout(timeout);
        let _ = meter_provider.shutdown_with_timeout(timeout);
        let _ = logger_provider.shutdown_with_timeout(timeout);
    }

    #[test]
    fn test_debug_mode_builds_all_providers() {
        let settings = Settings::new("svc").with_debug(true);
        let resource = ResourceDescriptor::from_settings(&settings).unwrap();

        let tracer_provider = build_tracer_provider(&settings, &resource).unwrap();
        let meter_provider = build_meter_provider(&settings, &resource).unwrap();
        let logger_provider = build_logger_provider(&settings, &resource).unwrap();

        assert!(tracer_provider.shutdown().is_ok());
        assert!(meter_provider.shutdown().is_ok());
        assert!(logger_provider.shutdown().is_ok());
    }
}
