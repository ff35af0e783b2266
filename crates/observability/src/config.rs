//! Configuration for the telemetry provider

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Sink for formatted log lines (e.g. a test buffer or a UI panel). Called from the logging layer; must not block.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

pub const DEFAULT_ENDPOINT: &str = "localhost:4317";
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of the instrumented service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    /// Deployment environment, e.g. "development", "staging", "production"
    pub environment: String,
}

/// OTLP exporter settings shared by all three signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterSettings {
    /// gRPC collector endpoint, `host:port` or a full URL
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub export_timeout: Duration,
    pub batch_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingSettings {
    #[serde(deserialize_with = "deserialize_ratio")]
    sampling_ratio: f64,
}

impl TracingSettings {
    pub fn new(sampling_ratio: f64) -> Self {
        Self {
            sampling_ratio: clamp_ratio(sampling_ratio),
        }
    }

    /// Fraction of traces to record, always within `[0, 1]`.
    pub fn sampling_ratio(&self) -> f64 {
        self.sampling_ratio
    }

    pub fn set_sampling_ratio(&mut self, ratio: f64) {
        self.sampling_ratio = clamp_ratio(ratio);
    }
}

/// PEM files used to build the gRPC TLS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub ca_certificate: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub domain_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Plaintext transport. Mutually exclusive with `tls`.
    pub insecure: bool,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

/// Telemetry provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    pub service: ServiceInfo,
    pub exporter: ExporterSettings,
    pub tracing: TracingSettings,
    pub security: SecuritySettings,

    /// Extra resource attributes attached to every signal
    #[serde(default)]
    pub resource_attributes: BTreeMap<String, String>,

    /// Export to stdout instead of the OTLP collector
    #[serde(default)]
    pub debug: bool,

    /// Log filter directive (e.g. "info", "debug", "my_crate=trace")
    pub log_level: String,

    /// Optional sink for each formatted log line. Not serialized.
    #[serde(skip)]
    pub log_sink: Option<LogSink>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("service", &self.service)
            .field("exporter", &self.exporter)
            .field("tracing", &self.tracing)
            .field("security", &self.security)
            .field("resource_attributes", &self.resource_attributes)
            .field("debug", &self.debug)
            .field("log_level", &self.log_level)
            .field("log_sink", &self.log_sink.as_ref().map(|_| "Some(LogSink)"))
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new("unknown")
    }
}

impl Settings {
    /// Development defaults for the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service: ServiceInfo {
                name: service_name.into(),
                version: "1.0.0".to_string(),
                environment: "development".to_string(),
            },
            exporter: ExporterSettings {
                endpoint: DEFAULT_ENDPOINT.to_string(),
                headers: BTreeMap::new(),
                export_timeout: DEFAULT_EXPORT_TIMEOUT,
                batch_timeout: DEFAULT_BATCH_TIMEOUT,
            },
            tracing: TracingSettings::new(1.0),
            security: SecuritySettings {
                insecure: true,
                tls: None,
            },
            resource_attributes: BTreeMap::new(),
            debug: false,
            log_level: "info".to_string(),
            log_sink: None,
        }
    }

    /// Set service name, version and deployment environment
    pub fn with_service_info(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        self.service = ServiceInfo {
            name: name.into(),
            version: version.into(),
            environment: environment.into(),
        };
        self
    }

    /// Set OTLP endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.exporter.endpoint = endpoint.into();
        self
    }

    /// Add a header sent with every export request
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exporter.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.exporter
            .headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.exporter.export_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.exporter.batch_timeout = timeout;
        self
    }

    /// Set the fraction of traces to sample, clamped to `[0, 1]`
    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.tracing.set_sampling_ratio(ratio);
        self
    }

    /// Add resource attribute
    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.resource_attributes.insert(key.into(), value.to_string());
        self
    }

    pub fn with_resource_attributes<K, V>(mut self, attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        self.resource_attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    /// Export every signal to stdout instead of the collector
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Toggle plaintext transport. Clears any TLS settings.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.security.insecure = insecure;
        self.security.tls = None;
        self
    }

    /// Use TLS for the collector connection. Disables insecure mode.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.security.insecure = false;
        self.security.tls = Some(tls);
        self
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Sink for formatted log lines. Called from the logging layer; must not block.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn sampling_ratio(&self) -> f64 {
        self.tracing.sampling_ratio()
    }

    /// Collector URL with a scheme matching the transport security.
    pub fn endpoint_url(&self) -> String {
        let endpoint = self.exporter.endpoint.trim();
        if endpoint.contains("://") {
            endpoint.to_string()
        } else if self.security.insecure {
            format!("http://{}", endpoint)
        } else {
            format!("https://{}", endpoint)
        }
    }

    /// Build from environment variables
    ///
    /// Reads:
    /// - `OTEL_SERVICE_NAME` or `SERVICE_NAME` → service name
    /// - `OTEL_SERVICE_VERSION` or `SERVICE_VERSION` → service version
    /// - `DEPLOYMENT_ENVIRONMENT` → environment
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT` → endpoint
    /// - `OTEL_EXPORTER_OTLP_HEADERS` → headers (`key=value,key2=value2`)
    /// - `OTEL_TRACES_SAMPLER_ARG` → sampling ratio
    /// - `OTEL_LOG_LEVEL` or `RUST_LOG` → log level
    /// - `OTEL_DEBUG` → debug (`1`/`true`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|key| lookup(key));

        let mut settings =
            Self::new(first(&["OTEL_SERVICE_NAME", "SERVICE_NAME"]).unwrap_or_else(|| "unknown".to_string()));

        if let Some(version) = first(&["OTEL_SERVICE_VERSION", "SERVICE_VERSION"]) {
            settings.service.version = version;
        }
        if let Some(environment) = lookup("DEPLOYMENT_ENVIRONMENT") {
            settings.service.environment = environment;
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            settings.exporter.endpoint = endpoint;
        }
        if let Some(headers) = lookup("OTEL_EXPORTER_OTLP_HEADERS") {
            settings.exporter.headers.extend(parse_header_list(&headers));
        }
        if let Some(ratio) = lookup("OTEL_TRACES_SAMPLER_ARG").and_then(|r| r.trim().parse::<f64>().ok()) {
            settings.tracing.set_sampling_ratio(ratio);
        }
        if let Some(level) = first(&["OTEL_LOG_LEVEL", "RUST_LOG"]) {
            settings.log_level = level;
        }
        if let Some(debug) = lookup("OTEL_DEBUG") {
            settings.debug = matches!(debug.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        settings
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

fn deserialize_ratio<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_ratio)
}

fn parse_header_list(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(',').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    })
}
