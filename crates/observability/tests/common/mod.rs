//! Common test utilities: tracer and meter providers backed by in-memory
//! exporters, plus helpers to read back what was recorded.

use std::sync::Arc;

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use service_observability::{CommonMetrics, MetricRegistry, Tracer};

pub struct Harness {
    pub span_exporter: InMemorySpanExporter,
    pub tracer_provider: SdkTracerProvider,
    pub metric_exporter: InMemoryMetricExporter,
    pub meter_provider: SdkMeterProvider,
    pub tracer: Tracer,
    pub registry: Arc<MetricRegistry>,
    pub metrics: Arc<CommonMetrics>,
}

impl Harness {
    pub fn new() -> Self {
        let span_exporter = InMemorySpanExporter::default();
        let tracer_provider = SdkTracerProvider::builder()
            .with_simple_exporter(span_exporter.clone())
            .build();

        let metric_exporter = InMemoryMetricExporter::default();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metric_exporter.clone()).build())
            .build();

        let tracer = Tracer::new(tracer_provider.tracer("integration-tests"));
        let registry = Arc::new(MetricRegistry::new(meter_provider.meter("integration-tests")));
        let metrics = Arc::new(CommonMetrics::new(&registry).expect("common metrics register"));

        Self {
            span_exporter,
            tracer_provider,
            metric_exporter,
            meter_provider,
            tracer,
            registry,
            metrics,
        }
    }

    /// Spans ended so far, in end order.
    pub fn spans(&self) -> Vec<SpanData> {
        self.span_exporter.get_finished_spans().expect("finished spans")
    }

    #[allow(dead_code)]
    pub fn span(&self, name: &str) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no span named {name}"))
    }

    /// Flushes the meter provider and returns the latest cumulative export.
    fn collect(&self) -> ResourceMetrics {
        self.meter_provider.force_flush().expect("metrics flush");
        self.metric_exporter
            .get_finished_metrics()
            .expect("finished metrics")
            .pop()
            .expect("at least one export")
    }

    /// Data points of a u64 counter as (value, attributes).
    #[allow(dead_code)]
    pub fn u64_sum(&self, name: &str) -> Vec<(u64, Vec<KeyValue>)> {
        let metrics = self.collect();
        let mut points = Vec::new();
        for scope in metrics.scope_metrics() {
            for metric in scope.metrics().filter(|m| m.name() == name) {
                if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                    for point in sum.data_points() {
                        points.push((point.value(), point.attributes().cloned().collect()));
                    }
                }
            }
        }
        points
    }

    /// Total of an i64 up/down counter across all attribute sets.
    #[allow(dead_code)]
    pub fn i64_sum_total(&self, name: &str) -> i64 {
        let metrics = self.collect();
        let mut total = 0;
        for scope in metrics.scope_metrics() {
            for metric in scope.metrics().filter(|m| m.name() == name) {
                if let AggregatedMetrics::I64(MetricData::Sum(sum)) = metric.data() {
                    total += sum.data_points().map(|point| point.value()).sum::<i64>();
                }
            }
        }
        total
    }

    /// Observation count of an f64 histogram across all attribute sets.
    #[allow(dead_code)]
    pub fn histogram_count(&self, name: &str) -> u64 {
        let metrics = self.collect();
        let mut count = 0;
        for scope in metrics.scope_metrics() {
            for metric in scope.metrics().filter(|m| m.name() == name) {
                if let AggregatedMetrics::F64(MetricData::Histogram(histogram)) = metric.data() {
                    count += histogram.data_points().map(|point| point.count()).sum::<u64>();
                }
            }
        }
        count
    }
}

/// Value of `key` among `attributes`, rendered as a string.
#[allow(dead_code)]
pub fn attribute(attributes: &[KeyValue], key: &str) -> Option<String> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}
