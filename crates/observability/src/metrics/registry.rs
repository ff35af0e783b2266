use std::borrow::Cow;
use std::collections::HashMap;

use opentelemetry::metrics::{AsyncInstrument, Counter, Histogram, Meter, ObservableGauge, UpDownCounter};
use parking_lot::Mutex;
use tracing::debug;

use super::InstrumentKind;
use crate::error::ObservabilityError;

const MAX_NAME_LEN: usize = 255;

/// Optional settings applied when an instrument is first created.
#[derive(Debug, Clone, Default)]
pub struct InstrumentOptions {
    pub unit: Option<String>,
    /// Explicit bucket boundaries; only used by histograms.
    pub boundaries: Option<Vec<f64>>,
}

impl InstrumentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_boundaries(mut self, boundaries: impl Into<Vec<f64>>) -> Self {
        self.boundaries = Some(boundaries.into());
        self
    }
}

#[derive(Default)]
struct Instruments {
    counters: HashMap<String, Counter<u64>>,
    histograms: HashMap<String, Histogram<f64>>,
    up_down_counters: HashMap<String, UpDownCounter<i64>>,
    gauges: HashMap<String, ObservableGauge<i64>>,
}

/// Get-or-create cache of instruments keyed by qualified name.
///
/// One instrument exists per (kind, qualified name) for the registry's
/// lifetime. The first description and options win; later requests with the
/// same name get the cached handle back unchanged. Lookups and creations
/// share one lock so concurrent first requests cannot create duplicates.
pub struct MetricRegistry {
    prefix: Option<String>,
    meter: Meter,
    instruments: Mutex<Instruments>,
}

impl MetricRegistry {
    pub fn new(meter: Meter) -> Self {
        Self {
            prefix: None,
            meter,
            instruments: Mutex::new(Instruments::default()),
        }
    }

    /// Registry whose instrument names are qualified as `{prefix}_{name}`.
    pub fn with_prefix(meter: Meter, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            meter,
            instruments: Mutex::new(Instruments::default()),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn qualified_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, name),
            None => name.to_string(),
        }
    }

    pub fn counter(
        &self,
        name: &str,
        description: &str,
        options: &InstrumentOptions,
    ) -> Result<Counter<u64>, ObservabilityError> {
        let name = self.validated_name(InstrumentKind::Counter, name)?;
        let mut instruments = self.instruments.lock();

        if let Some(counter) = instruments.counters.get(&name) {
            return Ok(counter.clone());
        }

        let mut builder = self
            .meter
            .u64_counter(name.clone())
            .with_description(description.to_string());
        if let Some(unit) = &options.unit {
            builder = builder.with_unit(unit.clone());
        }
        let counter = builder.build();

        debug!(metric.name = %name, "Registered counter");
        instruments.counters.insert(name, counter.clone());
        Ok(counter)
    }

    pub fn histogram(
        &self,
        name: &str,
        description: &str,
        options: &InstrumentOptions,
    ) -> Result<Histogram<f64>, ObservabilityError> {
        let name = self.validated_name(InstrumentKind::Histogram, name)?;
        let mut instruments = self.instruments.lock();

        if let Some(histogram) = instruments.histograms.get(&name) {
            return Ok(histogram.clone());
        }
        if let Some(boundaries) = &options.boundaries {
            validate_boundaries(&name, boundaries)?;
        }

        let mut builder = self
            .meter
            .f64_histogram(name.clone())
            .with_description(description.to_string());
        if let Some(unit) = &options.unit {
            builder = builder.with_unit(unit.clone());
        }
        if let Some(boundaries) = &options.boundaries {
            builder = builder.with_boundaries(boundaries.clone());
        }
        let histogram = builder.build();

        debug!(metric.name = %name, "Registered histogram");
        instruments.histograms.insert(name, histogram.clone());
        Ok(histogram)
    }

    pub fn up_down_counter(
        &self,
        name: &str,
        description: &str,
        options: &InstrumentOptions,
    ) -> Result<UpDownCounter<i64>, ObservabilityError> {
        let name = self.validated_name(InstrumentKind::UpDownCounter, name)?;
        let mut instruments = self.instruments.lock();

        if let Some(counter) = instruments.up_down_counters.get(&name) {
            return Ok(counter.clone());
        }

        let mut builder = self
            .meter
            .i64_up_down_counter(name.clone())
            .with_description(description.to_string());
        if let Some(unit) = &options.unit {
            builder = builder.with_unit(unit.clone());
        }
        let counter = builder.build();

        debug!(metric.name = %name, "Registered up/down counter");
        instruments.up_down_counters.insert(name, counter.clone());
        Ok(counter)
    }

    /// Observable gauge reported through `callback` whenever the meter
    /// collects. A cached gauge keeps its original callback.
    pub fn gauge<F>(
        &self,
        name: &str,
        description: &str,
        callback: F,
        options: &InstrumentOptions,
    ) -> Result<ObservableGauge<i64>, ObservabilityError>
    where
        F: Fn(&dyn AsyncInstrument<i64>) + Send + Sync + 'static,
    {
        let name = self.validated_name(InstrumentKind::ObservableGauge, name)?;
        let mut instruments = self.instruments.lock();

        if let Some(gauge) = instruments.gauges.get(&name) {
            return Ok(gauge.clone());
        }

        let mut builder = self
            .meter
            .i64_observable_gauge(name.clone())
            .with_description(description.to_string())
            .with_callback(callback);
        if let Some(unit) = &options.unit {
            builder = builder.with_unit(unit.clone());
        }
        let gauge = builder.build();

        debug!(metric.name = %name, "Registered observable gauge");
        instruments.gauges.insert(name, gauge.clone());
        Ok(gauge)
    }

    /// Whether an instrument of `kind` exists for the unqualified `name`.
    pub fn contains(&self, kind: InstrumentKind, name: &str) -> bool {
        let name = self.qualified_name(name);
        let instruments = self.instruments.lock();
        match kind {
            InstrumentKind::Counter => instruments.counters.contains_key(&name),
            InstrumentKind::Histogram => instruments.histograms.contains_key(&name),
            InstrumentKind::UpDownCounter => instruments.up_down_counters.contains_key(&name),
            InstrumentKind::ObservableGauge => instruments.gauges.contains_key(&name),
        }
    }

    /// Number of cached instruments across all kinds.
    pub fn len(&self) -> usize {
        let instruments = self.instruments.lock();
        instruments.counters.len()
            + instruments.histograms.len()
            + instruments.up_down_counters.len()
            + instruments.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validated_name(&self, kind: InstrumentKind, name: &str) -> Result<String, ObservabilityError> {
        let qualified = self.qualified_name(name);
        match name_violation(&qualified) {
            None => Ok(qualified),
            Some(reason) => Err(ObservabilityError::Instrument {
                kind,
                name: qualified,
                reason: reason.into_owned(),
            }),
        }
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("prefix", &self.prefix)
            .field("instruments", &self.len())
            .finish()
    }
}

// Instrument name syntax: ALPHA 0*254 ("_" / "." / "-" / "/" / ALPHA / DIGIT)
fn name_violation(name: &str) -> Option<Cow<'static, str>> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Some("name must not be empty".into()),
        Some(first) if !first.is_ascii_alphabetic() => {
            return Some("name must start with an ASCII letter".into())
        }
        Some(_) => {}
    }
    if name.len() > MAX_NAME_LEN {
        return Some(format!("name exceeds {} characters", MAX_NAME_LEN).into());
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))) {
        return Some(format!("invalid character {:?}", bad).into());
    }
    None
}

fn validate_boundaries(name: &str, boundaries: &[f64]) -> Result<(), ObservabilityError> {
    let sorted = boundaries.windows(2).all(|pair| pair[0] < pair[1]);
    if boundaries.iter().any(|b| !b.is_finite()) || !sorted {
        return Err(ObservabilityError::Instrument {
            kind: InstrumentKind::Histogram,
            name: name.to_string(),
            reason: "bucket boundaries must be finite and strictly increasing".to_string(),
        });
    }
    Ok(())
}
