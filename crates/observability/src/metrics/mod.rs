//! Instrument registry and the common metric set used by the adapters.

pub mod common;
mod registry;

use std::fmt;

pub use common::CommonMetrics;
pub use registry::{InstrumentOptions, MetricRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Counter,
    Histogram,
    UpDownCounter,
    ObservableGauge,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Histogram => "histogram",
            Self::UpDownCounter => "up/down counter",
            Self::ObservableGauge => "gauge",
        };
        f.write_str(name)
    }
}
