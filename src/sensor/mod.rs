use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;

pub mod switch;

pub use switch::SwitchModule;

/// A named reading, `<module>.<metric>`.
pub type Measurement = (String, f64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub unit: String,
    pub precision: f64,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub sensor: String,
}

/// A device built on the GPIO interface that reports measurements.
pub trait SensorModule: Send + Sync {
    fn name(&self) -> &str;
    fn read_data(&self) -> Result<Vec<Measurement>>;
    /// Metadata keyed by metric name, without the module prefix.
    fn meta_data(&self) -> BTreeMap<String, MetricMeta>;
}
