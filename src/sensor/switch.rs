use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::config::{Direction, PinId, PullMode, SwitchConfig};
use crate::error::Result;
use crate::gpio::{EdgeCallback, EdgeEvent, GpioInterface, PlatformDriver};
use crate::sensor::{Measurement, MetricMeta, SensorModule};

/// Counts debounced presses of a switch wired to one input pin.
pub struct SwitchModule<D: PlatformDriver> {
    name: String,
    pin: PinId,
    active_low: bool,
    gpio: Arc<GpioInterface<D>>,
    reported: AtomicU64,
}

impl<D: PlatformDriver> SwitchModule<D> {
    pub fn new(gpio: Arc<GpioInterface<D>>, config: &SwitchConfig) -> Result<Self> {
        gpio.setup(config.pin, Direction::In, config.pull)?;

        let label = config.name.clone();
        let callback: EdgeCallback = Arc::new(move |event: &EdgeEvent| {
            debug!("switch {label}: press at {}ms", event.timestamp_ms);
        });
        gpio.add_event_detect(config.pin, config.edge, Some(callback), config.debounce_ms)?;

        info!(
            "switch {} on pin {}: counting {} edges",
            config.name, config.pin, config.edge
        );

        Ok(Self {
            name: config.name.clone(),
            pin: config.pin,
            // a pulled-up switch shorts the line to ground when closed
            active_low: config.pull == PullMode::Up,
            gpio,
            reported: AtomicU64::new(0),
        })
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    /// Presses accepted by the pin's edge detection. Read from the debounce
    /// state itself, so it stays exact when the callback queue drops events.
    pub fn press_count(&self) -> u64 {
        self.gpio.pin_status(self.pin).map(|s| s.accepted).unwrap_or(0)
    }

    pub fn is_pressed(&self) -> Result<bool> {
        let level = self.gpio.input(self.pin)?;
        Ok(level != self.active_low)
    }

    fn metric(&self, kind: &str, unit: &str, range_high: Option<f64>) -> MetricMeta {
        MetricMeta {
            kind: kind.into(),
            unit: unit.into(),
            precision: 1.0,
            range_low: Some(0.0),
            range_high,
            sensor: "switch".into(),
        }
    }
}

impl<D: PlatformDriver> SensorModule for SwitchModule<D> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Total presses, presses since the previous read, and the current state.
    fn read_data(&self) -> Result<Vec<Measurement>> {
        let pressed = self.is_pressed()?;
        let count = self.press_count();
        let previous = self.reported.swap(count, Ordering::Relaxed);

        Ok(vec![
            (format!("{}.press_count", self.name), count as f64),
            (
                format!("{}.press_delta", self.name),
                count.saturating_sub(previous) as f64,
            ),
            (format!("{}.state", self.name), if pressed { 1.0 } else { 0.0 }),
        ])
    }

    /// Counts are whole presses, so every metric reports a precision of 1.
    fn meta_data(&self) -> BTreeMap<String, MetricMeta> {
        BTreeMap::from([
            ("press_count".to_string(), self.metric("counter", "press", None)),
            ("press_delta".to_string(), self.metric("delta", "press", None)),
            ("state".to_string(), self.metric("gauge", "", Some(1.0))),
        ])
    }
}

impl<D: PlatformDriver> Drop for SwitchModule<D> {
    fn drop(&mut self) {
        if let Err(e) = self.gpio.remove_event_detect(self.pin) {
            warn!("switch {}: removing edge detection: {e}", self.name);
        }
    }
}
