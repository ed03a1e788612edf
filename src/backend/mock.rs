use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use log::debug;

use crate::config::{Direction, Edge, PinId, PullMode};
use crate::error::{GpioError, Result};
use crate::gpio::{EdgeSink, PlatformDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBias {
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEdge {
    Rising,
    Falling,
    Both,
}

/// In-memory driver. Inputs are driven from the outside with [`MockDriver::drive`]
/// or [`MockDriver::inject_edge`]; armed pins forward edges to the interface.
pub struct MockDriver {
    origin: Instant,
    pins: RwLock<HashMap<PinId, Mutex<MockPin>>>, // keyed by pin id
    faults: RwLock<HashMap<PinId, String>>,
    configure_faults: RwLock<HashMap<PinId, String>>,
}

struct MockPin {
    direction: MockDirection,
    bias: MockBias,
    level: bool,
    edge: Option<MockEdge>,
    sink: Option<EdgeSink>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            pins: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            configure_faults: RwLock::new(HashMap::new()),
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> GpioError {
    GpioError::Driver(format!("lock poisoned: {e}"))
}

fn not_requested(pin: PinId) -> GpioError {
    GpioError::Driver(format!("pin {pin} not requested"))
}

fn forwards(armed: MockEdge, observed: Edge) -> bool {
    match armed {
        MockEdge::Both => true,
        MockEdge::Rising => observed == Edge::Rising,
        MockEdge::Falling => observed == Edge::Falling,
    }
}

impl MockDriver {
    /// Makes every subsequent operation on `pin` fail with a driver error.
    pub fn fail_pin(&self, pin: PinId, reason: &str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert(pin, reason.to_string());
        }
    }

    /// Makes only `configure` fail on `pin`, leaving the line usable otherwise.
    pub fn fail_configure(&self, pin: PinId, reason: &str) {
        if let Ok(mut faults) = self.configure_faults.write() {
            faults.insert(pin, reason.to_string());
        }
    }

    pub fn heal_pin(&self, pin: PinId) {
        if let Ok(mut faults) = self.faults.write() {
            faults.remove(&pin);
        }
        if let Ok(mut faults) = self.configure_faults.write() {
            faults.remove(&pin);
        }
    }

    fn check_fault(&self, pin: PinId) -> Result<()> {
        let faults = self.faults.read().map_err(poisoned)?;
        match faults.get(&pin) {
            Some(reason) => Err(GpioError::Driver(format!("pin {pin}: {reason}"))),
            None => Ok(()),
        }
    }

    /// Drives an input to `level` as an external circuit would, emitting an
    /// edge stamped with the driver's clock when the level changes.
    pub fn drive(&self, pin: PinId, level: bool) -> Result<()> {
        let timestamp_ms = self.origin.elapsed().as_millis() as u64;
        let edge = {
            let pins = self.pins.read().map_err(poisoned)?;
            let mut state = pins
                .get(&pin)
                .ok_or_else(|| not_requested(pin))?
                .lock()
                .map_err(poisoned)?;

            if state.direction != MockDirection::Input {
                return Err(GpioError::Driver(format!("pin {pin} is not an input")));
            }
            let old = state.level;
            state.level = level;
            match (old, level) {
                (false, true) => Edge::Rising,
                (true, false) => Edge::Falling,
                _ => return Ok(()),
            }
        };

        self.forward(pin, edge, timestamp_ms)
    }

    /// Emits one edge with an explicit timestamp, for deterministic timing.
    pub fn inject_edge(&self, pin: PinId, edge: Edge, timestamp_ms: u64) -> Result<()> {
        {
            let pins = self.pins.read().map_err(poisoned)?;
            let mut state = pins
                .get(&pin)
                .ok_or_else(|| not_requested(pin))?
                .lock()
                .map_err(poisoned)?;
            match edge {
                Edge::Rising => state.level = true,
                Edge::Falling => state.level = false,
                Edge::Both => {}
            }
        }

        self.forward(pin, edge, timestamp_ms)
    }

    fn forward(&self, pin: PinId, edge: Edge, timestamp_ms: u64) -> Result<()> {
        // the sink is called with no driver lock held
        let sink = {
            let pins = self.pins.read().map_err(poisoned)?;
            let state = pins
                .get(&pin)
                .ok_or_else(|| not_requested(pin))?
                .lock()
                .map_err(poisoned)?;
            match (state.edge, &state.sink) {
                (Some(armed), Some(sink)) if forwards(armed, edge) => sink.clone(),
                _ => return Ok(()),
            }
        };

        sink.deliver(pin, edge, timestamp_ms);
        Ok(())
    }

    pub fn level(&self, pin: PinId) -> Option<bool> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(&pin)?.lock().ok()?;
        Some(state.level)
    }

    pub fn configured(&self, pin: PinId) -> Option<(MockDirection, MockBias)> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(&pin)?.lock().ok()?;
        Some((state.direction, state.bias))
    }

    pub fn armed_edge(&self, pin: PinId) -> Option<MockEdge> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(&pin)?.lock().ok()?;
        state.edge
    }
}

impl PlatformDriver for MockDriver {
    type Direction = MockDirection;
    type Pull = MockBias;
    type Edge = MockEdge;

    fn map_direction(direction: Direction) -> MockDirection {
        match direction {
            Direction::Out => MockDirection::Output,
            Direction::In => MockDirection::Input,
        }
    }

    fn map_pull(pull: PullMode) -> MockBias {
        match pull {
            PullMode::Off => MockBias::Floating,
            PullMode::Down => MockBias::PullDown,
            PullMode::Up => MockBias::PullUp,
        }
    }

    fn map_edge(edge: Edge) -> MockEdge {
        match edge {
            Edge::Rising => MockEdge::Rising,
            Edge::Falling => MockEdge::Falling,
            Edge::Both => MockEdge::Both,
        }
    }

    fn configure(&self, pin: PinId, direction: MockDirection, bias: MockBias) -> Result<()> {
        self.check_fault(pin)?;
        if let Some(reason) = self.configure_faults.read().map_err(poisoned)?.get(&pin) {
            return Err(GpioError::Driver(format!("pin {pin}: {reason}")));
        }
        let mut pins = self.pins.write().map_err(poisoned)?;

        let entry = pins.entry(pin).or_insert_with(|| {
            Mutex::new(MockPin {
                direction,
                bias,
                level: false,
                edge: None,
                sink: None,
            })
        });
        let mut state = entry.lock().map_err(poisoned)?;

        state.direction = direction;
        state.bias = bias;
        // an undriven input settles to its bias
        if direction == MockDirection::Input {
            match bias {
                MockBias::PullUp => state.level = true,
                MockBias::PullDown => state.level = false,
                MockBias::Floating => {}
            }
        }
        debug!("mock pin {pin}: {direction:?} {bias:?}");
        Ok(())
    }

    fn write(&self, pin: PinId, value: bool) -> Result<()> {
        self.check_fault(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let mut state = pins
            .get(&pin)
            .ok_or_else(|| not_requested(pin))?
            .lock()
            .map_err(poisoned)?;

        if state.direction != MockDirection::Output {
            return Err(GpioError::Driver(format!("pin {pin} is not an output")));
        }
        state.level = value;
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<bool> {
        self.check_fault(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let state = pins
            .get(&pin)
            .ok_or_else(|| not_requested(pin))?
            .lock()
            .map_err(poisoned)?;
        Ok(state.level)
    }

    fn arm_edge(&self, pin: PinId, edge: MockEdge, sink: EdgeSink) -> Result<()> {
        self.check_fault(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let mut state = pins
            .get(&pin)
            .ok_or_else(|| not_requested(pin))?
            .lock()
            .map_err(poisoned)?;

        if state.direction != MockDirection::Input {
            return Err(GpioError::Driver(format!(
                "pin {pin}: edge detection needs an input"
            )));
        }
        state.edge = Some(edge);
        state.sink = Some(sink);
        Ok(())
    }

    fn disarm_edge(&self, pin: PinId) -> Result<()> {
        self.check_fault(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let mut state = pins
            .get(&pin)
            .ok_or_else(|| not_requested(pin))?
            .lock()
            .map_err(poisoned)?;

        state.edge = None;
        state.sink = None;
        Ok(())
    }

    fn release(&self, pin: Option<PinId>) -> Result<()> {
        if let Some(pin) = pin {
            self.check_fault(pin)?;
        }
        let mut pins = self.pins.write().map_err(poisoned)?;
        match pin {
            Some(pin) => {
                pins.remove(&pin);
            }
            None => pins.clear(),
        }
        Ok(())
    }
}
