use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{Direction, Edge, PinId, PullMode};
use crate::error::{GpioError, Result};

pub type EdgeCallback = Arc<dyn Fn(&EdgeEvent) + Send + Sync>;

pub type EdgeSink = Arc<EdgeDispatcher>;

type PinTable = RwLock<FxHashMap<PinId, Arc<PinSlot>>>;

/// An edge that passed the pin's registration filter and debounce window.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin: PinId,
    pub edge: Edge,
    pub timestamp_ms: u64,
    #[serde(skip)]
    registration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionState {
    Unarmed,
    Armed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinStatus {
    pub pin: PinId,
    pub direction: Direction,
    pub pull: PullMode,
    pub detection: DetectionState,
    pub edge: Option<Edge>,
    pub debounce_ms: Option<u64>,
    pub accepted: u64,
    pub waiters: usize,
}

/// Board-specific pin control primitive.
///
/// Each driver names its own native vocabulary through the associated types
/// and provides the lookup from the neutral enums into it. Observed edges are
/// handed to the [`EdgeSink`] given to `arm_edge`, stamped with a monotonic
/// millisecond timestamp.
pub trait PlatformDriver: Send + Sync + 'static {
    type Direction: Copy + fmt::Debug;
    type Pull: Copy + fmt::Debug;
    type Edge: Copy + fmt::Debug;

    fn map_direction(direction: Direction) -> Self::Direction;
    fn map_pull(pull: PullMode) -> Self::Pull;
    fn map_edge(edge: Edge) -> Self::Edge;

    fn configure(&self, pin: PinId, direction: Self::Direction, pull: Self::Pull) -> Result<()>;
    fn write(&self, pin: PinId, value: bool) -> Result<()>;
    fn read(&self, pin: PinId) -> Result<bool>;
    fn arm_edge(&self, pin: PinId, edge: Self::Edge, sink: EdgeSink) -> Result<()>;
    fn disarm_edge(&self, pin: PinId) -> Result<()>;
    /// Releases one pin, or every pin the driver holds when `pin` is `None`.
    fn release(&self, pin: Option<PinId>) -> Result<()>;
}

enum Verdict {
    Ignored,
    Suppressed,
    Accepted,
}

struct Registration {
    id: u64,
    edge: Edge,
    callbacks: Vec<EdgeCallback>,
    debounce_ms: Option<u64>,
    last_accepted_ms: Option<u64>,
    detected: bool,
    accepted: u64,
}

impl Registration {
    fn new(id: u64, edge: Edge, callback: Option<EdgeCallback>, debounce_ms: Option<u64>) -> Self {
        Self {
            id,
            edge,
            callbacks: callback.into_iter().collect(),
            debounce_ms: debounce_window(debounce_ms),
            last_accepted_ms: None,
            detected: false,
            accepted: 0,
        }
    }

    // the window is measured from the last accepted edge, never the last raw one
    fn admit(&mut self, edge: Edge, timestamp_ms: u64) -> Verdict {
        if !self.edge.matches(edge) {
            return Verdict::Ignored;
        }
        if let (Some(window), Some(last)) = (self.debounce_ms, self.last_accepted_ms)
            && timestamp_ms.saturating_sub(last) < window
        {
            return Verdict::Suppressed;
        }
        self.last_accepted_ms = Some(timestamp_ms);
        self.detected = true;
        self.accepted += 1;
        Verdict::Accepted
    }
}

fn debounce_window(debounce_ms: Option<u64>) -> Option<u64> {
    debounce_ms.filter(|ms| *ms > 0)
}

#[derive(Default)]
struct PinState {
    direction: Option<Direction>,
    pull: PullMode,
    registration: Option<Registration>,
    armed: Option<Edge>,
    waiting: Vec<Edge>,
    rising_seen: u64,
    falling_seen: u64,
    generation: u64,
    // set once cleanup has dropped the slot from the table
    retired: bool,
}

impl PinState {
    fn require(&self, pin: PinId, expected: Direction) -> Result<()> {
        if self.retired {
            return Err(not_configured(pin));
        }
        match self.direction {
            None => Err(not_configured(pin)),
            Some(direction) if direction != expected => Err(GpioError::InvalidState(format!(
                "pin {pin} is configured as {direction}, operation requires {expected}"
            ))),
            Some(_) => Ok(()),
        }
    }

    fn observe(&mut self, edge: Edge) {
        if edge != Edge::Falling {
            self.rising_seen = self.rising_seen.wrapping_add(1);
        }
        if edge != Edge::Rising {
            self.falling_seen = self.falling_seen.wrapping_add(1);
        }
    }

    fn seen(&self, edge: Edge) -> u64 {
        match edge {
            Edge::Rising => self.rising_seen,
            Edge::Falling => self.falling_seen,
            Edge::Both => self.rising_seen.wrapping_add(self.falling_seen),
        }
    }

    /// Edge the driver must be armed for to serve the registration and all waiters.
    fn wanted_edge(&self) -> Option<Edge> {
        self.registration
            .as_ref()
            .map(|r| r.edge)
            .into_iter()
            .chain(self.waiting.iter().copied())
            .reduce(Edge::union)
    }

    fn forget_waiter(&mut self, edge: Edge) {
        if let Some(pos) = self.waiting.iter().position(|e| *e == edge) {
            self.waiting.swap_remove(pos);
        }
    }

    fn cancel(&mut self) {
        self.registration = None;
        self.waiting.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Default)]
struct PinSlot {
    // serialises caller-side lifecycle operations, held across driver calls
    ops: Mutex<()>,
    // shared with the delivery path, never held across driver calls
    state: Mutex<PinState>,
    edge_seen: Condvar,
}

fn not_configured(pin: PinId) -> GpioError {
    GpioError::InvalidState(format!("pin {pin} not configured, call setup first"))
}

fn not_detecting(pin: PinId) -> GpioError {
    GpioError::InvalidState(format!(
        "pin {pin} has no edge detection, call add_event_detect first"
    ))
}

/// Receives raw edges from drivers and runs them through each pin's state machine.
pub struct EdgeDispatcher {
    pins: Arc<PinTable>,
    event_tx: broadcast::Sender<EdgeEvent>,
}

impl EdgeDispatcher {
    pub fn deliver(&self, pin: PinId, edge: Edge, timestamp_ms: u64) {
        let Some(slot) = self.pins.read().get(&pin).cloned() else {
            trace!("pin {pin}: {edge} edge for untracked pin dropped");
            return;
        };

        let event = {
            let mut state = slot.state.lock();
            state.observe(edge);
            slot.edge_seen.notify_all();

            let Some(registration) = state.registration.as_mut() else {
                return;
            };
            match registration.admit(edge, timestamp_ms) {
                Verdict::Ignored => return,
                Verdict::Suppressed => {
                    trace!("pin {pin}: {edge} edge at {timestamp_ms}ms suppressed by debounce");
                    return;
                }
                Verdict::Accepted => EdgeEvent {
                    pin,
                    edge,
                    timestamp_ms,
                    registration: registration.id,
                },
            }
        };

        // fails only once every receiver is gone
        let _ = self.event_tx.send(event);
    }
}

fn run_callbacks(pins: Arc<PinTable>, mut rx: broadcast::Receiver<EdgeEvent>) {
    loop {
        match rx.blocking_recv() {
            Ok(event) => invoke_callbacks(&pins, &event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("edge callbacks falling behind, dropped {n} oldest events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("edge dispatch thread exiting");
}

fn invoke_callbacks(pins: &PinTable, event: &EdgeEvent) {
    let Some(slot) = pins.read().get(&event.pin).cloned() else {
        return;
    };
    let callbacks = {
        let state = slot.state.lock();
        match &state.registration {
            // a replaced or removed registration no longer owns this edge
            Some(reg) if reg.id == event.registration => reg.callbacks.clone(),
            _ => return,
        }
    };

    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!("edge callback for pin {} panicked", event.pin);
        }
    }
}

#[derive(PartialEq, Eq)]
enum WaitOutcome {
    Seen,
    TimedOut,
    Cancelled,
}

pub struct GpioInterface<D: PlatformDriver> {
    driver: Arc<D>,
    pins: Arc<PinTable>,
    dispatcher: EdgeSink,
    next_registration: AtomicU64,
}

impl<D: PlatformDriver> GpioInterface<D> {
    /// `event_queue_capacity` bounds the accepted edges waiting for callbacks;
    /// when callbacks fall behind the oldest are dropped.
    pub fn new(driver: Arc<D>, event_queue_capacity: usize) -> Result<Self> {
        let pins: Arc<PinTable> = Arc::new(RwLock::new(FxHashMap::default()));
        let (event_tx, event_rx) = broadcast::channel(event_queue_capacity.max(1));

        let worker_pins = pins.clone();
        std::thread::Builder::new()
            .name("gpio-dispatch".into())
            .spawn(move || run_callbacks(worker_pins, event_rx))
            .map_err(|e| GpioError::Driver(format!("spawn dispatch thread: {e}")))?;

        let dispatcher = Arc::new(EdgeDispatcher {
            pins: pins.clone(),
            event_tx,
        });

        Ok(Self {
            driver,
            pins,
            dispatcher,
            next_registration: AtomicU64::new(1),
        })
    }

    fn slot(&self, pin: PinId) -> Result<Arc<PinSlot>> {
        self.pins
            .read()
            .get(&pin)
            .cloned()
            .ok_or_else(|| not_configured(pin))
    }

    pub fn setup(&self, pin: PinId, direction: Direction, pull: PullMode) -> Result<()> {
        loop {
            let slot = self.pins.write().entry(pin).or_default().clone();
            let _ops = slot.ops.lock();
            // a concurrent cleanup retired this slot, the table holds a fresh one now
            if slot.state.lock().retired {
                continue;
            }
            return self.configure_slot(pin, &slot, direction, pull);
        }
    }

    // caller holds the pin's op lock
    fn configure_slot(
        &self,
        pin: PinId,
        slot: &PinSlot,
        direction: Direction,
        pull: PullMode,
    ) -> Result<()> {
        let pull = if direction == Direction::Out && pull != PullMode::Off {
            debug!("pin {pin}: pull mode {pull:?} ignored for output");
            PullMode::Off
        } else {
            pull
        };

        let armed = slot.state.lock().armed;
        if armed.is_some() {
            self.driver.disarm_edge(pin)?;
            slot.state.lock().armed = None;
        }
        if let Err(e) = self
            .driver
            .configure(pin, D::map_direction(direction), D::map_pull(pull))
        {
            self.restore_arming(pin, slot);
            return Err(e);
        }

        {
            let mut state = slot.state.lock();
            state.direction = Some(direction);
            state.pull = pull;
            if direction == Direction::Out
                && (state.registration.is_some() || !state.waiting.is_empty())
            {
                warn!("pin {pin}: reconfigured as output, dropping edge detection");
                state.cancel();
                slot.edge_seen.notify_all();
            }
        }
        debug!("pin {pin}: configured {direction} pull {pull:?}");

        self.sync_arming(pin, slot)
    }

    // after a failed reconfigure: re-arm what was there, or drop detection if the driver refuses
    fn restore_arming(&self, pin: PinId, slot: &PinSlot) {
        if let Err(e) = self.sync_arming(pin, slot) {
            warn!("pin {pin}: restoring edge arming after failed setup: {e}");
            let mut state = slot.state.lock();
            state.cancel();
            slot.edge_seen.notify_all();
        }
    }

    pub fn output(&self, pin: PinId, value: bool) -> Result<()> {
        let slot = self.slot(pin)?;
        let _ops = slot.ops.lock();
        slot.state.lock().require(pin, Direction::Out)?;

        self.driver.write(pin, value)
    }

    pub fn input(&self, pin: PinId) -> Result<bool> {
        let slot = self.slot(pin)?;
        let _ops = slot.ops.lock();
        slot.state.lock().require(pin, Direction::In)?;

        self.driver.read(pin)
    }

    /// Samples each pin in order; the first failure aborts the batch.
    pub fn input_pins(&self, pins: &[PinId]) -> Result<Vec<bool>> {
        pins.iter().map(|pin| self.input(*pin)).collect()
    }

    /// Arms edge detection, replacing any registration the pin already has.
    /// A `debounce_ms` of `None` or zero dispatches every matching edge.
    pub fn add_event_detect(
        &self,
        pin: PinId,
        edge: Edge,
        callback: Option<EdgeCallback>,
        debounce_ms: Option<u64>,
    ) -> Result<()> {
        let slot = self.slot(pin)?;
        let _ops = slot.ops.lock();
        {
            let mut state = slot.state.lock();
            state.require(pin, Direction::In)?;

            let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
            let registration = Registration::new(id, edge, callback, debounce_ms);
            if state.registration.replace(registration).is_some() {
                debug!("pin {pin}: replacing existing edge detection");
            }
        }

        if let Err(e) = self.sync_arming(pin, &slot) {
            slot.state.lock().registration = None;
            return Err(e);
        }
        debug!("pin {pin}: detecting {edge} edges, debounce {debounce_ms:?}ms");
        Ok(())
    }

    pub fn remove_event_detect(&self, pin: PinId) -> Result<()> {
        let Some(slot) = self.pins.read().get(&pin).cloned() else {
            return Ok(());
        };
        let _ops = slot.ops.lock();
        if slot.state.lock().registration.take().is_none() {
            return Ok(());
        }

        self.sync_arming(pin, &slot)
    }

    /// Appends a callback to an armed pin. A positive `debounce_ms` replaces
    /// the registration's window.
    pub fn add_event_callback(
        &self,
        pin: PinId,
        callback: EdgeCallback,
        debounce_ms: Option<u64>,
    ) -> Result<()> {
        let slot = self.slot(pin)?;
        let mut state = slot.state.lock();
        let registration = state
            .registration
            .as_mut()
            .ok_or_else(|| not_detecting(pin))?;

        registration.callbacks.push(callback);
        if let Some(window) = debounce_window(debounce_ms) {
            registration.debounce_ms = Some(window);
        }
        Ok(())
    }

    /// Whether an edge was accepted since the previous call.
    pub fn event_detected(&self, pin: PinId) -> Result<bool> {
        let slot = self.slot(pin)?;
        let mut state = slot.state.lock();
        let registration = state
            .registration
            .as_mut()
            .ok_or_else(|| not_detecting(pin))?;

        Ok(std::mem::take(&mut registration.detected))
    }

    pub fn wait_for_edge(&self, pin: PinId, edge: Edge) -> Result<()> {
        self.wait_for_edge_timeout(pin, edge, None).map(|_| ())
    }

    /// Blocks until `edge` is observed on `pin`, returning `false` if
    /// `timeout` elapses first. Fails with [`GpioError::Cancelled`] when the
    /// pin is cleaned up or reconfigured as output while waiting.
    pub fn wait_for_edge_timeout(
        &self,
        pin: PinId,
        edge: Edge,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let slot = self.slot(pin)?;
        self.wait_on(pin, &slot, edge, timeout)
    }

    fn wait_on(
        &self,
        pin: PinId,
        slot: &PinSlot,
        edge: Edge,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (baseline, generation) = {
            let _ops = slot.ops.lock();
            let snapshot = {
                let mut state = slot.state.lock();
                state.require(pin, Direction::In)?;
                state.waiting.push(edge);
                (state.seen(edge), state.generation)
            };
            if let Err(e) = self.sync_arming(pin, slot) {
                slot.state.lock().forget_waiter(edge);
                return Err(e);
            }
            snapshot
        };

        let outcome = {
            let mut state = slot.state.lock();
            loop {
                if state.generation != generation {
                    break WaitOutcome::Cancelled;
                }
                if state.seen(edge) != baseline {
                    break WaitOutcome::Seen;
                }
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => break WaitOutcome::TimedOut,
                    Some(deadline) => {
                        slot.edge_seen.wait_until(&mut state, deadline);
                    }
                    None => slot.edge_seen.wait(&mut state),
                }
            }
        };

        if outcome == WaitOutcome::Cancelled {
            return Err(GpioError::Cancelled(format!(
                "wait for {edge} edge on pin {pin} cancelled"
            )));
        }

        let _ops = slot.ops.lock();
        let tracked = {
            let mut state = slot.state.lock();
            let tracked = state.generation == generation;
            if tracked {
                state.forget_waiter(edge);
            }
            tracked
        };
        if tracked && let Err(e) = self.sync_arming(pin, slot) {
            warn!("pin {pin}: restoring edge arming after wait: {e}");
        }

        Ok(outcome == WaitOutcome::Seen)
    }

    /// Disarms and forgets `pin`, or every pin when `None`. Blocked waiters
    /// are cancelled. Driver failures are logged, never returned.
    pub fn cleanup(&self, pin: Option<PinId>) {
        let slots: Vec<(PinId, Arc<PinSlot>)> = match pin {
            Some(pin) => self
                .pins
                .write()
                .remove(&pin)
                .map(|slot| (pin, slot))
                .into_iter()
                .collect(),
            None => self.pins.write().drain().collect(),
        };

        for (id, slot) in &slots {
            self.retire(*id, slot);
        }

        let released = match pin {
            Some(pin) if slots.is_empty() => {
                debug!("cleanup: pin {pin} was not configured");
                Ok(())
            }
            Some(pin) => self.driver.release(Some(pin)),
            None => self.driver.release(None),
        };
        if let Err(e) = released {
            warn!("cleanup: releasing pins: {e}");
        }
    }

    fn retire(&self, pin: PinId, slot: &PinSlot) {
        let _ops = slot.ops.lock();
        let armed = {
            let mut state = slot.state.lock();
            state.cancel();
            state.retired = true;
            slot.edge_seen.notify_all();
            state.armed.take()
        };
        if armed.is_some()
            && let Err(e) = self.driver.disarm_edge(pin)
        {
            warn!("cleanup: disarming pin {pin}: {e}");
        }
    }

    // caller holds the pin's op lock
    fn sync_arming(&self, pin: PinId, slot: &PinSlot) -> Result<()> {
        let (armed, wanted) = {
            let state = slot.state.lock();
            (state.armed, state.wanted_edge())
        };
        if armed == wanted {
            return Ok(());
        }

        if armed.is_some() {
            self.driver.disarm_edge(pin)?;
            slot.state.lock().armed = None;
        }
        match wanted {
            Some(edge) => {
                self.driver
                    .arm_edge(pin, D::map_edge(edge), self.dispatcher.clone())?;
                slot.state.lock().armed = Some(edge);
                debug!("pin {pin}: driver armed for {edge} edges");
            }
            None => debug!("pin {pin}: driver disarmed"),
        }
        Ok(())
    }

    pub fn pin_status(&self, pin: PinId) -> Option<PinStatus> {
        let slot = self.pins.read().get(&pin).cloned()?;
        let state = slot.state.lock();
        let direction = state.direction?;
        let registration = state.registration.as_ref();

        Some(PinStatus {
            pin,
            direction,
            pull: state.pull,
            detection: match registration {
                Some(_) => DetectionState::Armed,
                None => DetectionState::Unarmed,
            },
            edge: registration.map(|r| r.edge),
            debounce_ms: registration.and_then(|r| r.debounce_ms),
            accepted: registration.map(|r| r.accepted).unwrap_or(0),
            waiters: state.waiting.len(),
        })
    }

    pub fn pin_statuses(&self) -> Vec<PinStatus> {
        let mut ids: Vec<PinId> = self.pins.read().keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|pin| self.pin_status(pin)).collect()
    }

    pub fn detection_state(&self, pin: PinId) -> DetectionState {
        self.pin_status(pin)
            .map(|s| s.detection)
            .unwrap_or(DetectionState::Unarmed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.dispatcher.event_tx.subscribe()
    }
}

impl<D: PlatformDriver> Drop for GpioInterface<D> {
    fn drop(&mut self) {
        if !self.pins.read().is_empty() {
            self.cleanup(None);
        }
    }
}
