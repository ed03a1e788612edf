use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{Direction, Edge, PinConfig, PinId, PullMode};
use crate::error::{GpioError, Result};
use crate::gpio::{EdgeSink, PlatformDriver};

const LIBGPIOD_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Linux GPIO character device driver. Pin ids are resolved to a chip and
/// line offset through the board map.
pub struct LibgpiodDriver {
    board: FxHashMap<PinId, PinConfig>,
    pins: RwLock<FxHashMap<PinId, Mutex<PinHandle>>>, // keyed by pin id
}

#[derive(Clone, Copy)]
struct LineSetup {
    direction: line::Direction,
    bias: Option<line::Bias>,
}

struct PinHandle {
    line: u32,
    setup: LineSetup,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| GpioError::Driver(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::Driver(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| GpioError::Driver(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Driver(format!("request lines: {e}")))
    }
}

/// One thread per armed pin, forwarding kernel edge events into the sink.
struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(pin: PinId, gpiod_handle: Arc<FairMutex<GpiodHandle>>, sink: EdgeSink) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::Driver(format!("event buffer: {e}")))?;

        let handle = std::thread::Builder::new()
            .name(format!("gpio-edge-{pin}"))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    let hdl = gpiod_handle.lock();
                    let req = &hdl.request;

                    let has_event = match req.wait_edge_events(Some(LIBGPIOD_EVENT_WAIT_TIMEOUT)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error for pin {pin}: {e}");
                            drop(hdl);
                            yield_now();
                            continue;
                        }
                    };
                    if !has_event {
                        continue;
                    }

                    let events = match req.read_edge_events(&mut buffer) {
                        Ok(evts) => evts,
                        Err(e) => {
                            warn!("read edge events error for pin {pin}: {e}");
                            drop(hdl);
                            yield_now();
                            continue;
                        }
                    };

                    let mut observed = Vec::new();
                    for evt in events {
                        let Ok(evt) = evt else { continue };
                        let edge = match evt.event_type() {
                            Ok(line::EdgeKind::Rising) => Edge::Rising,
                            Ok(line::EdgeKind::Falling) => Edge::Falling,
                            Err(_) => continue,
                        };
                        observed.push((edge, evt.timestamp().as_millis() as u64));
                    }
                    drop(hdl);

                    for (edge, timestamp_ms) in observed {
                        sink.deliver(pin, edge, timestamp_ms);
                    }
                }
            })
            .map_err(|e| GpioError::Driver(format!("spawn edge listener: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodDriver {
    pub fn new(board: FxHashMap<PinId, PinConfig>) -> Result<Self> {
        Ok(Self {
            board,
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn pin_config(&self, pin: PinId) -> Result<&PinConfig> {
        self.board
            .get(&pin)
            .ok_or_else(|| GpioError::Driver(format!("pin {pin} not present in board map")))
    }

    fn make_line_settings(setup: LineSetup, edge: Option<line::Edge>) -> Result<line::Settings> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::Driver(format!("libgpiod settings: {e}")))?;

        ls.set_direction(setup.direction)
            .map_err(|e| GpioError::Driver(format!("set direction: {e}")))?;
        ls.set_bias(setup.bias)
            .map_err(|e| GpioError::Driver(format!("set bias: {e}")))?;

        if edge.is_some() {
            ls.set_edge_detection(edge)
                .map_err(|e| GpioError::Driver(format!("set edge detection: {e}")))?;
            // debounce windows are measured on this clock
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| GpioError::Driver(format!("set event clock: {e}")))?;
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::Driver(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::Driver(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn reconfigure(handle: &PinHandle, edge: Option<line::Edge>) -> Result<()> {
        let line_settings = Self::make_line_settings(handle.setup, edge)?;
        let line_cfg = Self::make_line_config(handle.line, line_settings)?;

        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Driver(format!("reconfigure lines: {e}")))
    }

    fn with_handle<T>(&self, pin: PinId, f: impl FnOnce(&mut PinHandle) -> Result<T>) -> Result<T> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(&pin)
            .ok_or_else(|| GpioError::Driver(format!("pin {pin} not requested")))?;
        let mut handle = handle_lock.lock();
        f(&mut handle)
    }
}

impl PlatformDriver for LibgpiodDriver {
    type Direction = line::Direction;
    type Pull = Option<line::Bias>;
    type Edge = line::Edge;

    fn map_direction(direction: Direction) -> line::Direction {
        match direction {
            Direction::Out => line::Direction::Output,
            Direction::In => line::Direction::Input,
        }
    }

    fn map_pull(pull: PullMode) -> Option<line::Bias> {
        match pull {
            PullMode::Off => None,
            PullMode::Down => Some(line::Bias::PullDown),
            PullMode::Up => Some(line::Bias::PullUp),
        }
    }

    fn map_edge(edge: Edge) -> line::Edge {
        match edge {
            Edge::Rising => line::Edge::Rising,
            Edge::Falling => line::Edge::Falling,
            Edge::Both => line::Edge::Both,
        }
    }

    fn configure(&self, pin: PinId, direction: line::Direction, bias: Option<line::Bias>) -> Result<()> {
        let setup = LineSetup { direction, bias };
        let mut pins = self.pins.write();

        match pins.get(&pin) {
            Some(handle_lock) => {
                let mut handle = handle_lock.lock();
                // reconfiguring drops edge detection along with its listener
                handle.listener.take();
                handle.setup = setup;
                Self::reconfigure(&handle, None)?;
            }
            None => {
                let cfg = self.pin_config(pin)?;
                let line_settings = Self::make_line_settings(setup, None)?;
                let line_cfg = Self::make_line_config(cfg.line, line_settings)?;
                let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&cfg.chip, &line_cfg)?));

                debug!("pin {pin}: requested {}:{} ({})", cfg.chip, cfg.line, cfg.name);
                pins.insert(
                    pin,
                    Mutex::new(PinHandle {
                        line: cfg.line,
                        setup,
                        gpiod_handle,
                        listener: None,
                    }),
                );
            }
        }

        Ok(())
    }

    fn write(&self, pin: PinId, value: bool) -> Result<()> {
        self.with_handle(pin, |handle| {
            let value = if value {
                line::Value::Active
            } else {
                line::Value::InActive
            };
            handle
                .gpiod_handle
                .lock()
                .request
                .set_value(handle.line, value)
                .map_err(|e| GpioError::Driver(format!("set value: {e}")))?;
            Ok(())
        })
    }

    fn read(&self, pin: PinId) -> Result<bool> {
        self.with_handle(pin, |handle| {
            let value = handle
                .gpiod_handle
                .lock()
                .request
                .value(handle.line)
                .map_err(|e| GpioError::Driver(format!("get value: {e}")))?;
            Ok(matches!(value, line::Value::Active))
        })
    }

    fn arm_edge(&self, pin: PinId, edge: line::Edge, sink: EdgeSink) -> Result<()> {
        self.with_handle(pin, |handle| {
            handle.listener.take();
            Self::reconfigure(handle, Some(edge))?;
            handle.listener = Some(EdgeListener::new(pin, handle.gpiod_handle.clone(), sink)?);
            Ok(())
        })
    }

    fn disarm_edge(&self, pin: PinId) -> Result<()> {
        self.with_handle(pin, |handle| {
            if handle.listener.take().is_none() {
                return Ok(());
            }
            Self::reconfigure(handle, None)
        })
    }

    fn release(&self, pin: Option<PinId>) -> Result<()> {
        let mut pins = self.pins.write();
        match pin {
            Some(pin) => {
                pins.remove(&pin);
            }
            None => pins.clear(),
        }
        Ok(())
    }
}
