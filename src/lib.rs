pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
pub mod routes;
pub mod sensor;

pub use config::{AppConfig, Direction, Edge, HttpConfig, PinConfig, PinId, PullMode, SwitchConfig};
pub use error::{GpioError, Result};
pub use gpio::{
    DetectionState, EdgeCallback, EdgeDispatcher, EdgeEvent, EdgeSink, GpioInterface, PinStatus,
    PlatformDriver,
};
pub use routes::AppState;
pub use sensor::{Measurement, MetricMeta, SensorModule, SwitchModule};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodDriver;
pub use backend::MockDriver;
