#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodDriver;
pub use mock::{MockBias, MockDirection, MockDriver, MockEdge};
