#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
pub mod sysfs;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::{GpiodLine, LibgpiodBackend};
pub use mock::{MockLine, MockLineBackend};
pub use sysfs::SysfsBackend;
