mod backend;
mod config;
mod error;
mod relay;
mod reload;
mod routes;
pub mod selector;

pub use config::{
    Addressing, AppConfig, BackendMode, BackendPreference, DEFAULT_SYSFS_ROOT, GpioConfig,
    HttpConfig, LineKey, Polarity, RelayConfiguration, RelayEntry, ReloadPolicy,
};
pub use error::{AppError, BackendError};
pub use relay::{
    AcquireFailure, Acquired, LineBackend, LineSet, LiveState, RelayController, RelayStatus,
};
pub use reload::ReloadSummary;
pub use routes::AppState;

#[cfg(feature = "hardware-gpio")]
pub use backend::{GpiodLine, LibgpiodBackend};
pub use backend::{MockLine, MockLineBackend, SysfsBackend};
