//! Legacy `/sys/class/gpio` backend.
//!
//! Pins are exported on demand and driven through the text attribute files
//! under their directory. No handles are held: every read and write opens
//! the `value` file afresh.

use log::info;
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::{Addressing, BackendMode, Polarity, RelayConfiguration, RelayEntry};
use crate::error::BackendError;
use crate::relay::{Acquired, LineBackend, LineSet};

/// The kernel creates the pin directory asynchronously after an export.
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const EXPORT_SETTLE_INTERVAL: Duration = Duration::from_millis(25);

pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    /// `root` holds the `export` control file, normally `/sys/class/gpio`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn export_path(&self) -> PathBuf {
        self.root.join("export")
    }

    fn init_pin(&self, pin: u32, dir: &Path, polarity: Polarity) -> Result<(), BackendError> {
        if !dir.exists() {
            let export = self.export_path();
            fs::write(&export, pin.to_string()).map_err(|e| BackendError::io(&export, e))?;
            Self::wait_for_export(pin, dir)?;
        }
        write_attr(dir, "direction", "out")?;
        write_attr(dir, "active_low", polarity.active_low_attr())?;
        Ok(())
    }

    fn wait_for_export(pin: u32, dir: &Path) -> Result<(), BackendError> {
        for _ in 0..EXPORT_SETTLE_ATTEMPTS {
            if dir.exists() {
                return Ok(());
            }
            thread::sleep(EXPORT_SETTLE_INTERVAL);
        }
        if dir.exists() {
            Ok(())
        } else {
            Err(BackendError::ExportTimeout {
                pin,
                path: dir.to_path_buf(),
            })
        }
    }
}

fn pin_dir(relay: &RelayEntry) -> Result<(u32, &Path), BackendError> {
    match &relay.addressing {
        Addressing::Path { pin, path } => Ok((*pin, path.as_path())),
        Addressing::Line { .. } => Err(BackendError::NotAddressable {
            relay_id: relay.id.clone(),
            mode: BackendMode::Path,
        }),
    }
}

fn write_attr(dir: &Path, attr: &str, value: &str) -> Result<(), BackendError> {
    let path = dir.join(attr);
    fs::write(&path, value).map_err(|e| BackendError::io(path, e))
}

impl LineBackend for SysfsBackend {
    type Handle = Infallible;

    fn mode(&self) -> BackendMode {
        BackendMode::Path
    }

    fn acquire(
        &self,
        config: &RelayConfiguration,
        _held: &LineSet<Infallible>,
    ) -> Acquired<Infallible> {
        let mut acquired = Acquired::default();

        for relay in config.iter() {
            let result =
                pin_dir(relay).and_then(|(pin, dir)| self.init_pin(pin, dir, relay.active));
            match result {
                Ok(()) => info!("initialized pin for relay {} (active {:?})", relay.id, relay.active),
                Err(e) => acquired.fail(relay, e),
            }
        }

        acquired
    }

    fn write(
        &self,
        _lines: &LineSet<Infallible>,
        relay: &RelayEntry,
        on: bool,
    ) -> Result<(), BackendError> {
        let (_, dir) = pin_dir(relay)?;
        let level = if relay.active.to_physical(on) { "1" } else { "0" };
        write_attr(dir, "value", level)
    }

    fn read(&self, _lines: &LineSet<Infallible>, relay: &RelayEntry) -> Result<bool, BackendError> {
        let (_, dir) = pin_dir(relay)?;
        let path = dir.join("value");
        let raw = fs::read_to_string(&path).map_err(|e| BackendError::io(&path, e))?;
        let level: i64 = raw
            .trim()
            .parse()
            .map_err(|_| BackendError::InvalidReading {
                path: path.clone(),
                value: raw.trim().to_string(),
            })?;
        Ok(relay.active.to_logical(level != 0))
    }
}
