use log::{info, warn};
use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use parking_lot::FairMutex;

use crate::config::{BackendMode, LineKey, Polarity, RelayConfiguration, RelayEntry};
use crate::error::BackendError;
use crate::relay::{Acquired, LineBackend, LineSet};

/// Line-descriptor backend over the GPIO character device.
#[derive(Default)]
pub struct LibgpiodBackend;

/// One requested output line. The request is released when the last
/// reference drops.
pub struct GpiodLine {
    offset: u32,
    request: FairMutex<request::Request>,
}

impl GpiodLine {
    fn request(key: &LineKey, polarity: Polarity) -> Result<Self, BackendError> {
        let failed = |reason: String| BackendError::LineRequestFailed {
            chip: key.chip.clone(),
            offset: key.offset,
            reason,
        };

        let chip = Self::open_chip(&key.chip).map_err(&failed)?;
        let info = chip
            .line_info(key.offset)
            .map_err(|e| failed(format!("line info: {e}")))?;
        if info.is_used() {
            return Err(BackendError::LineAlreadyHeld {
                chip: key.chip.clone(),
                offset: key.offset,
            });
        }

        let line_cfg = Self::make_line_config(key.offset, polarity).map_err(&failed)?;
        let request = Self::request_lines(&chip, &line_cfg).map_err(&failed)?;

        Ok(Self {
            offset: key.offset,
            request: FairMutex::new(request),
        })
    }

    fn open_chip(path: &str) -> Result<Chip, String> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| format!("open chip {path}: {e}"))
    }

    /// Output line whose initial level keeps the relay de-energized.
    fn make_line_config(offset: u32, polarity: Polarity) -> Result<line::Config, String> {
        let mut ls = line::Settings::new().map_err(|e| format!("libgpiod settings: {e}"))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| format!("set direction: {e}"))?;
        ls.set_output_value(to_value(polarity.to_physical(false)))
            .map_err(|e| format!("set output value: {e}"))?;

        let mut cfg = line::Config::new().map_err(|e| format!("line config: {e}"))?;
        cfg.add_line_settings(&[offset], ls)
            .map_err(|e| format!("line config add settings: {e}"))?;
        Ok(cfg)
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, String> {
        let mut req_cfg = request::Config::new().map_err(|e| format!("request config: {e}"))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| format!("request consumer: {e}"))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| format!("request lines: {e}"))
    }
}

fn to_value(level: bool) -> line::Value {
    if level {
        line::Value::Active
    } else {
        line::Value::InActive
    }
}

fn line_key(relay: &RelayEntry) -> Result<LineKey, BackendError> {
    relay.line_key().ok_or_else(|| BackendError::NotAddressable {
        relay_id: relay.id.clone(),
        mode: BackendMode::LineDescriptor,
    })
}

impl LibgpiodBackend {
    pub fn new() -> Self {
        Self
    }
}

impl LineBackend for LibgpiodBackend {
    type Handle = GpiodLine;

    fn mode(&self) -> BackendMode {
        BackendMode::LineDescriptor
    }

    fn acquire(
        &self,
        config: &RelayConfiguration,
        held: &LineSet<GpiodLine>,
    ) -> Acquired<GpiodLine> {
        let mut acquired = Acquired::default();

        for relay in config.iter() {
            let key = match line_key(relay) {
                Ok(key) => key,
                Err(e) => {
                    acquired.fail(relay, e);
                    continue;
                }
            };
            if held.contains(&key) {
                warn!("line {key} already requested, skipping");
                continue;
            }

            match GpiodLine::request(&key, relay.active) {
                Ok(line) => {
                    info!(
                        "requested line {} on {} for relay {} (active {:?})",
                        key.offset, key.chip, relay.id, relay.active
                    );
                    let _ = acquired.lines.insert(key, line.into());
                }
                Err(e) => acquired.fail(relay, e),
            }
        }

        acquired
    }

    fn write(
        &self,
        lines: &LineSet<GpiodLine>,
        relay: &RelayEntry,
        on: bool,
    ) -> Result<(), BackendError> {
        let key = line_key(relay)?;
        let handle = lines.handle_for(relay, &key)?;

        handle
            .request
            .lock()
            .set_value(handle.offset, to_value(relay.active.to_physical(on)))
            .map_err(|e| BackendError::LineIo {
                chip: key.chip.clone(),
                offset: key.offset,
                reason: format!("set value: {e}"),
            })?;
        Ok(())
    }

    fn read(&self, lines: &LineSet<GpiodLine>, relay: &RelayEntry) -> Result<bool, BackendError> {
        let key = line_key(relay)?;
        let handle = lines.handle_for(relay, &key)?;

        let value = handle
            .request
            .lock()
            .value(handle.offset)
            .map_err(|e| BackendError::LineIo {
                chip: key.chip.clone(),
                offset: key.offset,
                reason: format!("get value: {e}"),
            })?;
        Ok(relay
            .active
            .to_logical(matches!(value, line::Value::Active)))
    }

    fn release(&self, lines: LineSet<GpiodLine>) {
        for key in lines.keys() {
            info!("releasing line {} on {}", key.offset, key.chip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn config(json: &str) -> RelayConfiguration {
        AppConfig::from_json(json).unwrap().relays
    }

    #[test]
    fn levels_map_to_line_values() {
        assert!(matches!(to_value(true), line::Value::Active));
        assert!(matches!(to_value(false), line::Value::InActive));
    }

    #[test]
    fn path_entries_are_not_addressable() {
        let cfg = config(r#"{"relays": {"9": {"pin": 24, "path": "/sys/class/gpio/gpio24"}}}"#);
        let relay = cfg.get("9").unwrap();
        assert!(matches!(
            line_key(relay),
            Err(BackendError::NotAddressable {
                mode: BackendMode::LineDescriptor,
                ..
            })
        ));
    }

    #[test]
    fn missing_chip_fails_only_its_relay() {
        let cfg = config(
            r#"{"relays": {"1": {"chip": "/nonexistent/gpiochip99", "line": 3, "active": "low"}}}"#,
        );
        let acquired = LibgpiodBackend::new().acquire(&cfg, &LineSet::default());

        assert!(acquired.lines.is_empty());
        assert_eq!(acquired.failures.len(), 1);
        assert_eq!(acquired.failures[0].relay_id, "1");
        assert!(matches!(
            acquired.failures[0].error,
            BackendError::LineRequestFailed { offset: 3, .. }
        ));
    }
}
