use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{BackendMode, LineKey, RelayConfiguration, RelayEntry};
use crate::error::BackendError;
use crate::relay::{Acquired, LineBackend, LineSet};

/// In-memory stand-in for the GPIO character device.
#[derive(Default)]
pub struct MockLineBackend {
    lines: Arc<Mutex<FxHashMap<LineKey, MockLineState>>>, // keyed by chip and offset
    broken: Mutex<FxHashSet<LineKey>>,
}

#[derive(Default, Clone)]
struct MockLineState {
    requested: bool,
    level: bool,
    requests: usize,
}

pub struct MockLine {
    key: LineKey,
    lines: Arc<Mutex<FxHashMap<LineKey, MockLineState>>>,
}

impl MockLine {
    fn set_level(&self, level: bool) {
        if let Some(line) = self.lines.lock().get_mut(&self.key) {
            line.level = level;
        }
    }

    fn level(&self) -> bool {
        self.lines
            .lock()
            .get(&self.key)
            .map(|line| line.level)
            .unwrap_or(false)
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        if let Some(line) = self.lines.lock().get_mut(&self.key) {
            line.requested = false;
        }
    }
}

impl MockLineBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical level last driven on the line, if it was ever requested.
    pub fn level(&self, chip: &str, offset: u32) -> Option<bool> {
        self.lines
            .lock()
            .get(&LineKey::new(chip, offset))
            .map(|line| line.level)
    }

    pub fn is_requested(&self, chip: &str, offset: u32) -> bool {
        self.lines
            .lock()
            .get(&LineKey::new(chip, offset))
            .is_some_and(|line| line.requested)
    }

    /// How many times the line has been requested over its lifetime.
    pub fn request_count(&self, chip: &str, offset: u32) -> usize {
        self.lines
            .lock()
            .get(&LineKey::new(chip, offset))
            .map_or(0, |line| line.requests)
    }

    /// Marks the line as held by another consumer.
    pub fn claim(&self, chip: &str, offset: u32) {
        self.lines
            .lock()
            .entry(LineKey::new(chip, offset))
            .or_default()
            .requested = true;
    }

    /// Makes every future request of the line fail.
    pub fn break_line(&self, chip: &str, offset: u32) {
        self.broken.lock().insert(LineKey::new(chip, offset));
    }

    fn request(&self, key: &LineKey, initial: bool) -> Result<MockLine, BackendError> {
        if self.broken.lock().contains(key) {
            return Err(BackendError::LineRequestFailed {
                chip: key.chip.clone(),
                offset: key.offset,
                reason: "request lines: Device or resource busy".into(),
            });
        }

        let mut lines = self.lines.lock();
        let line = lines.entry(key.clone()).or_default();
        if line.requested {
            return Err(BackendError::LineAlreadyHeld {
                chip: key.chip.clone(),
                offset: key.offset,
            });
        }
        line.requested = true;
        line.requests += 1;
        line.level = initial;

        Ok(MockLine {
            key: key.clone(),
            lines: Arc::clone(&self.lines),
        })
    }
}

fn line_key(relay: &RelayEntry) -> Result<LineKey, BackendError> {
    relay.line_key().ok_or_else(|| BackendError::NotAddressable {
        relay_id: relay.id.clone(),
        mode: BackendMode::LineDescriptor,
    })
}

impl LineBackend for MockLineBackend {
    type Handle = MockLine;

    fn mode(&self) -> BackendMode {
        BackendMode::LineDescriptor
    }

    fn acquire(&self, config: &RelayConfiguration, held: &LineSet<MockLine>) -> Acquired<MockLine> {
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
                continue;
            }
            match self.request(&key, relay.active.to_physical(false)) {
                Ok(line) => {
                    let _ = acquired.lines.insert(key, line.into());
                }
                Err(e) => acquired.fail(relay, e),
            }
        }

        acquired
    }

    fn write(
        &self,
        lines: &LineSet<MockLine>,
        relay: &RelayEntry,
        on: bool,
    ) -> Result<(), BackendError> {
        let key = line_key(relay)?;
        lines
            .handle_for(relay, &key)?
            .set_level(relay.active.to_physical(on));
        Ok(())
    }

    fn read(&self, lines: &LineSet<MockLine>, relay: &RelayEntry) -> Result<bool, BackendError> {
        let key = line_key(relay)?;
        let level = lines.handle_for(relay, &key)?.level();
        Ok(relay.active.to_logical(level))
    }
}
