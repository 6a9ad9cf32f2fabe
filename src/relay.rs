use log::{debug, error, warn};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Serialize, Serializer};

use crate::config::{
    BackendMode, LineKey, Polarity, RelayConfiguration, RelayEntry, ReloadPolicy,
};
use crate::error::{AppError, BackendError};

/// Lines held by the process, keyed by controller and offset.
pub struct LineSet<H> {
    lines: FxHashMap<LineKey, Arc<H>>,
}

impl<H> Default for LineSet<H> {
    fn default() -> Self {
        Self {
            lines: FxHashMap::default(),
        }
    }
}

impl<H> Clone for LineSet<H> {
    fn clone(&self) -> Self {
        Self {
            lines: self.lines.clone(),
        }
    }
}

impl<H> LineSet<H> {
    pub fn get(&self, key: &LineKey) -> Option<&Arc<H>> {
        self.lines.get(key)
    }

    pub fn contains(&self, key: &LineKey) -> bool {
        self.lines.contains_key(key)
    }

    /// Returns the handle back if the line is already present.
    pub fn insert(&mut self, key: LineKey, handle: Arc<H>) -> Result<(), Arc<H>> {
        if self.lines.contains_key(&key) {
            return Err(handle);
        }
        self.lines.insert(key, handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &LineKey> {
        self.lines.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LineKey, &Arc<H>)> {
        self.lines.iter()
    }

    pub(crate) fn handle_for(&self, relay: &RelayEntry, key: &LineKey) -> Result<&Arc<H>, BackendError> {
        self.get(key).ok_or_else(|| {
            debug!("relay {} has no held line {key}", relay.id);
            BackendError::LineNotHeld {
                chip: key.chip.clone(),
                offset: key.offset,
            }
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AcquireFailure {
    pub relay_id: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: BackendError,
}

fn serialize_display<S: Serializer>(error: &BackendError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Outcome of a best-effort acquisition: the lines newly requested plus
/// every relay that could not be brought up.
pub struct Acquired<H> {
    pub lines: LineSet<H>,
    pub failures: Vec<AcquireFailure>,
}

impl<H> Default for Acquired<H> {
    fn default() -> Self {
        Self {
            lines: LineSet::default(),
            failures: Vec::new(),
        }
    }
}

impl<H> Acquired<H> {
    pub fn fail(&mut self, relay: &RelayEntry, error: BackendError) {
        match &error {
            BackendError::LineAlreadyHeld { .. } => {
                warn!("relay {}: {error}, skipping", relay.id)
            }
            _ => error!("relay {}: {error}", relay.id),
        }
        self.failures.push(AcquireFailure {
            relay_id: relay.id.clone(),
            error,
        });
    }
}

pub trait LineBackend: Send + Sync {
    type Handle: Send + Sync;

    fn mode(&self) -> BackendMode;

    /// Requests every line of `config` not already in `held`. Per-relay
    /// failures are reported, never raised.
    fn acquire(
        &self,
        config: &RelayConfiguration,
        held: &LineSet<Self::Handle>,
    ) -> Acquired<Self::Handle>;

    fn write(
        &self,
        lines: &LineSet<Self::Handle>,
        relay: &RelayEntry,
        on: bool,
    ) -> Result<(), BackendError>;

    fn read(&self, lines: &LineSet<Self::Handle>, relay: &RelayEntry) -> Result<bool, BackendError>;

    fn release(&self, lines: LineSet<Self::Handle>) {
        for key in lines.keys() {
            debug!("releasing line {key}");
        }
    }
}

/// Configuration and held lines as one published unit.
pub struct LiveState<H> {
    pub version: u64,
    pub config: RelayConfiguration,
    pub lines: LineSet<H>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub active: Polarity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RelayController<B: LineBackend> {
    pub(crate) backend: Arc<B>,
    pub(crate) live: RwLock<Arc<LiveState<B::Handle>>>,
    pub(crate) reload_lock: Mutex<()>,
    pub(crate) policy: ReloadPolicy,
    /// Handles given up by a reload that older snapshots may still own.
    pub(crate) releasing: Mutex<FxHashMap<LineKey, Weak<B::Handle>>>,
}

impl<B: LineBackend> RelayController<B> {
    /// Acquires the initial configuration and publishes it even if some
    /// relays could not be brought up.
    pub fn start(backend: Arc<B>, config: RelayConfiguration, policy: ReloadPolicy) -> Self {
        let acquired = backend.acquire(&config, &LineSet::default());
        if !acquired.failures.is_empty() {
            warn!(
                "{} of {} relays failed to initialize",
                acquired.failures.len(),
                config.len()
            );
        }

        Self {
            backend,
            live: RwLock::new(Arc::new(LiveState {
                version: 1,
                config,
                lines: acquired.lines,
            })),
            reload_lock: Mutex::new(()),
            policy,
            releasing: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn snapshot(&self) -> Arc<LiveState<B::Handle>> {
        Arc::clone(&self.live.read())
    }

    pub fn version(&self) -> u64 {
        self.live.read().version
    }

    pub fn set_relay(&self, id: &str, on: bool) -> Result<(), AppError> {
        let state = self.snapshot();
        let relay = Self::lookup(&state, id)?;
        self.backend.write(&state.lines, relay, on).map_err(|e| {
            error!("set relay {id}: {e}");
            AppError::from(e)
        })
    }

    pub fn set_relay_value(&self, id: &str, value: u8) -> Result<(), AppError> {
        if value > 1 {
            return Err(AppError::InvalidState("State must be 0 or 1".into()));
        }
        self.set_relay(id, value == 1)
    }

    pub fn get_relay(&self, id: &str) -> Result<bool, AppError> {
        let state = self.snapshot();
        let relay = Self::lookup(&state, id)?;
        self.backend.read(&state.lines, relay).map_err(|e| {
            error!("get relay {id}: {e}");
            AppError::from(e)
        })
    }

    pub fn list_relays(&self) -> Vec<RelayStatus> {
        let state = self.snapshot();
        state
            .config
            .sorted()
            .into_iter()
            .map(|relay| {
                let (on, error) = match self.backend.read(&state.lines, relay) {
                    Ok(on) => (Some(on), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                RelayStatus {
                    id: relay.id.clone(),
                    name: relay.name.clone(),
                    active: relay.active,
                    state: on,
                    error,
                }
            })
            .collect()
    }

    /// Releases every held line. Lines still referenced by in-flight
    /// requests are freed once those finish.
    pub fn shutdown(&self) {
        let _reload = self.reload_lock.lock();
        let lines = {
            let mut live = self.live.write();
            let lines = live.lines.clone();
            *live = Arc::new(LiveState {
                version: live.version + 1,
                config: live.config.clone(),
                lines: LineSet::default(),
            });
            lines
        };
        self.backend.release(lines);
    }

    fn lookup<'a>(
        state: &'a LiveState<B::Handle>,
        id: &str,
    ) -> Result<&'a RelayEntry, AppError> {
        state
            .config
            .get(id)
            .ok_or_else(|| AppError::UnknownRelay(id.to_string()))
    }
}
