use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::config::{LineKey, RelayConfiguration, ReloadPolicy};
use crate::error::AppError;
use crate::relay::{AcquireFailure, LineBackend, LineSet, LiveState, RelayController};

#[derive(Debug, Serialize)]
pub struct ReloadSummary {
    pub version: u64,
    pub relays: usize,
    /// Lines requested for the first time by this reload.
    pub requested: usize,
    /// Declared lines carried over from the previous state.
    pub reused: usize,
    /// Held lines no longer declared but kept per [`ReloadPolicy::RetainUndeclared`].
    pub retained: usize,
    pub released: usize,
    pub failures: Vec<AcquireFailure>,
}

impl<B: LineBackend> RelayController<B> {
    /// Loads `source` and swaps it in as the live relay map.
    ///
    /// Nothing changes when the file cannot be loaded or validated, or when
    /// not a single relay of a non-empty configuration could be acquired.
    pub fn reload<P: AsRef<Path>>(&self, source: P) -> Result<ReloadSummary, AppError> {
        let config = RelayConfiguration::load(&source).inspect_err(|e| {
            error!("reload {}: {e}", source.as_ref().display());
        })?;
        self.replace(config)
    }

    /// Swaps in an already loaded configuration, see [`RelayController::reload`].
    pub fn replace(&self, config: RelayConfiguration) -> Result<ReloadSummary, AppError> {
        config.ensure_addressable(self.backend.mode())?;

        let _reload = self.reload_lock.lock();
        let current = self.snapshot();
        let declared = config.line_keys();
        let held = self.reclaim(&current.lines, &declared);

        let mut acquired = self.backend.acquire(&config, &held);
        if !config.is_empty() && acquired.failures.len() == config.len() {
            error!("reload aborted: no relay of the new configuration could be acquired");
            let first = acquired.failures.remove(0);
            return Err(first.error.into());
        }

        let requested = acquired.lines.len();
        let mut next = acquired.lines;
        let mut released = LineSet::default();
        let (mut reused, mut retained) = (0, 0);

        for (key, handle) in held.iter() {
            if declared.contains(key) {
                if next.insert(key.clone(), Arc::clone(handle)).is_ok() {
                    reused += 1;
                }
                continue;
            }
            match self.policy {
                ReloadPolicy::RetainUndeclared => {
                    warn!("line {key} is no longer declared but stays held");
                    if next.insert(key.clone(), Arc::clone(handle)).is_ok() {
                        retained += 1;
                    }
                }
                ReloadPolicy::ReleaseUndeclared => {
                    let _ = released.insert(key.clone(), Arc::clone(handle));
                }
            }
        }
        drop(held);

        let version = current.version + 1;
        let relays = config.len();
        drop(current);
        *self.live.write() = Arc::new(LiveState {
            version,
            config,
            lines: next,
        });

        let released_count = released.len();
        if !released.is_empty() {
            let mut releasing = self.releasing.lock();
            for (key, handle) in released.iter() {
                releasing.insert(key.clone(), Arc::downgrade(handle));
            }
            drop(releasing);
            self.backend.release(released);
        }

        info!(
            "relay configuration v{version} live: {relays} relays, {requested} requested, {reused} reused, {retained} retained, {released_count} released, {} failed",
            acquired.failures.len()
        );

        Ok(ReloadSummary {
            version,
            relays,
            requested,
            reused,
            retained,
            released: released_count,
            failures: acquired.failures,
        })
    }

    /// Held lines plus any released handle that is still alive and declared
    /// again. Entries whose handle is gone are pruned.
    fn reclaim(
        &self,
        held: &LineSet<B::Handle>,
        declared: &FxHashSet<LineKey>,
    ) -> LineSet<B::Handle> {
        let mut lines = held.clone();
        let mut releasing = self.releasing.lock();
        releasing.retain(|_, weak| weak.strong_count() > 0);
        for (key, weak) in releasing.iter() {
            if !declared.contains(key) || lines.contains(key) {
                continue;
            }
            if let Some(handle) = weak.upgrade() {
                info!("line {key} reclaimed before its release completed");
                let _ = lines.insert(key.clone(), handle);
            }
        }
        lines
    }
}
