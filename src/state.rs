use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::EngineError;
use crate::models::{Settings, SnoozedItem, Store, Timestamp};
use crate::scheduler::WakePhase;

/// The single critical section of the engine: the store, its index and the
/// wake scheduler's phase are only ever touched under this one lock.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<EngineData>>,
}

impl AppState {
    pub fn new(store: Store, settings: Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineData {
                store,
                settings,
                wake: WakePhase::Idle,
                retry_after: None,
                last_snapshot_at: None,
                dirty: false,
                storage_warned: false,
            })),
        }
    }

    pub fn store(&self) -> Store {
        self.lock().store.clone()
    }

    /// Snoozed items, soonest first.
    pub fn items(&self) -> Vec<SnoozedItem> {
        self.lock().sorted_items()
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        self.lock().settings = settings;
    }

    pub fn wake_phase(&self) -> WakePhase {
        self.lock().wake
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub(crate) struct EngineData {
    pub store: Store,
    pub settings: Settings,
    pub wake: WakePhase,
    /// Earliest time the alarm may fire again after a failed restore.
    pub retry_after: Option<Timestamp>,
    pub last_snapshot_at: Option<Timestamp>,
    /// In-memory changes not yet flushed to the backend.
    pub dirty: bool,
    pub storage_warned: bool,
}

impl EngineData {
    pub fn sorted_items(&self) -> Vec<SnoozedItem> {
        let mut items: Vec<SnoozedItem> = self.store.items.values().cloned().collect();
        items.sort_by(|a, b| (a.pop_time, &a.id).cmp(&(b.pop_time, &b.id)));
        items
    }

    /// Applies `apply` to a working copy of the store and commits it only if the
    /// index invariants still hold afterwards.
    pub fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&mut Store) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut working = self.store.clone();
        let out = apply(&mut working)?;
        if let Err(reason) = working.check_invariants() {
            log::error!("index invariant violated after mutation: {reason}");
            return Err(EngineError::StoreCorruption(reason));
        }
        self.store = working;
        self.dirty = true;
        Ok(out)
    }

    /// Swaps in a whole store (import or recovery). Scheduling restarts from it.
    pub fn replace_store(&mut self, store: Store) {
        self.store = store;
        self.retry_after = None;
        self.dirty = true;
    }
}
