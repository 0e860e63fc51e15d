use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::models::DeleteTarget;

/// How long a delete can still be undone.
pub const DELETE_GRACE: Duration = Duration::from_secs(5);

pub type DeleteExecutor = Arc<dyn Fn(&DeleteTarget) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    Waiting,
    Executing,
}

struct PendingDelete {
    item_ids: Vec<String>,
    state: DeleteState,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    handle: Handle,
    grace: Duration,
    executor: DeleteExecutor,
    pending: Mutex<HashMap<DeleteTarget, PendingDelete>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<DeleteTarget, PendingDelete>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whoever moves the entry out of `Waiting` first owns it; an undo that
    /// arrives later finds it `Executing` and loses.
    fn execute(&self, target: &DeleteTarget) -> bool {
        {
            let mut pending = self.pending();
            match pending.get_mut(target) {
                Some(entry) if entry.state == DeleteState::Waiting => {
                    entry.state = DeleteState::Executing;
                }
                _ => return false,
            }
        }
        log::info!(
            "executing deferred delete kind={:?} key={}",
            target.kind(),
            target.key()
        );
        (self.executor)(target);
        self.pending().remove(target);
        true
    }
}

/// Deletes that wait out a grace period so the user can undo them.
pub struct DeferredDeletes {
    inner: Arc<Inner>,
}

impl DeferredDeletes {
    pub fn new(handle: Handle, executor: DeleteExecutor) -> Self {
        Self::with_grace(handle, DELETE_GRACE, executor)
    }

    pub fn with_grace(handle: Handle, grace: Duration, executor: DeleteExecutor) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                grace,
                executor,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts (or restarts) the grace timer for `target`. Returns false if the
    /// target is already being deleted.
    pub fn schedule(&self, target: DeleteTarget, item_ids: Vec<String>) -> bool {
        let mut pending = self.inner.pending();
        if let Some(existing) = pending.get_mut(&target) {
            if existing.state == DeleteState::Executing {
                return false;
            }
            if let Some(timer) = existing.timer.take() {
                timer.abort();
            }
        }
        let inner = Arc::clone(&self.inner);
        let timer_target = target.clone();
        let grace = self.inner.grace;
        let timer = self.inner.handle.spawn(async move {
            tokio::time::sleep(grace).await;
            inner.execute(&timer_target);
        });
        log::debug!(
            "deferred delete scheduled kind={:?} key={} items={}",
            target.kind(),
            target.key(),
            item_ids.len()
        );
        pending.insert(
            target,
            PendingDelete {
                item_ids,
                state: DeleteState::Waiting,
                timer: Some(timer),
            },
        );
        true
    }

    /// Undo. Only succeeds while the delete is still waiting.
    pub fn cancel(&self, target: &DeleteTarget) -> bool {
        let mut pending = self.inner.pending();
        match pending.get(target).map(|entry| entry.state) {
            Some(DeleteState::Waiting) => {
                if let Some(timer) = pending.remove(target).and_then(|entry| entry.timer) {
                    timer.abort();
                }
                log::debug!("deferred delete undone key={}", target.key());
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Vec<(DeleteTarget, Vec<String>)> {
        let mut entries: Vec<(DeleteTarget, Vec<String>)> = self
            .inner
            .pending()
            .iter()
            .filter(|(_, entry)| entry.state == DeleteState::Waiting)
            .map(|(target, entry)| (target.clone(), entry.item_ids.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn state_of(&self, target: &DeleteTarget) -> Option<DeleteState> {
        self.inner.pending().get(target).map(|entry| entry.state)
    }

    /// Whether an item, or a group, is hidden behind a pending delete.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner
            .pending()
            .iter()
            .any(|(target, entry)| {
                target.key() == id || entry.item_ids.iter().any(|item| item == id)
            })
    }

    /// Runs every waiting delete now. Used on teardown.
    pub fn flush(&self) -> usize {
        let targets: Vec<DeleteTarget> = {
            let mut pending = self.inner.pending();
            pending
                .iter_mut()
                .filter(|(_, entry)| entry.state == DeleteState::Waiting)
                .map(|(target, entry)| {
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    target.clone()
                })
                .collect()
        };
        targets
            .iter()
            .filter(|target| self.inner.execute(target))
            .count()
    }
}

impl Drop for DeferredDeletes {
    fn drop(&mut self) {
        let flushed = self.flush();
        if flushed > 0 {
            log::info!("flushed pending deletes on shutdown count={flushed}");
        }
    }
}
