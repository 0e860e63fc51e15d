pub mod alarm;
pub mod backup;
pub mod commands;
pub mod deferred;
pub mod error;
pub mod events;
mod index;
pub mod logging;
pub mod models;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_utils;

pub use crate::commands::{CommandResult, EngineCtx};
pub use crate::error::EngineError;
pub use crate::index::restore_order;
pub use crate::models::RecoveryResult;
pub use crate::state::AppState;

use crate::models::RecoveryOutcome;

/// Brings the engine up: loads settings, recovers the store, tells the user
/// if anything had to be salvaged, then fires whatever came due while the
/// host was not running.
pub fn start(ctx: &impl EngineCtx) -> (AppState, RecoveryResult) {
    let settings = ctx.storage().load_settings();
    let outdated = backup::primary_is_outdated(ctx.storage());
    let (store, recovery) = backup::recover(ctx.storage());
    log::info!(
        "engine starting tabs={} outcome={:?} sanitized={}",
        recovery.tab_count,
        recovery.outcome,
        recovery.sanitized
    );
    if recovery.should_notify() {
        ctx.notify(commands::recovery_notification(&recovery));
    }

    let state = AppState::new(store, settings);
    if outdated || recovery.outcome != RecoveryOutcome::Clean {
        let mut data = state.lock();
        data.dirty = true;
        let _ = commands::persist(ctx, &mut data);
    }
    scheduler::startup(ctx, &state);
    (state, recovery)
}
