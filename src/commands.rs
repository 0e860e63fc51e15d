use chrono::{TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::alarm::Alarm;
use crate::backup::{self, SnapshotEntry};
use crate::error::EngineError;
use crate::events::{
    Notification, NotificationKind, RestoreOutcome, RestoreRequest, StatePayload,
};
use crate::models::{
    DeleteTarget, RecoveryOutcome, RecoveryResult, Settings, SnoozeAction, SnoozedItem, Store,
    TabRef, Timestamp,
};
use crate::resolver::resolve;
use crate::scheduler;
use crate::state::{AppState, EngineData};
use crate::storage::{Storage, StorageError};

/// Usage above which the user is warned once about running out of space.
pub const STORAGE_QUOTA_BYTES: u64 = 5 * 1024 * 1024;
const STORAGE_WARN_PERCENT: u64 = 80;

#[derive(Debug, serde::Serialize)]
pub struct CommandResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Everything the engine needs from its host.
pub trait EngineCtx: Send + Sync {
    type Zone: TimeZone;

    fn storage(&self) -> &Storage;
    fn alarm(&self) -> &dyn Alarm;
    /// Reopens one tab. `Ok` is the host's acknowledgement.
    fn restore_tab(&self, request: &RestoreRequest) -> Result<(), String>;
    fn notify(&self, notification: Notification);
    /// Local zone used to resolve day-relative snooze choices.
    fn timezone(&self) -> Self::Zone;

    fn emit_state_updated(&self, _payload: StatePayload) {}

    fn now_ms(&self) -> Timestamp {
        Utc::now().timestamp_millis()
    }
}

fn ok<T>(data: T) -> CommandResult<T> {
    CommandResult {
        ok: true,
        data: Some(data),
        error: None,
    }
}

fn err<T>(message: &str) -> CommandResult<T> {
    CommandResult {
        ok: false,
        data: None,
        error: Some(message.to_string()),
    }
}

/// Flushes the store. On failure the state stays dirty and the next commit
/// tries again.
pub(crate) fn persist(ctx: &impl EngineCtx, data: &mut EngineData) -> Result<(), StorageError> {
    if let Err(error) = ctx.storage().save_store(&data.store) {
        log::error!(
            "store flush failed items={} err={error}",
            data.store.items.len()
        );
        return Err(error);
    }
    data.dirty = false;
    backup::maybe_snapshot(ctx.storage(), data, ctx.now_ms());
    check_storage_usage(ctx, data);
    Ok(())
}

fn check_storage_usage(ctx: &impl EngineCtx, data: &mut EngineData) {
    let used = ctx.storage().size_in_use();
    let threshold = STORAGE_QUOTA_BYTES * STORAGE_WARN_PERCENT / 100;
    if used < threshold {
        data.storage_warned = false;
        return;
    }
    if data.storage_warned {
        return;
    }
    log::warn!("storage usage high used_bytes={used} quota_bytes={STORAGE_QUOTA_BYTES}");
    ctx.notify(Notification::new(
        NotificationKind::StorageWarning,
        format!(
            "Snoozed tabs use {} of {} KiB of storage.",
            used / 1024,
            STORAGE_QUOTA_BYTES / 1024
        ),
    ));
    data.storage_warned = true;
}

pub(crate) fn state_payload(data: &EngineData) -> StatePayload {
    StatePayload {
        items: data.sorted_items(),
        settings: data.settings.clone(),
    }
}

pub(crate) fn recovery_notification(result: &RecoveryResult) -> Notification {
    let message = if result.outcome == RecoveryOutcome::FullLoss {
        "Snoozed tabs could not be recovered. Starting with an empty list.".to_string()
    } else if result.sanitized && result.dropped > 0 {
        format!(
            "Recovered {} snoozed tabs. {} unreadable entries were skipped.",
            result.tab_count, result.dropped
        )
    } else {
        format!("Recovered {} snoozed tabs.", result.tab_count)
    };
    Notification::new(NotificationKind::RecoveryNotification, message)
}

/// Persists, re-arms and publishes after a committed change.
fn commit(ctx: &impl EngineCtx, data: &mut EngineData) {
    let _ = persist(ctx, data);
    scheduler::rearm(ctx, data);
    ctx.emit_state_updated(state_payload(data));
}

/// Swaps in a store from recovery, import or a snapshot.
fn install_store(ctx: &impl EngineCtx, data: &mut EngineData, store: Store) {
    data.replace_store(store);
    prune_failed_restores(ctx, data);
    commit(ctx, data);
}

/// Replaces a corrupt in-memory store with the best persisted copy and tells
/// the user.
pub(crate) fn recover_from_corruption(ctx: &impl EngineCtx, data: &mut EngineData, reason: &str) {
    log::error!("store corruption detected, running recovery reason={reason}");
    let (store, result) = backup::recover(ctx.storage());
    install_store(ctx, data, store);
    ctx.notify(recovery_notification(&result));
}

fn fail<T>(ctx: &impl EngineCtx, data: &mut EngineData, error: EngineError) -> CommandResult<T> {
    if let EngineError::StoreCorruption(reason) = &error {
        recover_from_corruption(ctx, data, reason);
    }
    err(&error.to_string())
}

/// Drops ids from the failed-restore list that are no longer snoozed.
fn prune_failed_restores(ctx: &impl EngineCtx, data: &EngineData) {
    let failed = ctx.storage().load_failed_restores();
    let kept: Vec<String> = failed
        .iter()
        .filter(|id| data.store.items.contains_key(*id))
        .cloned()
        .collect();
    if kept.len() != failed.len() {
        if let Err(error) = ctx.storage().save_failed_restores(&kept) {
            log::warn!("failed-restore list update failed err={error}");
        }
    }
}

fn resolve_now(
    ctx: &impl EngineCtx,
    action: &SnoozeAction,
    settings: &Settings,
) -> Result<Timestamp, EngineError> {
    resolve(action, ctx.now_ms(), &ctx.timezone(), settings)
}

fn check_tab(tab: &TabRef) -> Result<(), EngineError> {
    if tab.url.trim().is_empty() {
        return Err(EngineError::InvalidSchedule("tab has no url".to_string()));
    }
    Ok(())
}

pub fn load_state(state: &AppState) -> CommandResult<StatePayload> {
    ok(state_payload(&state.lock()))
}

pub fn snooze(
    ctx: &impl EngineCtx,
    state: &AppState,
    tab: TabRef,
    action: &SnoozeAction,
) -> CommandResult<SnoozedItem> {
    let mut data = state.lock();
    let prepared = check_tab(&tab).and_then(|_| resolve_now(ctx, action, &data.settings));
    let pop_time = match prepared {
        Ok(pop_time) => pop_time,
        Err(error) => return err(&error.to_string()),
    };
    let item = SnoozedItem {
        id: Uuid::new_v4().to_string(),
        url: tab.url,
        title: tab.title,
        favicon: tab.favicon,
        creation_time: ctx.now_ms(),
        pop_time,
        group_id: None,
        index: tab.index,
    };
    if let Err(error) = data.mutate(|store| store.insert(item.clone())) {
        return fail(ctx, &mut data, error);
    }
    log::info!("snoozed id={} pop_time={pop_time}", item.id);
    commit(ctx, &mut data);
    ok(item)
}

/// Snoozes a whole window as one group that wakes together.
pub fn snooze_window(
    ctx: &impl EngineCtx,
    state: &AppState,
    tabs: Vec<TabRef>,
    action: &SnoozeAction,
) -> CommandResult<Vec<SnoozedItem>> {
    if tabs.is_empty() {
        return err("window has no tabs");
    }
    let mut data = state.lock();
    let prepared = tabs
        .iter()
        .try_for_each(check_tab)
        .and_then(|_| resolve_now(ctx, action, &data.settings));
    let pop_time = match prepared {
        Ok(pop_time) => pop_time,
        Err(error) => return err(&error.to_string()),
    };
    let group_id = Uuid::new_v4().to_string();
    let now = ctx.now_ms();
    let items: Vec<SnoozedItem> = tabs
        .into_iter()
        .enumerate()
        .map(|(position, tab)| SnoozedItem {
            id: Uuid::new_v4().to_string(),
            url: tab.url,
            title: tab.title,
            favicon: tab.favicon,
            creation_time: now,
            pop_time,
            group_id: Some(group_id.clone()),
            index: tab.index.or(Some(position as u32)),
        })
        .collect();
    if let Err(error) = data.mutate(|store| store.insert_group(items.clone())) {
        return fail(ctx, &mut data, error);
    }
    log::info!(
        "snoozed window group={group_id} tabs={} pop_time={pop_time}",
        items.len()
    );
    commit(ctx, &mut data);
    ok(items)
}

/// Moves an item, or a whole group, to a new wake time.
pub fn reschedule(
    ctx: &impl EngineCtx,
    state: &AppState,
    key: &str,
    action: &SnoozeAction,
) -> CommandResult<Vec<String>> {
    let mut data = state.lock();
    let Some(target) = data.store.resolve_target(key) else {
        return err(&format!("no snoozed tab or group with id {key}"));
    };
    let pop_time = match resolve_now(ctx, action, &data.settings) {
        Ok(pop_time) => pop_time,
        Err(error) => return err(&error.to_string()),
    };
    let moved = match data.mutate(|store| store.reschedule(&target, pop_time)) {
        Ok(moved) => moved,
        Err(error) => return fail(ctx, &mut data, error),
    };
    log::info!("rescheduled key={key} count={} pop_time={pop_time}", moved.len());
    commit(ctx, &mut data);
    ok(moved)
}

/// Unsnoozes by id. An item id wins over a group id with the same value.
pub fn cancel_snooze(
    ctx: &impl EngineCtx,
    state: &AppState,
    key: &str,
) -> CommandResult<Vec<SnoozedItem>> {
    let mut data = state.lock();
    match data.store.resolve_target(key) {
        Some(target) => cancel_locked(ctx, &mut data, &target),
        None => err(&format!("no snoozed tab or group with id {key}")),
    }
}

pub fn cancel_target(
    ctx: &impl EngineCtx,
    state: &AppState,
    target: &DeleteTarget,
) -> CommandResult<Vec<SnoozedItem>> {
    cancel_locked(ctx, &mut state.lock(), target)
}

fn cancel_locked(
    ctx: &impl EngineCtx,
    data: &mut EngineData,
    target: &DeleteTarget,
) -> CommandResult<Vec<SnoozedItem>> {
    let removed = match data.mutate(|store| Ok(store.remove(target))) {
        Ok(removed) => removed,
        Err(error) => return fail(ctx, data, error),
    };
    if removed.is_empty() {
        return err(&format!("{} is no longer snoozed", target.key()));
    }
    log::info!(
        "cancelled snooze kind={:?} key={} count={}",
        target.kind(),
        target.key(),
        removed.len()
    );
    prune_failed_restores(ctx, data);
    commit(ctx, data);
    ok(removed)
}

pub fn list_pending(state: &AppState) -> CommandResult<Vec<SnoozedItem>> {
    ok(state.items())
}

pub fn force_restore_check(
    ctx: &impl EngineCtx,
    state: &AppState,
) -> CommandResult<Vec<RestoreOutcome>> {
    ok(scheduler::force_restore_check(ctx, state))
}

pub fn export_all(state: &AppState) -> CommandResult<Value> {
    match serde_json::to_value(state.store()) {
        Ok(value) => ok(value),
        Err(error) => err(&format!("export failed: {error}")),
    }
}

/// Replaces every snoozed tab with the imported data.
pub fn import_all(
    ctx: &impl EngineCtx,
    state: &AppState,
    value: Value,
) -> CommandResult<RecoveryResult> {
    let (store, result) = match backup::import_store(&value) {
        Ok(parsed) => parsed,
        Err(error) => {
            log::warn!("import rejected err={error}");
            return err(&error.to_string());
        }
    };
    let mut data = state.lock();
    install_store(ctx, &mut data, store);
    log::info!(
        "imported tabs={} sanitized={} dropped={}",
        result.tab_count,
        result.sanitized,
        result.dropped
    );
    ok(result)
}

pub fn update_settings(
    ctx: &impl EngineCtx,
    state: &AppState,
    settings: Settings,
) -> CommandResult<Settings> {
    if let Err(reason) = settings.validate() {
        return err(&format!("invalid settings: {reason}"));
    }
    if let Err(error) = ctx.storage().save_settings(&settings) {
        return err(&format!("storage error: {error}"));
    }
    let mut data = state.lock();
    data.settings = settings.clone();
    ctx.emit_state_updated(state_payload(&data));
    ok(settings)
}

/// Items whose last restore attempt failed and that are still snoozed.
pub fn failed_restores(ctx: &impl EngineCtx, state: &AppState) -> CommandResult<Vec<SnoozedItem>> {
    let data = state.lock();
    let items = ctx
        .storage()
        .load_failed_restores()
        .iter()
        .filter_map(|id| data.store.items.get(id).cloned())
        .collect();
    ok(items)
}

pub fn list_snapshots(ctx: &impl EngineCtx) -> CommandResult<Vec<SnapshotEntry>> {
    ok(backup::list_snapshots(ctx.storage()))
}

pub fn restore_snapshot(
    ctx: &impl EngineCtx,
    state: &AppState,
    slot: &str,
) -> CommandResult<RecoveryResult> {
    let (store, result) = match backup::restore_snapshot(ctx.storage(), slot) {
        Ok(loaded) => loaded,
        Err(error) => return err(&error.to_string()),
    };
    let mut data = state.lock();
    install_store(ctx, &mut data, store);
    log::info!("restored snapshot slot={slot} tabs={}", result.tab_count);
    ok(result)
}
