use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::{persist, recover_from_corruption, state_payload, EngineCtx};
use crate::error::EngineError;
use crate::events::{Notification, NotificationKind, RestoreOutcome, RestoreRequest};
use crate::models::{DeleteTarget, Timestamp};
use crate::state::{AppState, EngineData};

pub const WAKE_ALARM: &str = "snooze-wake";
/// Back-off before failed restores are attempted again by the alarm.
pub const RESTORE_RETRY_DELAY_MS: i64 = 60_000;
/// Catch-up period covering alarms lost while the host was asleep.
pub const CATCH_UP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePhase {
    Idle,
    Armed { at: Timestamp },
    Firing,
}

pub fn start_scheduler<C>(
    ctx: Arc<C>,
    state: AppState,
    mut alarms: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()>
where
    C: EngineCtx + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CATCH_UP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                fired = alarms.recv() => match fired {
                    Some(name) => {
                        on_alarm(ctx.as_ref(), &state, &name);
                    }
                    None => {
                        log::info!("alarm channel closed, scheduler stopping");
                        break;
                    }
                },
                _ = interval.tick() => catch_up(ctx.as_ref(), &state),
            }
        }
    })
}

/// Restart path: timers from a previous run are gone, so the deadline is
/// re-derived from the store after firing anything already due.
pub fn startup(ctx: &impl EngineCtx, state: &AppState) -> Vec<RestoreOutcome> {
    let mut data = state.lock();
    ctx.alarm().cancel(WAKE_ALARM);
    data.wake = WakePhase::Idle;
    data.retry_after = None;
    let outcomes = fire_locked(ctx, &mut data, ctx.now_ms());
    log::info!(
        "scheduler started pending={} fired={} phase={:?}",
        data.store.items.len(),
        outcomes.len(),
        data.wake
    );
    outcomes
}

pub fn on_alarm(ctx: &impl EngineCtx, state: &AppState, name: &str) -> Vec<RestoreOutcome> {
    if name != WAKE_ALARM {
        log::debug!("ignoring unknown alarm name={name}");
        return Vec::new();
    }
    fire(ctx, state, ctx.now_ms())
}

/// Fires now regardless of any retry back-off. Running it twice restores
/// nothing the second time.
pub fn force_restore_check(ctx: &impl EngineCtx, state: &AppState) -> Vec<RestoreOutcome> {
    let mut data = state.lock();
    data.retry_after = None;
    fire_locked(ctx, &mut data, ctx.now_ms())
}

pub fn fire(ctx: &impl EngineCtx, state: &AppState, now: Timestamp) -> Vec<RestoreOutcome> {
    let mut data = state.lock();
    fire_locked(ctx, &mut data, now)
}

fn catch_up(ctx: &impl EngineCtx, state: &AppState) {
    let now = ctx.now_ms();
    let mut data = state.lock();
    if data.dirty {
        let _ = persist(ctx, &mut data);
    }
    let backing_off = data.retry_after.is_some_and(|at| now < at);
    let overdue = data.store.next_bucket_time().is_some_and(|at| at <= now);
    if overdue && !backing_off {
        log::info!("catch-up found overdue items now={now}");
        fire_locked(ctx, &mut data, now);
    } else {
        rearm(ctx, &mut data);
    }
}

fn fire_locked(ctx: &impl EngineCtx, data: &mut EngineData, now: Timestamp) -> Vec<RestoreOutcome> {
    // Nothing is handed to the host until the index is known to be sound.
    if let Err(reason) = data.store.check_invariants() {
        recover_from_corruption(ctx, data, &reason);
    }
    data.wake = WakePhase::Firing;
    let due = data.store.due_buckets(now);
    let mut outcomes = Vec::new();
    let mut restored = Vec::new();
    let mut failed = Vec::new();

    for (bucket, ids) in &due {
        log::debug!("firing bucket={bucket} items={}", ids.len());
        for id in ids {
            let Some(item) = data.store.items.get(id) else {
                continue;
            };
            match ctx.restore_tab(&RestoreRequest::from(item)) {
                Ok(()) => {
                    restored.push(id.clone());
                    outcomes.push(RestoreOutcome {
                        item_id: id.clone(),
                        restored: true,
                        error: None,
                    });
                }
                Err(reason) => {
                    let error = EngineError::Restore {
                        item_id: id.clone(),
                        reason,
                    };
                    log::warn!("{error}");
                    failed.push(id.clone());
                    outcomes.push(RestoreOutcome {
                        item_id: id.clone(),
                        restored: false,
                        error: Some(error.to_string()),
                    });
                }
            }
        }
    }

    if !restored.is_empty() {
        let removal = data.mutate(|store| {
            for id in &restored {
                store.remove(&DeleteTarget::Item(id.clone()));
            }
            Ok(())
        });
        if let Err(error) = removal {
            log::error!("could not commit restored items err={error}");
        }
    }
    record_failures(ctx, data, &restored, &failed);

    if failed.is_empty() {
        data.retry_after = None;
    } else {
        data.retry_after = Some(now + RESTORE_RETRY_DELAY_MS);
        ctx.notify(Notification::new(
            NotificationKind::RestoreFailed,
            format!("{} snoozed tabs could not be reopened.", failed.len()),
        ));
    }

    if data.dirty {
        let _ = persist(ctx, data);
    }
    rearm(ctx, data);
    if !due.is_empty() {
        log::info!(
            "fired restored={} failed={} remaining={}",
            restored.len(),
            failed.len(),
            data.store.items.len()
        );
        ctx.emit_state_updated(state_payload(data));
    }
    outcomes
}

fn record_failures(
    ctx: &impl EngineCtx,
    data: &EngineData,
    restored: &[String],
    failed: &[String],
) {
    let previous = ctx.storage().load_failed_restores();
    let mut ids: BTreeSet<String> = previous.iter().cloned().collect();
    ids.extend(failed.iter().cloned());
    for id in restored {
        ids.remove(id);
    }
    ids.retain(|id| data.store.items.contains_key(id));
    let ids: Vec<String> = ids.into_iter().collect();
    if ids == previous {
        return;
    }
    if let Err(error) = ctx.storage().save_failed_restores(&ids) {
        log::warn!("failed-restore list update failed err={error}");
    }
}

/// Points the wake alarm at the next bucket, or past the retry back-off when
/// failed items are still waiting.
pub(crate) fn rearm(ctx: &impl EngineCtx, data: &mut EngineData) {
    let target = data
        .store
        .next_bucket_time()
        .map(|next| match data.retry_after {
            Some(retry) if retry > next => retry,
            _ => next,
        });
    match target {
        Some(at) => {
            if ctx.alarm().get(WAKE_ALARM) != Some(at) {
                ctx.alarm().arm(WAKE_ALARM, at);
            }
            data.wake = WakePhase::Armed { at };
        }
        None => {
            if data.wake != WakePhase::Idle {
                log::debug!("nothing snoozed, wake alarm cleared");
            }
            ctx.alarm().cancel(WAKE_ALARM);
            data.wake = WakePhase::Idle;
        }
    }
}
