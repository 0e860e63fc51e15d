// Headless host: JSON-line requests on stdin, replies and restore requests on stdout.

use std::error::Error;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use tab_snooze_lib::alarm::{Alarm, TokioAlarm};
use tab_snooze_lib::commands;
use tab_snooze_lib::deferred::{DeferredDeletes, DeleteExecutor};
use tab_snooze_lib::events::{Notification, RestoreRequest, StatePayload};
use tab_snooze_lib::logging::init_logging;
use tab_snooze_lib::models::{DeleteTarget, Settings, SnoozeAction, TabRef};
use tab_snooze_lib::scheduler::start_scheduler;
use tab_snooze_lib::storage::{FileBackend, Storage};
use tab_snooze_lib::{AppState, CommandResult, EngineCtx};

const DATA_DIR_ENV: &str = "TAB_SNOOZE_DATA";

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Load,
    Snooze { tab: TabRef, action: SnoozeAction },
    SnoozeWindow { tabs: Vec<TabRef>, action: SnoozeAction },
    Reschedule { id: String, action: SnoozeAction },
    /// Unsnooze after the undo grace period.
    Delete { id: String },
    Undo { id: String },
    /// Unsnooze immediately.
    Cancel { id: String },
    List,
    ForceRestoreCheck,
    Export,
    Import { data: Value },
    UpdateSettings { settings: Settings },
    FailedRestores,
    ListSnapshots,
    RestoreSnapshot { slot: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Output<'a> {
    Reply { result: Value },
    Restore { request: &'a RestoreRequest },
    Notification { notification: &'a Notification },
    StateUpdated { payload: &'a StatePayload },
}

fn emit(output: &Output<'_>) -> Result<(), String> {
    let line = serde_json::to_string(output).map_err(|e| e.to_string())?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").map_err(|e| e.to_string())?;
    stdout.flush().map_err(|e| e.to_string())
}

struct HostCtx {
    storage: Storage,
    alarm: TokioAlarm,
}

impl EngineCtx for HostCtx {
    type Zone = Local;

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn alarm(&self) -> &dyn Alarm {
        &self.alarm
    }

    fn restore_tab(&self, request: &RestoreRequest) -> Result<(), String> {
        emit(&Output::Restore { request })
    }

    fn notify(&self, notification: Notification) {
        log::info!(
            "notification id={} message={}",
            notification.id(),
            notification.message
        );
        if let Err(error) = emit(&Output::Notification {
            notification: &notification,
        }) {
            log::warn!("notification not delivered err={error}");
        }
    }

    fn timezone(&self) -> Self::Zone {
        Local
    }

    fn emit_state_updated(&self, payload: StatePayload) {
        let _ = emit(&Output::StateUpdated { payload: &payload });
    }
}

fn reply<T: Serialize>(result: CommandResult<T>) -> Value {
    serde_json::to_value(result)
        .unwrap_or_else(|e| serde_json::json!({ "ok": false, "error": e.to_string() }))
}

fn reply_ok(value: bool) -> Value {
    reply(CommandResult {
        ok: true,
        data: Some(value),
        error: None,
    })
}

fn reply_err(message: String) -> Value {
    reply(CommandResult::<()> {
        ok: false,
        data: None,
        error: Some(message),
    })
}

fn handle(ctx: &HostCtx, state: &AppState, deletes: &DeferredDeletes, request: Request) -> Value {
    match request {
        Request::Load => reply(commands::load_state(state)),
        Request::Snooze { tab, action } => reply(commands::snooze(ctx, state, tab, &action)),
        Request::SnoozeWindow { tabs, action } => {
            reply(commands::snooze_window(ctx, state, tabs, &action))
        }
        Request::Reschedule { id, action } => {
            reply(commands::reschedule(ctx, state, &id, &action))
        }
        Request::Delete { id } => {
            let store = state.store();
            match store.resolve_target(&id) {
                Some(target) => {
                    let item_ids = store.target_ids(&target);
                    reply_ok(deletes.schedule(target, item_ids))
                }
                None => reply_err(format!("no snoozed tab or group with id {id}")),
            }
        }
        Request::Undo { id } => {
            let target = deletes
                .pending()
                .into_iter()
                .map(|(target, _)| target)
                .find(|target| target.key() == id);
            match target {
                Some(target) => reply_ok(deletes.cancel(&target)),
                None => reply_err(format!("nothing to undo for {id}")),
            }
        }
        Request::Cancel { id } => reply(commands::cancel_snooze(ctx, state, &id)),
        Request::List => {
            let mut result = commands::list_pending(state);
            if let Some(items) = result.data.as_mut() {
                items.retain(|item| !deletes.is_pending(&item.id));
            }
            reply(result)
        }
        Request::ForceRestoreCheck => reply(commands::force_restore_check(ctx, state)),
        Request::Export => reply(commands::export_all(state)),
        Request::Import { data } => reply(commands::import_all(ctx, state, data)),
        Request::UpdateSettings { settings } => {
            reply(commands::update_settings(ctx, state, settings))
        }
        Request::FailedRestores => reply(commands::failed_restores(ctx, state)),
        Request::ListSnapshots => reply(commands::list_snapshots(ctx)),
        Request::RestoreSnapshot { slot } => {
            reply(commands::restore_snapshot(ctx, state, &slot))
        }
    }
}

fn data_dir() -> Result<PathBuf, String> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(DATA_DIR_ENV).ok())
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| format!("usage: tab-snooze <data-dir> (or set {DATA_DIR_ENV})"))
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (sender, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    log::warn!("stdin read failed err={error}");
                    break;
                }
            }
        }
    });
    receiver
}

async fn serve(data_dir: PathBuf) -> Result<(), Box<dyn Error>> {
    let backend = FileBackend::new(data_dir.join("store"));
    backend.ensure_dirs()?;
    let (alarm, alarms) = TokioAlarm::new(Handle::current());
    let ctx = Arc::new(HostCtx {
        storage: Storage::new(backend),
        alarm,
    });

    let (state, recovery) = tab_snooze_lib::start(ctx.as_ref());
    log::info!(
        "host ready data_dir={} tabs={}",
        data_dir.display(),
        recovery.tab_count
    );
    let scheduler = start_scheduler(Arc::clone(&ctx), state.clone(), alarms);

    let executor: DeleteExecutor = {
        let ctx = Arc::clone(&ctx);
        let state = state.clone();
        Arc::new(move |target: &DeleteTarget| {
            let result = commands::cancel_target(ctx.as_ref(), &state, target);
            if let Some(error) = result.error {
                log::warn!("deferred delete failed key={} err={error}", target.key());
            }
        })
    };
    let deletes = DeferredDeletes::new(Handle::current(), executor);

    let mut lines = spawn_stdin_reader();
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                log::debug!("request {request:?}");
                handle(ctx.as_ref(), &state, &deletes, request)
            }
            Err(error) => reply_err(format!("bad request: {error}")),
        };
        if let Err(error) = emit(&Output::Reply { result }) {
            log::error!("reply not written err={error}");
            break;
        }
    }

    log::info!("stdin closed, shutting down");
    drop(deletes);
    scheduler.abort();
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let data_dir = data_dir()?;
    init_logging(&data_dir)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(serve(data_dir))
}

fn main() {
    if let Err(error) = run() {
        eprintln!("tab-snooze: {error}");
        std::process::exit(1);
    }
}
