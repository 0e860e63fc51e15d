//! Fake host shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::TimeZone;

use crate::alarm::Alarm;
use crate::commands::EngineCtx;
use crate::events::{Notification, NotificationKind, RestoreRequest, StatePayload};
use crate::models::{SnoozedItem, TabRef, Timestamp};
use crate::storage::{MemoryBackend, RetryPolicy, Storage};

pub const HOUR_MS: i64 = 60 * 60_000;

pub fn make_item(id: &str, pop_time: Timestamp) -> SnoozedItem {
    SnoozedItem {
        id: id.to_string(),
        url: format!("https://example.com/{id}"),
        title: format!("tab-{id}"),
        favicon: None,
        creation_time: 1,
        pop_time,
        group_id: None,
        index: None,
    }
}

pub fn make_tab(name: &str) -> TabRef {
    TabRef {
        url: format!("https://example.com/{name}"),
        title: format!("tab-{name}"),
        favicon: None,
        index: None,
    }
}

/// Alarm that only records what it was asked to do.
#[derive(Default)]
pub struct ManualAlarm {
    armed: Mutex<HashMap<String, Timestamp>>,
}

impl Alarm for ManualAlarm {
    fn arm(&self, name: &str, when: Timestamp) {
        self.armed.lock().unwrap().insert(name.to_string(), when);
    }

    fn cancel(&self, name: &str) {
        self.armed.lock().unwrap().remove(name);
    }

    fn get(&self, name: &str) -> Option<Timestamp> {
        self.armed.lock().unwrap().get(name).copied()
    }
}

pub struct TestCtx {
    pub backend: MemoryBackend,
    storage: Storage,
    pub alarm: ManualAlarm,
    now: AtomicI64,
    restored: Mutex<Vec<RestoreRequest>>,
    failing_urls: Mutex<HashSet<String>>,
    notifications: Mutex<Vec<Notification>>,
    emitted: Mutex<usize>,
}

impl TestCtx {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: MemoryBackend) -> Self {
        let storage = Storage::new(backend.clone()).with_retry(RetryPolicy { attempts: 3 });
        // Wednesday 2026-10-14 10:00 in Berlin.
        let now = chrono::Utc
            .with_ymd_and_hms(2026, 10, 14, 8, 0, 0)
            .unwrap()
            .timestamp_millis();
        Self {
            backend,
            storage,
            alarm: ManualAlarm::default(),
            now: AtomicI64::new(now),
            restored: Mutex::new(Vec::new()),
            failing_urls: Mutex::new(HashSet::new()),
            notifications: Mutex::new(Vec::new()),
            emitted: Mutex::new(0),
        }
    }

    pub fn set_now(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: i64) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn heal_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().remove(url);
    }

    pub fn restored(&self) -> Vec<RestoreRequest> {
        self.restored.lock().unwrap().clone()
    }

    pub fn restored_ids(&self) -> Vec<String> {
        self.restored()
            .into_iter()
            .map(|request| request.item_id)
            .collect()
    }

    pub fn notification_kinds(&self) -> Vec<NotificationKind> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|notification| notification.kind)
            .collect()
    }

    pub fn emitted_count(&self) -> usize {
        *self.emitted.lock().unwrap()
    }
}

impl EngineCtx for TestCtx {
    type Zone = chrono_tz::Tz;

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn alarm(&self) -> &dyn Alarm {
        &self.alarm
    }

    fn restore_tab(&self, request: &RestoreRequest) -> Result<(), String> {
        if self.failing_urls.lock().unwrap().contains(&request.url) {
            return Err("tab could not be opened".to_string());
        }
        self.restored.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }

    fn timezone(&self) -> Self::Zone {
        chrono_tz::Europe::Berlin
    }

    fn emit_state_updated(&self, _payload: StatePayload) {
        *self.emitted.lock().unwrap() += 1;
    }

    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
