use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::models::{
    RecoveryOutcome, RecoveryResult, SnoozedItem, Snapshot, Store, Timestamp, STORE_VERSION,
};
use crate::state::EngineData;
use crate::storage::Storage;

const MINUTE_MS: i64 = 60_000;

/// Result of the sanitizing parser.
#[derive(Debug)]
pub struct ParsedStore {
    pub store: Store,
    /// Items present in the input, usable or not.
    pub declared: usize,
    pub dropped: usize,
    /// Items whose wake time was moved to re-join their group.
    pub realigned: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotEntry {
    pub slot: String,
    pub taken_at: Option<Timestamp>,
    pub tab_count: usize,
    pub valid: bool,
}

/// Strict load: the value must be a store this build understands (after
/// migration), every item must be well formed and the index must match.
pub fn validate_store(value: &Value) -> Result<Store, String> {
    let version = store_version(value)?;
    let mut store: Store =
        serde_json::from_value(value.clone()).map_err(|err| format!("unreadable store: {err}"))?;
    for (key, item) in &store.items {
        item.validate()?;
        if key != &item.id {
            return Err(format!("item stored under {key} claims id {}", item.id));
        }
    }
    if version < STORE_VERSION {
        store = migrate(store, version);
    }
    store.check_invariants()?;
    Ok(store)
}

/// Lenient load: keeps every usable item and drops (and logs) the rest, pulls
/// split groups back to their earliest wake time and rebuilds the index.
pub fn parse_lenient(value: &Value) -> Result<ParsedStore, String> {
    store_version(value)?;
    let raw_items = value
        .get("items")
        .and_then(Value::as_object)
        .ok_or_else(|| "store has no item map".to_string())?;

    let mut store = Store::default();
    let mut dropped = 0;
    for (key, raw) in raw_items {
        let item = match serde_json::from_value::<SnoozedItem>(raw.clone()) {
            Ok(item) => item,
            Err(err) => {
                log::warn!("dropping malformed item key={key} err={err}");
                dropped += 1;
                continue;
            }
        };
        if let Err(reason) = item.validate() {
            log::warn!("dropping invalid item key={key} reason={reason}");
            dropped += 1;
            continue;
        }
        if key != &item.id {
            log::warn!("dropping item key={key} with mismatched id={}", item.id);
            dropped += 1;
            continue;
        }
        store.items.insert(item.id.clone(), item);
    }

    let mut group_times: BTreeMap<String, Timestamp> = BTreeMap::new();
    for item in store.items.values() {
        if let Some(group) = &item.group_id {
            let earliest = group_times.entry(group.clone()).or_insert(item.pop_time);
            *earliest = (*earliest).min(item.pop_time);
        }
    }
    let mut realigned = 0;
    for item in store.items.values_mut() {
        if let Some(target) = item.group_id.as_ref().and_then(|group| group_times.get(group)) {
            if item.pop_time != *target {
                log::warn!(
                    "realigning item id={} from {} to group wake time {}",
                    item.id,
                    item.pop_time,
                    target
                );
                item.pop_time = *target;
                realigned += 1;
            }
        }
    }

    store.rebuild_schedule();
    Ok(ParsedStore {
        store,
        declared: raw_items.len(),
        dropped,
        realigned,
    })
}

/// Whether the persisted primary store predates the current format and should
/// be rewritten once loaded.
pub fn primary_is_outdated(storage: &Storage) -> bool {
    storage
        .load_store_raw()
        .and_then(|raw| store_version(&raw).ok())
        .is_some_and(|version| version < STORE_VERSION)
}

/// Startup recovery: validate the primary store and fall back through the
/// retained snapshots, newest first.
pub fn recover(storage: &Storage) -> (Store, RecoveryResult) {
    let mut salvage = None;
    match storage.load_store_raw() {
        Some(raw) => {
            match validate_store(&raw) {
                Ok(store) => {
                    let count = store.items.len();
                    log::info!("primary store loaded items={count}");
                    return (store, RecoveryResult::clean(count));
                }
                Err(reason) => log::warn!("primary store failed validation: {reason}"),
            }
            if let Ok(parsed) = parse_lenient(&raw) {
                if parsed.dropped == 0 && parsed.realigned == 0 {
                    let count = parsed.store.items.len();
                    log::warn!("primary store index rebuilt from items={count}");
                    return (
                        parsed.store,
                        RecoveryResult {
                            recovered: true,
                            tab_count: count,
                            sanitized: true,
                            outcome: RecoveryOutcome::Repaired,
                            dropped: 0,
                        },
                    );
                }
                if !parsed.store.items.is_empty() {
                    salvage = Some(parsed);
                }
            }
        }
        None => {
            if storage.load_snapshots_raw().is_empty() {
                log::info!("no primary store and no snapshots, starting empty");
                return (Store::default(), RecoveryResult::clean(0));
            }
            log::warn!("primary store missing while snapshots exist");
        }
    }

    for (slot, raw) in storage.load_snapshots_raw() {
        match load_snapshot(&raw) {
            Ok((store, result)) => {
                log::warn!(
                    "recovered from snapshot slot={slot} items={} sanitized={} dropped={}",
                    result.tab_count,
                    result.sanitized,
                    result.dropped
                );
                return (store, result);
            }
            Err(reason) => log::warn!("snapshot slot={slot} unusable: {reason}"),
        }
    }

    // Last resort: whatever the damaged primary still holds.
    if let Some(parsed) = salvage {
        let count = parsed.store.items.len();
        log::warn!("salvaged primary store items={count} dropped={}", parsed.dropped);
        return (
            parsed.store,
            RecoveryResult {
                recovered: true,
                tab_count: count,
                sanitized: true,
                outcome: RecoveryOutcome::Repaired,
                dropped: parsed.dropped,
            },
        );
    }

    log::error!("no usable store or snapshot, initializing an empty store");
    (
        Store::default(),
        RecoveryResult {
            recovered: false,
            tab_count: 0,
            sanitized: false,
            outcome: RecoveryOutcome::FullLoss,
            dropped: 0,
        },
    )
}

/// Loads one snapshot slot for a manual restore.
pub fn restore_snapshot(storage: &Storage, slot: &str) -> Result<(Store, RecoveryResult), EngineError> {
    let raw = storage
        .snapshot_raw(slot)
        .ok_or_else(|| EngineError::Import(format!("no snapshot in slot {slot}")))?;
    load_snapshot(&raw).map_err(EngineError::Import)
}

pub fn list_snapshots(storage: &Storage) -> Vec<SnapshotEntry> {
    storage
        .load_snapshots_raw()
        .into_iter()
        .map(|(slot, raw)| {
            let taken_at = raw.get("taken_at").and_then(Value::as_i64);
            match raw.get("store").map(validate_store) {
                Some(Ok(store)) => SnapshotEntry {
                    slot,
                    taken_at,
                    tab_count: store.items.len(),
                    valid: true,
                },
                _ => SnapshotEntry {
                    slot,
                    taken_at,
                    tab_count: raw
                        .get("store")
                        .and_then(|store| store.get("items"))
                        .and_then(Value::as_object)
                        .map(|items| items.len())
                        .unwrap_or(0),
                    valid: false,
                },
            }
        })
        .collect()
}

/// Parses user-supplied data for an import. Malformed items are dropped; data
/// with nothing usable is rejected.
pub fn import_store(value: &Value) -> Result<(Store, RecoveryResult), EngineError> {
    if let Ok(store) = validate_store(value) {
        let count = store.items.len();
        return Ok((
            store,
            RecoveryResult {
                recovered: false,
                tab_count: count,
                sanitized: false,
                outcome: RecoveryOutcome::Imported,
                dropped: 0,
            },
        ));
    }
    let parsed = parse_lenient(value).map_err(EngineError::Import)?;
    if parsed.store.items.is_empty() && parsed.declared > 0 {
        return Err(EngineError::Import(
            "none of the imported tabs could be read".to_string(),
        ));
    }
    let count = parsed.store.items.len();
    Ok((
        parsed.store,
        RecoveryResult {
            recovered: false,
            tab_count: count,
            sanitized: parsed.dropped > 0 || parsed.realigned > 0,
            outcome: RecoveryOutcome::Imported,
            dropped: parsed.dropped,
        },
    ))
}

/// Writes a snapshot after a committed change once the configured interval
/// has passed. Failures are logged and otherwise ignored.
pub(crate) fn maybe_snapshot(storage: &Storage, data: &mut EngineData, now: Timestamp) {
    let interval = i64::from(data.settings.snapshot_interval_minutes) * MINUTE_MS;
    let due = data
        .last_snapshot_at
        .map_or(true, |last| now - last >= interval || now < last);
    if !due {
        return;
    }
    let snapshot = Snapshot {
        taken_at: now,
        store: data.store.clone(),
    };
    match storage.write_snapshot(&snapshot) {
        Ok(_) => data.last_snapshot_at = Some(now),
        Err(err) => log::warn!("snapshot write failed err={err}"),
    }
}

fn load_snapshot(raw: &Value) -> Result<(Store, RecoveryResult), String> {
    let inner = raw
        .get("store")
        .ok_or_else(|| "snapshot has no store".to_string())?;
    if let Ok(store) = validate_store(inner) {
        let count = store.items.len();
        return Ok((
            store,
            RecoveryResult {
                recovered: true,
                tab_count: count,
                sanitized: false,
                outcome: RecoveryOutcome::Snapshot,
                dropped: 0,
            },
        ));
    }
    let parsed = parse_lenient(inner)?;
    if parsed.store.items.is_empty() && parsed.declared > 0 {
        return Err("no readable items".to_string());
    }
    let count = parsed.store.items.len();
    Ok((
        parsed.store,
        RecoveryResult {
            recovered: true,
            tab_count: count,
            sanitized: true,
            outcome: RecoveryOutcome::Snapshot,
            dropped: parsed.dropped,
        },
    ))
}

fn store_version(value: &Value) -> Result<u32, String> {
    if !value.is_object() {
        return Err("store is not an object".to_string());
    }
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| "store has no version".to_string())?;
    if version == 0 || version > u64::from(STORE_VERSION) {
        return Err(format!("unsupported store version {version}"));
    }
    Ok(version as u32)
}

/// Version 1 stores carried only the item map; the wake index is derived.
fn migrate(mut store: Store, from: u32) -> Store {
    log::info!("migrating store from version {from} to {STORE_VERSION}");
    store.rebuild_schedule();
    store.version = STORE_VERSION;
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Settings;
    use crate::state::AppState;
    use crate::storage::{FileBackend, MemoryBackend, STORE_KEY};
    use serde_json::json;

    fn make_item(id: &str, pop_time: Timestamp) -> SnoozedItem {
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

    fn make_store(items: &[(&str, Timestamp)]) -> Store {
        let mut store = Store::default();
        for (id, pop_time) in items {
            store.insert(make_item(id, *pop_time)).unwrap();
        }
        store
    }

    fn snapshot_value(taken_at: Timestamp, store: Value) -> Value {
        json!({ "taken_at": taken_at, "store": store })
    }

    #[test]
    fn valid_primary_loads_clean() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend);
        let store = make_store(&[("a", 100), ("b", 200)]);
        storage.save_store(&store).unwrap();

        let (loaded, result) = recover(&storage);
        assert_eq!(loaded, store);
        assert_eq!(result, RecoveryResult::clean(2));
        assert!(!result.should_notify());
    }

    #[test]
    fn newer_sanitized_snapshot_wins_over_older_valid_one() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        backend.put_raw(STORE_KEY, json!("garbage"));

        let older = make_store(&[("a", 100)]);
        backend.put_raw(
            "snapshot_0",
            snapshot_value(1_000, serde_json::to_value(&older).unwrap()),
        );

        let mut newer = serde_json::to_value(make_store(&[("a", 100), ("b", 200), ("c", 300)]))
            .unwrap();
        newer["items"]["c"]["url"] = json!("");
        backend.put_raw("snapshot_1", snapshot_value(2_000, newer));

        let (store, result) = recover(&storage);
        assert!(result.recovered);
        assert!(result.sanitized);
        assert_eq!(result.outcome, RecoveryOutcome::Snapshot);
        assert_eq!(result.tab_count, 2);
        assert_eq!(result.dropped, 1);
        assert!(store.items.contains_key("b"));
        assert!(!store.items.contains_key("c"));
        store.check_invariants().unwrap();
        assert!(result.should_notify());
    }

    #[test]
    fn unreadable_newest_snapshot_falls_back_to_the_next_one() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        backend.put_raw(STORE_KEY, json!({ "version": 2, "items": [] }));
        backend.put_raw("snapshot_0", snapshot_value(2_000, json!({ "items": {} })));
        backend.put_raw(
            "snapshot_1",
            snapshot_value(2_500, json!({ "version": 2, "items": { "x": { "id": 5 } } })),
        );
        backend.put_raw(
            "snapshot_2",
            snapshot_value(1_000, serde_json::to_value(make_store(&[("a", 1)])).unwrap()),
        );

        let (store, result) = recover(&storage);
        assert_eq!(result.outcome, RecoveryOutcome::Snapshot);
        assert!(!result.sanitized);
        assert_eq!(result.tab_count, 1);
        assert!(store.items.contains_key("a"));
    }

    #[test]
    fn index_divergence_in_primary_is_repaired_on_load() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        let mut value = serde_json::to_value(make_store(&[("a", 100), ("b", 200)])).unwrap();
        value["schedule"] = json!({ "100": ["a", "ghost"] });
        backend.put_raw(STORE_KEY, value);

        let (store, result) = recover(&storage);
        assert_eq!(result.outcome, RecoveryOutcome::Repaired);
        assert!(result.recovered);
        assert!(result.sanitized);
        assert_eq!(result.tab_count, 2);
        assert_eq!(store, make_store(&[("a", 100), ("b", 200)]));
    }

    #[test]
    fn damaged_primary_is_salvaged_when_no_snapshot_helps() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        let mut value = serde_json::to_value(make_store(&[("a", 100), ("b", 200)])).unwrap();
        value["items"]["b"]["url"] = json!(null);
        backend.put_raw(STORE_KEY, value);

        let (store, result) = recover(&storage);
        assert_eq!(result.outcome, RecoveryOutcome::Repaired);
        assert_eq!(result.tab_count, 1);
        assert_eq!(result.dropped, 1);
        assert!(store.items.contains_key("a"));
        store.check_invariants().unwrap();
    }

    #[test]
    fn nothing_usable_is_a_full_loss() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        backend.put_raw(STORE_KEY, json!(42));
        backend.put_raw("snapshot_0", json!("nope"));

        let (store, result) = recover(&storage);
        assert!(store.items.is_empty());
        assert_eq!(result.outcome, RecoveryOutcome::FullLoss);
        assert!(!result.recovered);
        assert!(result.should_notify());
    }

    #[test]
    fn binary_primary_on_disk_is_a_loss_and_not_a_first_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("store.json"), [b'{', 0xc3]).unwrap();
        let storage = Storage::new(FileBackend::new(dir.path().to_path_buf()));

        let (store, result) = recover(&storage);
        assert!(store.items.is_empty());
        assert_eq!(result.outcome, RecoveryOutcome::FullLoss);
        assert!(result.should_notify());
    }

    #[test]
    fn binary_snapshot_slot_on_disk_leaves_the_others_usable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(FileBackend::new(dir.path().to_path_buf()));
        storage
            .write_snapshot(&Snapshot {
                taken_at: 5,
                store: make_store(&[("a", 1)]),
            })
            .unwrap();
        std::fs::write(dir.path().join("snapshot_1.json"), [0xff, 0xfe, b'{']).unwrap();
        std::fs::write(dir.path().join("store.json"), b"{broken").unwrap();

        let (store, result) = recover(&storage);
        assert_eq!(store.items.len(), 1);
        assert_eq!(result.outcome, RecoveryOutcome::Snapshot);
        assert!(result.should_notify());
    }

    #[test]
    fn missing_primary_starts_empty_unless_snapshots_remain() {
        let storage = Storage::new(MemoryBackend::new());
        let (store, result) = recover(&storage);
        assert_eq!(store, Store::default());
        assert_eq!(result.outcome, RecoveryOutcome::Clean);

        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        backend.put_raw(
            "snapshot_0",
            snapshot_value(5, serde_json::to_value(make_store(&[("a", 1)])).unwrap()),
        );
        let (store, result) = recover(&storage);
        assert_eq!(store.items.len(), 1);
        assert!(result.recovered);
    }

    #[test]
    fn version_one_stores_are_migrated() {
        let value = json!({
            "version": 1,
            "items": { "a": serde_json::to_value(make_item("a", 100)).unwrap() }
        });
        let store = validate_store(&value).unwrap();
        assert_eq!(store.version, STORE_VERSION);
        assert_eq!(store.schedule[&100], vec!["a".to_string()]);

        let future = json!({ "version": STORE_VERSION + 1, "items": {} });
        assert!(validate_store(&future).is_err());
        assert!(parse_lenient(&future).is_err());
    }

    #[test]
    fn lenient_parse_realigns_split_groups() {
        let mut first = make_item("a", 500);
        first.group_id = Some("g".to_string());
        let mut second = make_item("b", 300);
        second.group_id = Some("g".to_string());
        let value = json!({
            "version": 2,
            "items": {
                "a": serde_json::to_value(first).unwrap(),
                "b": serde_json::to_value(second).unwrap(),
                "broken": { "id": "broken" }
            }
        });
        assert!(validate_store(&value).is_err());

        let parsed = parse_lenient(&value).unwrap();
        assert_eq!(parsed.declared, 3);
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.realigned, 1);
        assert_eq!(parsed.store.items["a"].pop_time, 300);
        parsed.store.check_invariants().unwrap();
    }

    #[test]
    fn import_accepts_valid_and_partially_valid_data_and_rejects_junk() {
        let store = make_store(&[("a", 100)]);
        let (imported, result) = import_store(&serde_json::to_value(&store).unwrap()).unwrap();
        assert_eq!(imported, store);
        assert_eq!(result.outcome, RecoveryOutcome::Imported);
        assert!(!result.sanitized);

        let mut partial = serde_json::to_value(make_store(&[("a", 100), ("b", 200)])).unwrap();
        partial["items"]["b"]["pop_time"] = json!(-1);
        let (imported, result) = import_store(&partial).unwrap();
        assert_eq!(imported.items.len(), 1);
        assert!(result.sanitized);
        assert_eq!(result.dropped, 1);

        assert!(matches!(
            import_store(&json!([1, 2, 3])),
            Err(EngineError::Import(_))
        ));
        assert!(import_store(&json!({ "version": 2, "items": { "x": 1 } })).is_err());
    }

    #[test]
    fn snapshots_follow_the_configured_interval() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        let state = AppState::new(make_store(&[("a", 100)]), Settings::default());
        let mut data = state.lock();

        maybe_snapshot(&storage, &mut data, 1_000);
        assert_eq!(data.last_snapshot_at, Some(1_000));
        maybe_snapshot(&storage, &mut data, 1_000 + 59 * MINUTE_MS);
        assert_eq!(storage.load_snapshots_raw().len(), 1);
        maybe_snapshot(&storage, &mut data, 1_000 + 60 * MINUTE_MS);
        assert_eq!(storage.load_snapshots_raw().len(), 2);

        // A failed snapshot write is not fatal and is retried next time.
        backend.fail_next_writes(1);
        maybe_snapshot(&storage, &mut data, 1_000 + 200 * MINUTE_MS);
        assert_eq!(data.last_snapshot_at, Some(1_000 + 60 * MINUTE_MS));
    }

    #[test]
    fn list_and_restore_snapshots() {
        let backend = MemoryBackend::new();
        let storage = Storage::new(backend.clone());
        storage
            .write_snapshot(&Snapshot {
                taken_at: 10,
                store: make_store(&[("a", 1), ("b", 2)]),
            })
            .unwrap();
        backend.put_raw("snapshot_4", snapshot_value(5, json!({ "bad": true })));

        let entries = list_snapshots(&storage);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].taken_at, Some(10));
        assert_eq!(entries[0].tab_count, 2);
        assert!(entries[0].valid);
        assert!(!entries[1].valid);

        let (store, result) = restore_snapshot(&storage, &entries[0].slot).unwrap();
        assert_eq!(store.items.len(), 2);
        assert!(result.recovered);
        assert!(restore_snapshot(&storage, "snapshot_3").is_err());
        assert!(restore_snapshot(&storage, "snapshot_4").is_err());
    }
}
