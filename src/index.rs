use std::collections::{BTreeMap, HashSet};

use crate::error::EngineError;
use crate::models::{DeleteTarget, SnoozedItem, Store, Timestamp};

impl Store {
    pub fn insert(&mut self, item: SnoozedItem) -> Result<(), EngineError> {
        item.validate().map_err(EngineError::InvalidSchedule)?;
        if self.items.contains_key(&item.id) {
            return Err(EngineError::InvalidSchedule(format!(
                "item {} is already snoozed",
                item.id
            )));
        }
        if let Some(group) = &item.group_id {
            let mismatch = self
                .group_members(group)
                .iter()
                .any(|member| member.pop_time != item.pop_time);
            if mismatch {
                return Err(EngineError::InvalidSchedule(format!(
                    "group {group} wakes at a different time"
                )));
            }
        }
        let bucket = item.pop_time;
        self.items.insert(item.id.clone(), item);
        self.schedule.entry(bucket).or_default();
        self.reorder_bucket(bucket);
        Ok(())
    }

    /// Inserts a whole window group; either every member lands or none does.
    pub fn insert_group(&mut self, items: Vec<SnoozedItem>) -> Result<(), EngineError> {
        let Some(first) = items.first() else {
            return Ok(());
        };
        let group = first.group_id.clone();
        let pop_time = first.pop_time;
        if group.is_none()
            || items
                .iter()
                .any(|item| item.group_id != group || item.pop_time != pop_time)
        {
            return Err(EngineError::InvalidSchedule(
                "group members must share a group id and wake time".to_string(),
            ));
        }
        let mut staged = self.clone();
        for item in items {
            staged.insert(item)?;
        }
        *self = staged;
        Ok(())
    }

    /// Removes the item or every member of the group. Missing targets remove nothing.
    pub fn remove(&mut self, target: &DeleteTarget) -> Vec<SnoozedItem> {
        let ids = self.target_ids(target);
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.items.remove(&id) {
                self.unschedule(&id, item.pop_time);
                removed.push(item);
            }
        }
        removed
    }

    /// Moves an item or a whole group to a new wake time.
    pub fn reschedule(
        &mut self,
        target: &DeleteTarget,
        pop_time: Timestamp,
    ) -> Result<Vec<String>, EngineError> {
        if pop_time < 0 {
            return Err(EngineError::InvalidSchedule(
                "wake time must not be negative".to_string(),
            ));
        }
        let ids = self.target_ids(target);
        if ids.is_empty() {
            return Err(EngineError::InvalidSchedule(format!(
                "nothing snoozed under {}",
                target.key()
            )));
        }
        // A lone member cannot leave its group's wake time.
        if let DeleteTarget::Item(id) = target {
            let grouped = self
                .items
                .get(id)
                .and_then(|item| item.group_id.as_ref())
                .map(|group| self.group_members(group).len() > 1)
                .unwrap_or(false);
            if grouped {
                return Err(EngineError::InvalidSchedule(format!(
                    "item {id} belongs to a group; reschedule the group"
                )));
            }
        }
        for item in self.remove(target) {
            self.insert(SnoozedItem { pop_time, ..item })?;
        }
        Ok(ids)
    }

    /// All buckets at or before `as_of`, earliest first.
    pub fn due_buckets(&self, as_of: Timestamp) -> Vec<(Timestamp, Vec<String>)> {
        self.schedule
            .range(..=as_of)
            .map(|(bucket, ids)| (*bucket, ids.clone()))
            .collect()
    }

    pub fn next_bucket_time(&self) -> Option<Timestamp> {
        self.schedule.keys().next().copied()
    }

    /// An item id takes precedence over a group id with the same value.
    pub fn resolve_target(&self, key: &str) -> Option<DeleteTarget> {
        if self.items.contains_key(key) {
            return Some(DeleteTarget::Item(key.to_string()));
        }
        if self
            .items
            .values()
            .any(|item| item.group_id.as_deref() == Some(key))
        {
            return Some(DeleteTarget::Group(key.to_string()));
        }
        None
    }

    pub fn target_ids(&self, target: &DeleteTarget) -> Vec<String> {
        match target {
            DeleteTarget::Item(id) => {
                if self.items.contains_key(id) {
                    vec![id.clone()]
                } else {
                    Vec::new()
                }
            }
            DeleteTarget::Group(group) => self
                .group_members(group)
                .iter()
                .map(|item| item.id.clone())
                .collect(),
        }
    }

    pub fn group_members(&self, group: &str) -> Vec<&SnoozedItem> {
        self.items
            .values()
            .filter(|item| item.group_id.as_deref() == Some(group))
            .collect()
    }

    /// Verifies the index is a complete, duplicate-free view of `items` and that
    /// groups wake together.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (bucket, ids) in &self.schedule {
            if ids.is_empty() {
                return Err(format!("bucket {bucket} is empty"));
            }
            for id in ids {
                let Some(item) = self.items.get(id) else {
                    return Err(format!("bucket {bucket} references missing item {id}"));
                };
                if item.pop_time != *bucket {
                    return Err(format!(
                        "item {id} is indexed at {bucket} but wakes at {}",
                        item.pop_time
                    ));
                }
                if !seen.insert(id.as_str()) {
                    return Err(format!("item {id} is indexed twice"));
                }
            }
        }
        for (key, item) in &self.items {
            if key != &item.id {
                return Err(format!("item stored under {key} claims id {}", item.id));
            }
            if !seen.contains(key.as_str()) {
                return Err(format!("item {key} is missing from the schedule"));
            }
        }
        let mut group_times: BTreeMap<&str, Timestamp> = BTreeMap::new();
        for item in self.items.values() {
            if let Some(group) = item.group_id.as_deref() {
                let expected = *group_times.entry(group).or_insert(item.pop_time);
                if expected != item.pop_time {
                    return Err(format!("group {group} is split across wake times"));
                }
            }
        }
        Ok(())
    }

    /// Recomputes `schedule` from `items`.
    pub fn rebuild_schedule(&mut self) {
        let mut buckets: BTreeMap<Timestamp, Vec<&SnoozedItem>> = BTreeMap::new();
        for item in self.items.values() {
            buckets.entry(item.pop_time).or_default().push(item);
        }
        self.schedule = buckets
            .into_iter()
            .map(|(bucket, items)| (bucket, restore_order(&items)))
            .collect();
    }

    fn unschedule(&mut self, id: &str, bucket: Timestamp) {
        if let Some(ids) = self.schedule.get_mut(&bucket) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.schedule.remove(&bucket);
            }
        }
    }

    fn reorder_bucket(&mut self, bucket: Timestamp) {
        let items: Vec<&SnoozedItem> = self
            .items
            .values()
            .filter(|item| item.pop_time == bucket)
            .collect();
        let ordered = restore_order(&items);
        if ordered.is_empty() {
            self.schedule.remove(&bucket);
        } else {
            self.schedule.insert(bucket, ordered);
        }
    }
}

/// Canonical order inside a bucket: ascending tab index when known, then id;
/// members of one group stay contiguous in the position of their first member.
pub fn restore_order(items: &[&SnoozedItem]) -> Vec<String> {
    let mut sorted: Vec<&SnoozedItem> = items.to_vec();
    sorted.sort_by(|a, b| {
        (a.index.is_none(), a.index, &a.id).cmp(&(b.index.is_none(), b.index, &b.id))
    });

    let mut ordered = Vec::with_capacity(sorted.len());
    let mut placed_groups: HashSet<&str> = HashSet::new();
    for item in &sorted {
        match item.group_id.as_deref() {
            None => ordered.push(item.id.clone()),
            Some(group) => {
                if placed_groups.insert(group) {
                    ordered.extend(
                        sorted
                            .iter()
                            .filter(|other| other.group_id.as_deref() == Some(group))
                            .map(|other| other.id.clone()),
                    );
                }
            }
        }
    }
    ordered
}
