//! Persistent storage for pending and retired webhooks.
//!
//! Records are stored as JSON values in redb with explicitly named, typed
//! tables. Secondary index tables map `(timestamp micros, id)` keys to the
//! record tables so scheduling and retention scans stay cheap. Every
//! multi-step operation (insert-with-supersession, finalization, cancel) runs
//! in a single write transaction: observers never see two pending hooks for
//! the same originating message, and a result recorded during delivery cannot
//! be lost to a concurrent supersession.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::admin::{CompiledFilter, HookFilter, HookRetiredFilter, HookRetiredSort, HookSort};
use crate::error::{Error, StoreError};
use crate::types::{Hook, HookResult, HookRetired, MsgRetired};

/// Pending hooks: id -> JSON Hook.
const HOOKS: TableDefinition<u64, &[u8]> = TableDefinition::new("hooks");

/// Scheduling index: (next_attempt micros, id).
const HOOKS_BY_NEXT_ATTEMPT: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("hooks_by_next_attempt");

/// Listing index: (submitted micros, id).
const HOOKS_BY_SUBMITTED: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("hooks_by_submitted");

/// At most one pending hook per originating queue message: queue msg id -> hook id.
const HOOKS_BY_QUEUE_MSG: TableDefinition<u64, u64> = TableDefinition::new("hooks_by_queue_msg");

/// Retired hooks: id -> JSON HookRetired. Ids match the original pending hook.
const RETIRED: TableDefinition<u64, &[u8]> = TableDefinition::new("hooks_retired");

/// Retention index: (keep_until micros, id).
const RETIRED_BY_KEEP_UNTIL: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("hooks_retired_by_keep_until");

/// Listing index: (last_activity micros, id).
const RETIRED_BY_LAST_ACTIVITY: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("hooks_retired_by_last_activity");

/// Per-account listing index: (account, last_activity micros, id).
const RETIRED_BY_ACCOUNT: TableDefinition<(&str, i64, u64), ()> =
    TableDefinition::new("hooks_retired_by_account");

/// Retired outgoing messages: id -> JSON MsgRetired.
const MSGS_RETIRED: TableDefinition<u64, &[u8]> = TableDefinition::new("msgs_retired");

/// DSN correlation index: from-id -> retired message id.
const MSGS_RETIRED_BY_FROM_ID: TableDefinition<&str, u64> =
    TableDefinition::new("msgs_retired_by_from_id");

/// Id allocation; ids are never reused, even after deletes.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Typed persistent storage for webhooks and retired outgoing messages.
pub struct HookStore {
    db: Database,
}

impl HookStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<HookStore, StoreError> {
        let db = Database::create(path)?;
        let tx = db.begin_write()?;
        {
            tx.open_table(HOOKS)?;
            tx.open_table(HOOKS_BY_NEXT_ATTEMPT)?;
            tx.open_table(HOOKS_BY_SUBMITTED)?;
            tx.open_table(HOOKS_BY_QUEUE_MSG)?;
            tx.open_table(RETIRED)?;
            tx.open_table(RETIRED_BY_KEEP_UNTIL)?;
            tx.open_table(RETIRED_BY_LAST_ACTIVITY)?;
            tx.open_table(RETIRED_BY_ACCOUNT)?;
            tx.open_table(MSGS_RETIRED)?;
            tx.open_table(MSGS_RETIRED_BY_FROM_ID)?;
            tx.open_table(SEQUENCES)?;
        }
        tx.commit()?;
        Ok(HookStore { db })
    }

    /// Insert a new hook, assigning its id. Any other pending hook for the
    /// same originating queue message is retired as superseded (kept only
    /// when `keep` is non-zero) and deleted, all in one transaction.
    pub fn add_hook(
        &self,
        h: &mut Hook,
        now: DateTime<Utc>,
        keep: Duration,
    ) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            h.id = next_id(&tx, "hook")?;
            put_hook(&tx, h)?;
            if h.queue_msg_id != 0 {
                let old_id = {
                    let mut t = tx.open_table(HOOKS_BY_QUEUE_MSG)?;
                    let old = t.get(h.queue_msg_id)?.map(|v| v.value());
                    t.insert(h.queue_msg_id, h.id)?;
                    old.filter(|id| *id != h.id)
                };
                if let Some(old_id) = old_id {
                    let old_buf =
                        tx.open_table(HOOKS)?.get(old_id)?.map(|v| v.value().to_vec());
                    if let Some(buf) = old_buf {
                        let oh: Hook = serde_json::from_slice(&buf)?;
                        if !keep.is_zero() {
                            let mut hr = oh.retired(false, now, now + chrono_dur(keep));
                            hr.superseded_by_id = h.id;
                            put_retired(&tx, &hr)?;
                        }
                        delete_hook(&tx, &oh)?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn hook(&self, id: u64) -> Result<Option<Hook>, StoreError> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(HOOKS)?;
        match t.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn retired(&self, id: u64) -> Result<Option<HookRetired>, StoreError> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(RETIRED)?;
        match t.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Rewrite a pending hook, maintaining indexes. Fails with
    /// [`StoreError::Absent`] when the hook is no longer pending.
    pub(crate) fn update_hook(&self, h: &Hook) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        let res = (|| {
            let stored = tx.open_table(HOOKS)?.get(h.id)?.map(|v| v.value().to_vec());
            let Some(buf) = stored else {
                return Err(StoreError::Absent);
            };
            let oh: Hook = serde_json::from_slice(&buf)?;
            unindex_hook_times(&tx, &oh)?;
            put_hook(&tx, h)
        })();
        match res {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Record an attempt on a still-pending hook. When the hook was retired
    /// mid-delivery (superseded), the final result is appended to the retired
    /// record instead, its error suffixed "(superseded)". Returns whether the
    /// pending hook was updated.
    pub(crate) fn update_after_attempt(&self, h: &Hook) -> Result<bool, StoreError> {
        let tx = self.db.begin_write()?;
        let updated = {
            let stored = tx.open_table(HOOKS)?.get(h.id)?.map(|v| v.value().to_vec());
            match stored {
                Some(buf) => {
                    let oh: Hook = serde_json::from_slice(&buf)?;
                    unindex_hook_times(&tx, &oh)?;
                    put_hook(&tx, h)?;
                    true
                }
                None => {
                    append_result_superseded(&tx, h)?;
                    false
                }
            }
        };
        tx.commit()?;
        Ok(updated)
    }

    /// Move a hook to the retired table on a terminal outcome, in one
    /// transaction. Falls back to the superseded path like
    /// [`HookStore::update_after_attempt`] when the pending hook is gone.
    /// Returns whether the pending hook existed.
    pub(crate) fn retire_hook(
        &self,
        h: &Hook,
        success: bool,
        last_activity: DateTime<Utc>,
        keep: Duration,
    ) -> Result<bool, StoreError> {
        let tx = self.db.begin_write()?;
        let existed = {
            let stored = tx.open_table(HOOKS)?.get(h.id)?.map(|v| v.value().to_vec());
            match stored {
                Some(buf) => {
                    let oh: Hook = serde_json::from_slice(&buf)?;
                    delete_hook(&tx, &oh)?;
                    if !keep.is_zero() {
                        let hr = h.retired(success, last_activity, last_activity + chrono_dur(keep));
                        put_retired(&tx, &hr)?;
                    }
                    true
                }
                None => {
                    append_result_superseded(&tx, h)?;
                    false
                }
            }
        };
        tx.commit()?;
        Ok(existed)
    }

    /// Pending hooks due at `now`, excluding busy URLs, in
    /// `(next_attempt, id)` order, at most `limit`.
    pub(crate) fn due_hooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        exclude_urls: &HashSet<String>,
    ) -> Result<Vec<Hook>, StoreError> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(HOOKS_BY_NEXT_ATTEMPT)?;
        let records = tx.open_table(HOOKS)?;
        let mut out = Vec::new();
        for item in idx.range((i64::MIN, u64::MIN)..=(ts(now), u64::MAX))? {
            let (k, _) = item?;
            let (_, id) = k.value();
            let Some(buf) = records.get(id)? else {
                continue;
            };
            let h: Hook = serde_json::from_slice(buf.value())?;
            if exclude_urls.contains(&h.url) {
                continue;
            }
            out.push(h);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Next attempt time of the earliest pending hook whose URL is not busy.
    pub(crate) fn next_work(
        &self,
        exclude_urls: &HashSet<String>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(HOOKS_BY_NEXT_ATTEMPT)?;
        let records = tx.open_table(HOOKS)?;
        for item in idx.iter()? {
            let (k, _) = item?;
            let (_, id) = k.value();
            let Some(buf) = records.get(id)? else {
                continue;
            };
            let h: Hook = serde_json::from_slice(buf.value())?;
            if !exclude_urls.contains(&h.url) {
                return Ok(Some(h.next_attempt));
            }
        }
        Ok(None)
    }

    /// Number of pending hooks.
    pub fn hook_queue_size(&self) -> Result<u64, StoreError> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(HOOKS)?;
        let mut n = 0;
        for item in t.iter()? {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Pending hooks matching the filter, in the given order.
    pub fn list_hooks(&self, filter: &HookFilter, sort: &HookSort) -> Result<Vec<Hook>, Error> {
        let f = filter.compile()?;
        let mut hooks: Vec<Hook> = self
            .all_hooks()?
            .into_iter()
            .filter(|h| f.matches_hook(h))
            .collect();
        sort.apply(&mut hooks)?;
        if f.max() > 0 {
            hooks.truncate(f.max());
        }
        Ok(hooks)
    }

    /// Retired hooks matching the filter, in the given order.
    pub fn list_retired(
        &self,
        filter: &HookRetiredFilter,
        sort: &HookRetiredSort,
    ) -> Result<Vec<HookRetired>, Error> {
        let f = filter.compile()?;
        let mut hooks: Vec<HookRetired> = self
            .all_retired()?
            .into_iter()
            .filter(|h| f.matches_retired(h))
            .collect();
        sort.apply(&mut hooks)?;
        if f.max() > 0 {
            hooks.truncate(f.max());
        }
        Ok(hooks)
    }

    /// Add a duration to the next attempt of matching hooks. Returns the
    /// number of updated hooks.
    pub fn next_attempt_add(
        &self,
        filter: &HookFilter,
        d: chrono::Duration,
    ) -> Result<usize, Error> {
        let f = filter.compile()?;
        Ok(self.shift_next_attempt(&f, |t| t + d)?)
    }

    /// Set the next attempt of matching hooks to an absolute time. Returns
    /// the number of updated hooks.
    pub fn next_attempt_set(&self, filter: &HookFilter, t: DateTime<Utc>) -> Result<usize, Error> {
        let f = filter.compile()?;
        Ok(self.shift_next_attempt(&f, |_| t)?)
    }

    fn shift_next_attempt(
        &self,
        f: &CompiledFilter,
        new_time: impl Fn(DateTime<Utc>) -> DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let tx = self.db.begin_write()?;
        let n;
        {
            let mut matching = collect_matching_hooks(&tx, f)?;
            n = matching.len();
            for h in &mut matching {
                unindex_hook_times(&tx, h)?;
                h.next_attempt = new_time(h.next_attempt);
                put_hook(&tx, h)?;
            }
        }
        tx.commit()?;
        Ok(n)
    }

    /// Delete matching hooks and return them, inserting a retired record with
    /// a final "canceled by admin" result for accounts with retention, all in
    /// one transaction.
    pub fn cancel_hooks(
        &self,
        filter: &HookFilter,
        now: DateTime<Utc>,
        keep_for: &dyn Fn(&str) -> Duration,
    ) -> Result<Vec<Hook>, Error> {
        let f = filter.compile()?;
        let tx = self.db.begin_write().map_err(StoreError::from)?;
        let hooks;
        {
            hooks = collect_matching_hooks(&tx, &f)?;
            for h in &hooks {
                delete_hook(&tx, h)?;
                let keep = keep_for(&h.account);
                if !keep.is_zero() {
                    let mut hr = h.retired(false, now, now + chrono_dur(keep));
                    hr.results.push(HookResult {
                        start: now,
                        duration: Duration::ZERO,
                        url: String::new(),
                        success: false,
                        code: 0,
                        error: "canceled by admin".into(),
                        response: String::new(),
                    });
                    put_retired(&tx, &hr)?;
                }
            }
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(hooks)
    }

    /// Delete retired hooks whose retention has lapsed. Returns the number of
    /// deleted records.
    pub fn cleanup_retired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let tx = self.db.begin_write()?;
        let n;
        {
            let expired: Vec<HookRetired> = {
                let idx = tx.open_table(RETIRED_BY_KEEP_UNTIL)?;
                let records = tx.open_table(RETIRED)?;
                let mut v = Vec::new();
                for item in idx.range((i64::MIN, u64::MIN)..(ts(now), u64::MIN))? {
                    let (k, _) = item?;
                    let (_, id) = k.value();
                    if let Some(buf) = records.get(id)? {
                        v.push(serde_json::from_slice(buf.value())?);
                    }
                }
                v
            };
            n = expired.len();
            for hr in &expired {
                delete_retired(&tx, hr)?;
            }
        }
        tx.commit()?;
        Ok(n)
    }

    /// Record a retired outgoing message, assigning an id when zero. The
    /// from-id, when non-empty, must be unique; it is indexed for DSN
    /// correlation.
    pub fn insert_msg_retired(&self, mr: &mut MsgRetired) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            if mr.id == 0 {
                mr.id = next_id(&tx, "msgretired")?;
            }
            tx.open_table(MSGS_RETIRED)?
                .insert(mr.id, serde_json::to_vec(mr)?.as_slice())?;
            if !mr.from_id.is_empty() {
                tx.open_table(MSGS_RETIRED_BY_FROM_ID)?
                    .insert(mr.from_id.as_str(), mr.id)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The retired outgoing message carrying this from-id, if any.
    pub fn msg_retired_by_from_id(&self, from_id: &str) -> Result<Option<MsgRetired>, StoreError> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(MSGS_RETIRED_BY_FROM_ID)?;
        let Some(id) = idx.get(from_id)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let records = tx.open_table(MSGS_RETIRED)?;
        match records.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn update_msg_retired(&self, mr: &MsgRetired) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            tx.open_table(MSGS_RETIRED)?
                .insert(mr.id, serde_json::to_vec(mr)?.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn all_hooks(&self) -> Result<Vec<Hook>, StoreError> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(HOOKS)?;
        let mut out = Vec::new();
        for item in t.iter()? {
            let (_, v) = item?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    fn all_retired(&self) -> Result<Vec<HookRetired>, StoreError> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(RETIRED)?;
        let mut out = Vec::new();
        for item in t.iter()? {
            let (_, v) = item?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}

fn next_id(tx: &WriteTransaction, seq: &str) -> Result<u64, StoreError> {
    let mut t = tx.open_table(SEQUENCES)?;
    let id = t.get(seq)?.map(|v| v.value()).unwrap_or(0) + 1;
    t.insert(seq, id)?;
    Ok(id)
}

fn put_hook(tx: &WriteTransaction, h: &Hook) -> Result<(), StoreError> {
    let buf = serde_json::to_vec(h)?;
    tx.open_table(HOOKS)?.insert(h.id, buf.as_slice())?;
    tx.open_table(HOOKS_BY_NEXT_ATTEMPT)?
        .insert((ts(h.next_attempt), h.id), ())?;
    tx.open_table(HOOKS_BY_SUBMITTED)?
        .insert((ts(h.submitted), h.id), ())?;
    Ok(())
}

fn unindex_hook_times(tx: &WriteTransaction, stored: &Hook) -> Result<(), StoreError> {
    tx.open_table(HOOKS_BY_NEXT_ATTEMPT)?
        .remove((ts(stored.next_attempt), stored.id))?;
    tx.open_table(HOOKS_BY_SUBMITTED)?
        .remove((ts(stored.submitted), stored.id))?;
    Ok(())
}

/// Remove a pending hook and its index entries. `stored` must be the stored
/// version of the record so index keys line up. The queue-message mapping is
/// only cleared when it still points at this hook.
fn delete_hook(tx: &WriteTransaction, stored: &Hook) -> Result<(), StoreError> {
    tx.open_table(HOOKS)?.remove(stored.id)?;
    unindex_hook_times(tx, stored)?;
    if stored.queue_msg_id != 0 {
        let mut t = tx.open_table(HOOKS_BY_QUEUE_MSG)?;
        if t.get(stored.queue_msg_id)?.map(|v| v.value()) == Some(stored.id) {
            t.remove(stored.queue_msg_id)?;
        }
    }
    Ok(())
}

fn put_retired(tx: &WriteTransaction, hr: &HookRetired) -> Result<(), StoreError> {
    let buf = serde_json::to_vec(hr)?;
    tx.open_table(RETIRED)?.insert(hr.id, buf.as_slice())?;
    tx.open_table(RETIRED_BY_KEEP_UNTIL)?
        .insert((ts(hr.keep_until), hr.id), ())?;
    tx.open_table(RETIRED_BY_LAST_ACTIVITY)?
        .insert((ts(hr.last_activity), hr.id), ())?;
    tx.open_table(RETIRED_BY_ACCOUNT)?
        .insert((hr.account.as_str(), ts(hr.last_activity), hr.id), ())?;
    Ok(())
}

fn delete_retired(tx: &WriteTransaction, hr: &HookRetired) -> Result<(), StoreError> {
    tx.open_table(RETIRED)?.remove(hr.id)?;
    tx.open_table(RETIRED_BY_KEEP_UNTIL)?
        .remove((ts(hr.keep_until), hr.id))?;
    tx.open_table(RETIRED_BY_LAST_ACTIVITY)?
        .remove((ts(hr.last_activity), hr.id))?;
    tx.open_table(RETIRED_BY_ACCOUNT)?
        .remove((hr.account.as_str(), ts(hr.last_activity), hr.id))?;
    Ok(())
}

/// Append the hook's final result to its retired record: the hook was
/// superseded while a delivery was in flight.
fn append_result_superseded(tx: &WriteTransaction, h: &Hook) -> Result<(), StoreError> {
    let mut t = tx.open_table(RETIRED)?;
    let Some(buf) = t.get(h.id)?.map(|v| v.value().to_vec()) else {
        return Err(StoreError::Absent);
    };
    let mut hr: HookRetired = serde_json::from_slice(&buf)?;
    if let Some(result) = h.results.last() {
        let mut result = result.clone();
        result.error.push_str("(superseded)");
        hr.results.push(result);
        t.insert(h.id, serde_json::to_vec(&hr)?.as_slice())?;
    }
    Ok(())
}

fn collect_matching_hooks(
    tx: &WriteTransaction,
    f: &CompiledFilter,
) -> Result<Vec<Hook>, StoreError> {
    let t = tx.open_table(HOOKS)?;
    let mut out = Vec::new();
    for item in t.iter()? {
        let (_, v) = item?;
        let h: Hook = serde_json::from_slice(v.value())?;
        if f.matches_hook(&h) {
            out.push(h);
            if f.max() > 0 && out.len() >= f.max() {
                break;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::OutgoingEvent;

    fn open_store() -> (tempfile::TempDir, HookStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HookStore::open(dir.path().join("hooks.db")).unwrap();
        (dir, store)
    }

    fn sample_hook(queue_msg_id: u64, url: &str) -> Hook {
        let now = Utc::now();
        Hook {
            id: 0,
            queue_msg_id,
            from_id: "fid".into(),
            message_id: "<msg@example.org>".into(),
            subject: "subject".into(),
            extra: BTreeMap::from([("k".to_string(), "v".to_string())]),
            account: "acct".into(),
            url: url.into(),
            authorization: "Bearer t".into(),
            is_incoming: false,
            outgoing_event: Some(OutgoingEvent::Delivered),
            payload: "{}".into(),
            submitted: now,
            attempts: 0,
            next_attempt: now,
            results: Vec::new(),
        }
    }

    const KEEP: Duration = Duration::from_secs(7 * 24 * 3600);

    #[test]
    fn supersession_keeps_one_pending_per_message() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(42, "http://h/1");
        store.add_hook(&mut h1, now, KEEP).unwrap();
        let mut h2 = sample_hook(42, "http://h/2");
        store.add_hook(&mut h2, now, KEEP).unwrap();

        assert!(h2.id > h1.id);
        assert!(store.hook(h1.id).unwrap().is_none());
        assert!(store.hook(h2.id).unwrap().is_some());
        assert_eq!(store.hook_queue_size().unwrap(), 1);

        let hr = store.retired(h1.id).unwrap().unwrap();
        assert_eq!(hr.id, h1.id);
        assert_eq!(hr.superseded_by_id, h2.id);
        assert!(!hr.success);
        assert!(hr.authorization);
        assert!(hr.keep_until >= hr.last_activity);
    }

    #[test]
    fn supersession_without_retention_drops_history() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(7, "http://h/1");
        store.add_hook(&mut h1, now, Duration::ZERO).unwrap();
        let mut h2 = sample_hook(7, "http://h/2");
        store.add_hook(&mut h2, now, Duration::ZERO).unwrap();

        assert!(store.hook(h1.id).unwrap().is_none());
        assert!(store.retired(h1.id).unwrap().is_none());
    }

    #[test]
    fn ids_are_never_reused() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(0, "http://h/1");
        store.add_hook(&mut h1, now, KEEP).unwrap();
        let filter = HookFilter {
            ids: vec![h1.id],
            ..HookFilter::default()
        };
        store.cancel_hooks(&filter, now, &|_| Duration::ZERO).unwrap();

        let mut h2 = sample_hook(0, "http://h/2");
        store.add_hook(&mut h2, now, KEEP).unwrap();
        assert!(h2.id > h1.id);
    }

    #[test]
    fn json_roundtrip_is_identical() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h = sample_hook(3, "http://h/x");
        h.results.push(HookResult {
            start: now,
            duration: Duration::from_millis(1234),
            url: h.url.clone(),
            success: false,
            code: 500,
            error: "http status 500".into(),
            response: "oops".into(),
        });
        store.add_hook(&mut h, now, KEEP).unwrap();

        let before = serde_json::to_vec(&h).unwrap();
        let loaded = store.hook(h.id).unwrap().unwrap();
        let after = serde_json::to_vec(&loaded).unwrap();
        assert_eq!(before, after);
        assert_eq!(h, loaded);
    }

    #[test]
    fn attempt_on_superseded_hook_lands_in_retired_record() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(9, "http://h/1");
        store.add_hook(&mut h1, now, KEEP).unwrap();
        let mut h2 = sample_hook(9, "http://h/2");
        store.add_hook(&mut h2, now, KEEP).unwrap();

        // The delivery of h1 completes only now.
        h1.attempts = 1;
        h1.results.push(HookResult {
            start: now,
            duration: Duration::from_millis(10),
            url: h1.url.clone(),
            success: true,
            code: 200,
            error: String::new(),
            response: "ok".into(),
        });
        let updated = store.update_after_attempt(&h1).unwrap();
        assert!(!updated);

        let hr = store.retired(h1.id).unwrap().unwrap();
        assert_eq!(hr.results.len(), 1);
        assert_eq!(hr.results[0].code, 200);
        assert!(hr.results[0].error.ends_with("(superseded)"));
    }

    #[test]
    fn retire_moves_hook_with_history_prefix() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h = sample_hook(11, "http://h/1");
        store.add_hook(&mut h, now, KEEP).unwrap();
        h.attempts = 1;
        h.results.push(HookResult {
            start: now,
            duration: Duration::from_millis(5),
            url: h.url.clone(),
            success: true,
            code: 200,
            error: String::new(),
            response: String::new(),
        });
        assert!(store.retire_hook(&h, true, now, KEEP).unwrap());

        assert!(store.hook(h.id).unwrap().is_none());
        let hr = store.retired(h.id).unwrap().unwrap();
        assert_eq!(hr.id, h.id);
        assert!(hr.success);
        assert_eq!(hr.attempts, 1);
        assert_eq!(hr.results, h.results);

        // A second hook for the same message may now be added without
        // disturbing the retired record.
        let mut h2 = sample_hook(11, "http://h/2");
        store.add_hook(&mut h2, now, KEEP).unwrap();
        assert_eq!(store.retired(h.id).unwrap().unwrap().superseded_by_id, 0);
    }

    #[test]
    fn retire_without_retention_only_deletes() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h = sample_hook(0, "http://h/1");
        store.add_hook(&mut h, now, Duration::ZERO).unwrap();
        assert!(store.retire_hook(&h, false, now, Duration::ZERO).unwrap());
        assert!(store.hook(h.id).unwrap().is_none());
        assert!(store.retired(h.id).unwrap().is_none());
    }

    #[test]
    fn cancel_gathers_and_deletes_in_one_pass() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h = sample_hook(0, "http://h/1");
        store.add_hook(&mut h, now, KEEP).unwrap();

        let filter = HookFilter {
            ids: vec![h.id],
            ..HookFilter::default()
        };
        let canceled = store.cancel_hooks(&filter, now, &|_| KEEP).unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].id, h.id);
        assert!(store.hook(h.id).unwrap().is_none());

        let hr = store.retired(h.id).unwrap().unwrap();
        assert!(!hr.success);
        assert_eq!(hr.results.last().unwrap().error, "canceled by admin");

        // Cancelling an absent or already-retired id affects nothing.
        let canceled = store.cancel_hooks(&filter, now, &|_| KEEP).unwrap();
        assert!(canceled.is_empty());
    }

    #[test]
    fn cleanup_removes_only_lapsed_retired() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(0, "http://h/1");
        store.add_hook(&mut h1, now, Duration::from_secs(1)).unwrap();
        store.retire_hook(&h1, true, now - chrono::Duration::hours(2), Duration::from_secs(1)).unwrap();

        let mut h2 = sample_hook(0, "http://h/2");
        store.add_hook(&mut h2, now, KEEP).unwrap();
        store.retire_hook(&h2, true, now, KEEP).unwrap();

        let n = store.cleanup_retired(Utc::now()).unwrap();
        assert_eq!(n, 1);
        assert!(store.retired(h1.id).unwrap().is_none());
        assert!(store.retired(h2.id).unwrap().is_some());
    }

    #[test]
    fn due_hooks_exclude_busy_urls() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(0, "http://h/busy");
        store.add_hook(&mut h1, now, KEEP).unwrap();
        let mut h2 = sample_hook(0, "http://h/free");
        store.add_hook(&mut h2, now, KEEP).unwrap();
        let mut h3 = sample_hook(0, "http://h/later");
        h3.next_attempt = now + chrono::Duration::hours(1);
        store.add_hook(&mut h3, now, KEEP).unwrap();

        let busy: HashSet<String> = ["http://h/busy".to_string()].into();
        let due = store.due_hooks(Utc::now(), 10, &busy).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, h2.id);

        let next = store.next_work(&busy).unwrap().unwrap();
        assert_eq!(next, due[0].next_attempt);

        let all_busy: HashSet<String> =
            ["http://h/busy".to_string(), "http://h/free".to_string()].into();
        let next = store.next_work(&all_busy).unwrap().unwrap();
        assert_eq!(ts(next), ts(h3.next_attempt));
    }

    #[test]
    fn next_attempt_updates_reindex() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h = sample_hook(0, "http://h/1");
        h.next_attempt = now + chrono::Duration::hours(1);
        store.add_hook(&mut h, now, KEEP).unwrap();

        assert!(store.due_hooks(now, 10, &HashSet::new()).unwrap().is_empty());

        let n = store
            .next_attempt_set(&HookFilter::default(), now - chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(n, 1);
        let due = store.due_hooks(now, 10, &HashSet::new()).unwrap();
        assert_eq!(due.len(), 1);

        let n = store
            .next_attempt_add(&HookFilter::default(), chrono::Duration::hours(2))
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.due_hooks(now, 10, &HashSet::new()).unwrap().is_empty());
    }

    #[test]
    fn msg_retired_from_id_lookup() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut mr = MsgRetired {
            id: 0,
            from_id: "abc".into(),
            message_id: "<orig@example.org>".into(),
            subject: "hi".into(),
            extra: BTreeMap::new(),
            sender_account: "acct".into(),
            recipient: "bob@remote.example".into(),
            last_activity: now,
            results: Vec::new(),
        };
        store.insert_msg_retired(&mut mr).unwrap();
        assert!(mr.id > 0);

        let found = store.msg_retired_by_from_id("abc").unwrap().unwrap();
        assert_eq!(found, mr);
        assert!(store.msg_retired_by_from_id("missing").unwrap().is_none());

        let mut updated = found.clone();
        updated.last_activity = now + chrono::Duration::seconds(5);
        store.update_msg_retired(&updated).unwrap();
        assert_eq!(
            store.msg_retired_by_from_id("abc").unwrap().unwrap(),
            updated
        );
    }

    #[test]
    fn list_hooks_filters_and_sorts() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut h1 = sample_hook(0, "http://h/1");
        h1.next_attempt = now + chrono::Duration::minutes(2);
        store.add_hook(&mut h1, now, KEEP).unwrap();
        let mut h2 = sample_hook(0, "http://h/2");
        h2.is_incoming = true;
        h2.outgoing_event = None;
        h2.next_attempt = now + chrono::Duration::minutes(1);
        store.add_hook(&mut h2, now, KEEP).unwrap();

        let all = store
            .list_hooks(&HookFilter::default(), &HookSort::default())
            .unwrap();
        assert_eq!(all.len(), 2);

        let incoming = store
            .list_hooks(
                &HookFilter {
                    event: "incoming".into(),
                    ..HookFilter::default()
                },
                &HookSort::default(),
            )
            .unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].id, h2.id);

        let delivered = store
            .list_hooks(
                &HookFilter {
                    event: "delivered".into(),
                    ..HookFilter::default()
                },
                &HookSort::default(),
            )
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, h1.id);

        let mut sort = HookSort {
            asc: true,
            ..HookSort::default()
        };
        let asc = store.list_hooks(&HookFilter::default(), &sort).unwrap();
        assert_eq!(asc[0].id, h2.id);
        sort.asc = false;
        let desc = store.list_hooks(&HookFilter::default(), &sort).unwrap();
        assert_eq!(desc[0].id, h1.id);

        let recent = store
            .list_hooks(
                &HookFilter {
                    next_attempt: ">now".into(),
                    ..HookFilter::default()
                },
                &HookSort::default(),
            )
            .unwrap();
        assert_eq!(recent.len(), 2);
        let none = store
            .list_hooks(
                &HookFilter {
                    submitted: "<-1h".into(),
                    ..HookFilter::default()
                },
                &HookSort::default(),
            )
            .unwrap();
        assert!(none.is_empty());
    }
}
