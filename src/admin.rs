//! Operator-facing listing and bulk operations on the webhook queue.
//!
//! Filters select hooks to list or operate on; only non-empty/non-zero fields
//! apply, so the zero filter matches everything. Time predicates are written
//! as `">dur"` or `"<dur"` where `dur` is the literal `now` or a duration
//! like `1h30m` or `-15m`, evaluated against now+dur.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::dispatcher::Engine;
use crate::error::Error;
use crate::types::{Hook, HookRetired};

/// Selects pending hooks to list or operate on.
#[derive(Debug, Clone, Default)]
pub struct HookFilter {
    /// Maximum number of results, 0 for no limit.
    pub max: usize,
    pub ids: Vec<u64>,
    pub account: String,
    /// Time predicate on the submitted time.
    pub submitted: String,
    /// Time predicate on the next delivery attempt.
    pub next_attempt: String,
    /// Event tag, with "incoming" selecting incoming-message hooks.
    pub event: String,
}

impl HookFilter {
    pub(crate) fn compile(&self) -> Result<CompiledFilter, Error> {
        Ok(CompiledFilter {
            max: self.max,
            ids: compile_ids(&self.ids),
            account: compile_nonempty(&self.account),
            first_time: compile_time("submitted", &self.submitted)?,
            second_time: compile_time("next attempt", &self.next_attempt)?,
            event: compile_nonempty(&self.event),
        })
    }
}

/// Selects retired hooks to list or operate on.
#[derive(Debug, Clone, Default)]
pub struct HookRetiredFilter {
    pub max: usize,
    pub ids: Vec<u64>,
    pub account: String,
    pub submitted: String,
    /// Time predicate on the last delivery or supersession activity.
    pub last_activity: String,
    pub event: String,
}

impl HookRetiredFilter {
    pub(crate) fn compile(&self) -> Result<CompiledFilter, Error> {
        Ok(CompiledFilter {
            max: self.max,
            ids: compile_ids(&self.ids),
            account: compile_nonempty(&self.account),
            first_time: compile_time("submitted", &self.submitted)?,
            second_time: compile_time("last activity", &self.last_activity)?,
            event: compile_nonempty(&self.event),
        })
    }
}

/// A filter with its time predicates resolved against the current time.
pub(crate) struct CompiledFilter {
    max: usize,
    ids: Option<HashSet<u64>>,
    account: Option<String>,
    /// Submitted.
    first_time: Option<TimePredicate>,
    /// NextAttempt for pending hooks, LastActivity for retired ones.
    second_time: Option<TimePredicate>,
    event: Option<String>,
}

impl CompiledFilter {
    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn matches_hook(&self, h: &Hook) -> bool {
        self.matches(h.id, &h.account, h.submitted, h.next_attempt, h.event_tag())
    }

    pub(crate) fn matches_retired(&self, h: &HookRetired) -> bool {
        self.matches(h.id, &h.account, h.submitted, h.last_activity, h.event_tag())
    }

    fn matches(
        &self,
        id: u64,
        account: &str,
        first: DateTime<Utc>,
        second: DateTime<Utc>,
        event_tag: &str,
    ) -> bool {
        if self.ids.as_ref().is_some_and(|ids| !ids.contains(&id)) {
            return false;
        }
        if self.account.as_deref().is_some_and(|a| a != account) {
            return false;
        }
        if self.first_time.as_ref().is_some_and(|p| !p.matches(first)) {
            return false;
        }
        if self.second_time.as_ref().is_some_and(|p| !p.matches(second)) {
            return false;
        }
        if self.event.as_deref().is_some_and(|e| e != event_tag) {
            return false;
        }
        true
    }
}

fn compile_ids(ids: &[u64]) -> Option<HashSet<u64>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.iter().copied().collect())
    }
}

fn compile_nonempty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn compile_time(what: &str, s: &str) -> Result<Option<TimePredicate>, Error> {
    if s.is_empty() {
        return Ok(None);
    }
    TimePredicate::parse(s)
        .map(Some)
        .map_err(|e| Error::Usage(format!("applying filter for {what}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimePredicate {
    less: bool,
    at: DateTime<Utc>,
}

impl TimePredicate {
    fn parse(s: &str) -> Result<TimePredicate, Error> {
        let (less, rest) = if let Some(r) = s.strip_prefix('<') {
            (true, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (false, r)
        } else {
            return Err(Error::Usage(
                r#"must start with "<" for less or ">" for greater than a duration ago"#.into(),
            ));
        };
        let rest = rest.trim();
        let at = if rest == "now" {
            Utc::now()
        } else {
            Utc::now() + parse_duration(rest)?
        };
        Ok(TimePredicate { less, at })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        if self.less {
            t < self.at
        } else {
            t > self.at
        }
    }
}

/// Parse a possibly negative duration like "90s", "1h30m" or "-2.5h".
/// Units: ms, s, m, h, d, w.
pub(crate) fn parse_duration(s: &str) -> Result<chrono::Duration, Error> {
    let err = || Error::Usage(format!("parsing duration {s:?}"));
    let (neg, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest.is_empty() {
        return Err(err());
    }
    let mut total_ms = 0f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..num_end].parse().map_err(|_| err())?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];
        let ms = match unit {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            "w" => 604_800_000.0,
            _ => return Err(err()),
        };
        total_ms += value * ms;
    }
    let d = chrono::Duration::milliseconds(total_ms as i64);
    Ok(if neg { -d } else { d })
}

/// Sort order for pending hooks, with an optional keyset cursor for paging.
#[derive(Debug, Clone, Default)]
pub struct HookSort {
    pub field: HookSortField,
    /// When non-zero, return results beyond the record with this id.
    pub last_id: u64,
    /// Sort-field value of the cursor record, RFC 3339. Set iff `last_id` is.
    pub last: String,
    pub asc: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookSortField {
    #[default]
    NextAttempt,
    Submitted,
}

impl HookSort {
    pub(crate) fn apply(&self, hooks: &mut Vec<Hook>) -> Result<(), Error> {
        let field = self.field;
        keyset_page(
            hooks,
            move |h| match field {
                HookSortField::NextAttempt => h.next_attempt,
                HookSortField::Submitted => h.submitted,
            },
            |h| h.id,
            self.asc,
            parse_cursor(self.last_id, &self.last)?,
        );
        Ok(())
    }
}

/// Sort order for retired hooks.
#[derive(Debug, Clone, Default)]
pub struct HookRetiredSort {
    pub field: HookRetiredSortField,
    pub last_id: u64,
    pub last: String,
    pub asc: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookRetiredSortField {
    #[default]
    LastActivity,
    Submitted,
}

impl HookRetiredSort {
    pub(crate) fn apply(&self, hooks: &mut Vec<HookRetired>) -> Result<(), Error> {
        let field = self.field;
        keyset_page(
            hooks,
            move |h| match field {
                HookRetiredSortField::LastActivity => h.last_activity,
                HookRetiredSortField::Submitted => h.submitted,
            },
            |h| h.id,
            self.asc,
            parse_cursor(self.last_id, &self.last)?,
        );
        Ok(())
    }
}

fn parse_cursor(last_id: u64, last: &str) -> Result<Option<(DateTime<Utc>, u64)>, Error> {
    if last_id == 0 {
        return Ok(None);
    }
    let t = DateTime::parse_from_rfc3339(last)
        .map_err(|e| Error::Usage(format!("parsing last {last:?} as time: {e}")))?;
    Ok(Some((t.with_timezone(&Utc), last_id)))
}

/// Sort by (field value, id) and drop everything at or before the cursor.
fn keyset_page<T>(
    items: &mut Vec<T>,
    key: impl Fn(&T) -> DateTime<Utc>,
    id: impl Fn(&T) -> u64,
    asc: bool,
    cursor: Option<(DateTime<Utc>, u64)>,
) {
    items.sort_by(|a, b| {
        let ka = (key(a), id(a));
        let kb = (key(b), id(b));
        if asc {
            ka.cmp(&kb)
        } else {
            kb.cmp(&ka)
        }
    });
    if let Some(cursor) = cursor {
        items.retain(|t| {
            let k = (key(t), id(t));
            if asc {
                k > cursor
            } else {
                k < cursor
            }
        });
    }
}

impl Engine {
    /// Number of webhooks waiting for delivery.
    pub fn hook_queue_size(&self) -> Result<u64, Error> {
        Ok(self.store().hook_queue_size()?)
    }

    /// Pending webhooks matching the filter, in the given order.
    pub fn hook_list(&self, filter: &HookFilter, sort: &HookSort) -> Result<Vec<Hook>, Error> {
        self.store().list_hooks(filter, sort)
    }

    /// Number of pending webhooks matching the filter.
    pub fn hook_count(&self, filter: &HookFilter) -> Result<usize, Error> {
        Ok(self.store().list_hooks(filter, &HookSort::default())?.len())
    }

    /// Retired webhooks matching the filter, in the given order.
    pub fn hook_retired_list(
        &self,
        filter: &HookRetiredFilter,
        sort: &HookRetiredSort,
    ) -> Result<Vec<HookRetired>, Error> {
        self.store().list_retired(filter, sort)
    }

    /// Number of retired webhooks matching the filter.
    pub fn hook_retired_count(&self, filter: &HookRetiredFilter) -> Result<usize, Error> {
        Ok(self
            .store()
            .list_retired(filter, &HookRetiredSort::default())?
            .len())
    }

    /// Add a duration to the next attempt time of all matching webhooks and
    /// wake the scheduler. Returns the number of affected webhooks.
    pub fn hook_next_attempt_add(
        &self,
        filter: &HookFilter,
        d: chrono::Duration,
    ) -> Result<usize, Error> {
        let n = self.store().next_attempt_add(filter, d)?;
        self.kick();
        Ok(n)
    }

    /// Set the next attempt time of all matching webhooks to an absolute time
    /// and wake the scheduler. Returns the number of affected webhooks.
    pub fn hook_next_attempt_set(
        &self,
        filter: &HookFilter,
        t: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let n = self.store().next_attempt_set(filter, t)?;
        self.kick();
        Ok(n)
    }

    /// Prevent further delivery attempts of the matching webhooks, moving them
    /// to the retired list when the account keeps retired webhooks. Absent or
    /// already-retired ids are not an error. Returns the number of canceled
    /// webhooks.
    pub fn hook_cancel(&self, filter: &HookFilter) -> Result<usize, Error> {
        let accounts = self.accounts();
        let canceled = self.store().cancel_hooks(filter, Utc::now(), &|account| {
            crate::config::retired_keep(accounts, account)
        })?;
        for h in &canceled {
            tracing::info!(
                webhookid = h.id,
                account = %h.account,
                url = %h.url,
                event = %h.event_tag(),
                "canceled hook"
            );
        }
        self.kick();
        Ok(canceled.len())
    }
}
