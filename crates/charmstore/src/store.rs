//! Backing store seam: the per-collection primitives the engines build on.
//!
//! The engines never talk to a database driver directly. They consume the
//! [`Datastore`] trait, which exposes exactly the atomic primitives the
//! publish, lock, and counter designs require: insert-if-absent, conditional
//! replace/delete, monotonic conditional upsert, find-or-insert, and
//! merge-increment. Each method documents the atomicity it promises; a
//! conforming implementation over any document store with those primitives
//! (one collection per logical name in §datastore of the crate docs) will
//! behave identically.
//!
//! [`MemoryDatastore`] is the bundled reference implementation: every
//! primitive runs under one mutex, which trivially satisfies the atomicity
//! contracts. It backs the test suite and embedders that do not bring their
//! own driver.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::events::Event;
use crate::types::{AliasPointer, CharmRecord};

/// Outcome of an atomic lock-document insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockInsert {
    /// No document existed; the caller now holds the lock.
    Acquired,
    /// A document already exists with the given acquisition time.
    Held(DateTime<Utc>),
}

/// One aggregated counter document, as stored in `stat.counters`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDoc {
    /// Token-encoded counter key, always delimiter-terminated.
    pub key: String,
    /// Bucket floor the document's increments were merged into.
    pub time: DateTime<Utc>,
    pub count: u64,
}

/// Document-store primitives consumed by the engines.
///
/// Implementations must make each individual method atomic with respect to
/// every other method; no caller ever needs multi-document transactions.
pub trait Datastore: Send + Sync {
    /// Insert a charm record keyed by `(url, revision)`.
    ///
    /// Returns `false` without modifying anything when a record with the
    /// same key already exists (the unique-constraint conflict the publish
    /// engine resolves races with).
    fn insert_charm(&self, record: &CharmRecord) -> Result<bool>;

    /// Fetch the charm record at `(url, revision)`, if any.
    fn charm(&self, url: &str, revision: i32) -> Result<Option<CharmRecord>>;

    /// Fetch the alias pointer for an unrevisioned URL, if any.
    fn alias(&self, url: &str) -> Result<Option<AliasPointer>>;

    /// Monotonic conditional upsert: set the alias to `(revision, digest)`
    /// only when no alias exists or the stored `latest_revision` is lower.
    /// Anything else is a silent no-op.
    fn set_alias_if_newer(&self, url: &str, revision: i32, digest: &str) -> Result<()>;

    /// Atomically insert `{url, time}` into the lock collection if no
    /// document for `url` exists; otherwise report the holder's time.
    fn insert_lock(&self, url: &str, time: DateTime<Utc>) -> Result<LockInsert>;

    /// Conditionally replace a lock's time: succeeds (returns `true`) only
    /// when the current document still carries `old_time`.
    fn replace_lock(
        &self,
        url: &str,
        old_time: DateTime<Utc>,
        new_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Conditionally delete a lock: removes the document only when it still
    /// carries `time`, so a taken-over holder's release is a no-op.
    fn remove_lock(&self, url: &str, time: DateTime<Utc>) -> Result<bool>;

    /// Append an event to the log.
    fn append_event(&self, event: &Event) -> Result<()>;

    /// All events mentioning `url`, in append order.
    fn events(&self, url: &str) -> Result<Vec<Event>>;

    /// Look up the token id for a counter-key segment without creating it.
    fn find_token(&self, segment: &str) -> Result<Option<i64>>;

    /// Find-or-insert on the token table: concurrent inserts of the same
    /// segment must all resolve to the single stable id.
    fn find_or_insert_token(&self, segment: &str) -> Result<i64>;

    /// Reverse lookup: the segment a token id stands for.
    fn token_segment(&self, id: i64) -> Result<Option<String>>;

    /// Merge one increment into the open counter document for `key`, or
    /// insert a fresh document when none is open. Documents are keyed by the
    /// bucket floor of `time` at `window` granularity; concurrent merges of
    /// the same bucket must sum.
    fn merge_counter(&self, key: &str, time: DateTime<Utc>, window: Duration) -> Result<()>;

    /// Ordered range scan over counter documents whose encoded key starts
    /// with `prefix`, restricted to `start <= time < stop` where bounds are
    /// present.
    fn scan_counters(
        &self,
        prefix: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<CounterDoc>>;
}

/// In-memory reference [`Datastore`].
///
/// All collections live behind a single mutex, so every primitive is
/// trivially atomic. Suitable for tests and embedded use.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: Mutex<Collections>,
}

#[derive(Default)]
struct Collections {
    charms: BTreeMap<(String, i32), CharmRecord>,
    aliases: BTreeMap<String, AliasPointer>,
    locks: BTreeMap<String, DateTime<Utc>>,
    events: Vec<Event>,
    tokens: BTreeMap<String, i64>,
    segments: BTreeMap<i64, String>,
    next_token: i64,
    counters: BTreeMap<(String, DateTime<Utc>), u64>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Floor `time` to its `window` bucket.
fn bucket_floor(time: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    let secs = (window.as_secs().max(1)) as i64;
    let floored = time.timestamp().div_euclid(secs) * secs;
    DateTime::<Utc>::from_timestamp(floored, 0).context("counter bucket timestamp out of range")
}

impl Datastore for MemoryDatastore {
    fn insert_charm(&self, record: &CharmRecord) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (record.url.clone(), record.revision);
        if inner.charms.contains_key(&key) {
            return Ok(false);
        }
        inner.charms.insert(key, record.clone());
        Ok(true)
    }

    fn charm(&self, url: &str, revision: i32) -> Result<Option<CharmRecord>> {
        let inner = self.inner.lock();
        Ok(inner.charms.get(&(url.to_string(), revision)).cloned())
    }

    fn alias(&self, url: &str) -> Result<Option<AliasPointer>> {
        let inner = self.inner.lock();
        Ok(inner.aliases.get(url).cloned())
    }

    fn set_alias_if_newer(&self, url: &str, revision: i32, digest: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.aliases.get_mut(url) {
            Some(alias) if alias.latest_revision >= revision => {}
            Some(alias) => {
                alias.latest_revision = revision;
                alias.digest = digest.to_string();
            }
            None => {
                inner.aliases.insert(
                    url.to_string(),
                    AliasPointer {
                        latest_revision: revision,
                        digest: digest.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn insert_lock(&self, url: &str, time: DateTime<Utc>) -> Result<LockInsert> {
        let mut inner = self.inner.lock();
        match inner.locks.get(url) {
            Some(held) => Ok(LockInsert::Held(*held)),
            None => {
                inner.locks.insert(url.to_string(), time);
                Ok(LockInsert::Acquired)
            }
        }
    }

    fn replace_lock(
        &self,
        url: &str,
        old_time: DateTime<Utc>,
        new_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.locks.get_mut(url) {
            Some(time) if *time == old_time => {
                *time = new_time;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_lock(&self, url: &str, time: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.locks.get(url) {
            Some(held) if *held == time => {
                inner.locks.remove(url);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn append_event(&self, event: &Event) -> Result<()> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    fn events(&self, url: &str) -> Result<Vec<Event>> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|event| event.urls.iter().any(|u| u == url))
            .cloned()
            .collect())
    }

    fn find_token(&self, segment: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock();
        Ok(inner.tokens.get(segment).copied())
    }

    fn find_or_insert_token(&self, segment: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.tokens.get(segment) {
            return Ok(*id);
        }
        inner.next_token += 1;
        let id = inner.next_token;
        inner.tokens.insert(segment.to_string(), id);
        inner.segments.insert(id, segment.to_string());
        Ok(id)
    }

    fn token_segment(&self, id: i64) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.segments.get(&id).cloned())
    }

    fn merge_counter(&self, key: &str, time: DateTime<Utc>, window: Duration) -> Result<()> {
        let bucket = bucket_floor(time, window)?;
        let mut inner = self.inner.lock();
        *inner
            .counters
            .entry((key.to_string(), bucket))
            .or_insert(0) += 1;
        Ok(())
    }

    fn scan_counters(
        &self,
        prefix: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<CounterDoc>> {
        let inner = self.inner.lock();
        let from = (prefix.to_string(), DateTime::<Utc>::MIN_UTC);
        Ok(inner
            .counters
            .range(from..)
            .take_while(|((key, _), _)| key.starts_with(prefix))
            .filter(|((_, time), _)| {
                start.is_none_or(|s| *time >= s) && stop.is_none_or(|s| *time < s)
            })
            .map(|((key, time), count)| CounterDoc {
                key: key.clone(),
                time: *time,
                count: *count,
            })
            .collect())
    }
}
