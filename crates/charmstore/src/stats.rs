//! Usage counter engine: hierarchical keys, token encoding, and bucketed
//! aggregation.
//!
//! Counter keys are ordered segment sequences (`["charm", "oneiric",
//! "wordpress"]`). Each segment maps to a stable numeric token from the
//! write-once `stat.tokens` table; the encoded key is the concatenation of
//! the tokens in lowercase hex, each followed by `:`. The trailing delimiter
//! makes prefix scans unambiguous between sibling tokens.
//!
//! Writes are lock-free: an increment merges into the open counter document
//! for its key or starts a new one when the merge window has rotated. Reads
//! aggregate matching documents, optionally bucketed by UTC day or by week
//! starting Sunday 00:00 UTC.
//!
//! Token lookups go through a bounded two-generation cache. The cache is an
//! optimization for forward (segment to id) lookups only; list queries that
//! need segments not currently cached fetch them from the token table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use parking_lot::Mutex;

use crate::store::Datastore;
use crate::types::{By, Counter, CounterRequest, Error, Result};

/// Counter engine handle.
///
/// The token cache is per-handle state, not process-global: multiple handles
/// over one datastore are supported (and exercise the cache-filling paths).
pub struct Stats {
    db: Arc<dyn Datastore>,
    cache: Mutex<TokenCache>,
    window: Duration,
}

impl Stats {
    pub(crate) fn new(db: Arc<dyn Datastore>, cache_size: usize, window: Duration) -> Self {
        Self {
            db,
            cache: Mutex::new(TokenCache::new(cache_size)),
            window,
        }
    }

    /// Count one occurrence of `key`.
    pub fn inc<S: AsRef<str>>(&self, key: &[S]) -> Result<()> {
        self.inc_at(key, Utc::now())
    }

    /// Count one occurrence of `key` at an explicit time.
    pub(crate) fn inc_at<S: AsRef<str>>(&self, key: &[S], time: DateTime<Utc>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyCounterKey);
        }
        let ids = self
            .resolve_tokens(key, true)?
            .ok_or_else(|| Error::Store(anyhow!("token resolution lost a created segment")))?;
        self.db.merge_counter(&encode_key(&ids), time, self.window)?;
        Ok(())
    }

    /// Aggregate counters for a key or key prefix.
    ///
    /// See [`CounterRequest`] for the query shapes. Unknown key segments
    /// yield a zero count (or an empty list) without touching the token
    /// table.
    pub fn counters(&self, req: &CounterRequest) -> Result<Vec<Counter>> {
        if req.key.is_empty() {
            return Err(Error::EmptyCounterKey);
        }

        let Some(ids) = self.resolve_tokens(&req.key, false)? else {
            return Ok(if req.list {
                Vec::new()
            } else {
                vec![Counter {
                    key: req.key.clone(),
                    prefix: req.prefix,
                    count: 0,
                    time: None,
                }]
            });
        };
        let encoded = encode_key(&ids);
        let docs = self.db.scan_counters(&encoded, req.start, req.stop)?;

        // Group rows by (bucket, child token, leaf/subtree).
        let mut groups: BTreeMap<(Option<DateTime<Utc>>, Option<i64>, bool), u64> =
            BTreeMap::new();
        for doc in &docs {
            let bucket = match req.by {
                By::None => None,
                By::Day => Some(day_floor(doc.time)),
                By::Week => Some(week_floor(doc.time)),
            };
            if req.list {
                let rest = decode_key(&doc.key[encoded.len()..])?;
                // A document exactly at the prefix has no child to list.
                let Some((&child, below)) = rest.split_first() else {
                    continue;
                };
                *groups
                    .entry((bucket, Some(child), !below.is_empty()))
                    .or_insert(0) += doc.count;
            } else {
                if !req.prefix && doc.key != encoded {
                    continue;
                }
                *groups.entry((bucket, None, req.prefix)).or_insert(0) += doc.count;
            }
        }

        if !req.list && req.by == By::None {
            // Single aggregate: always exactly one row, zero when nothing
            // matched.
            let count = groups.into_values().sum();
            return Ok(vec![Counter {
                key: req.key.clone(),
                prefix: req.prefix,
                count,
                time: None,
            }]);
        }

        let mut counters = Vec::with_capacity(groups.len());
        for ((bucket, child, prefix), count) in groups {
            let mut key = req.key.clone();
            if let Some(id) = child {
                key.push(self.segment_for(id)?);
            }
            counters.push(Counter {
                key,
                prefix,
                count,
                time: bucket,
            });
        }
        counters.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Ok(counters)
    }

    /// Resolve key segments to token ids.
    ///
    /// With `create` set, missing segments are allocated via find-or-insert;
    /// otherwise an unknown segment resolves the whole key to `None` without
    /// polluting the token table.
    fn resolve_tokens<S: AsRef<str>>(&self, key: &[S], create: bool) -> Result<Option<Vec<i64>>> {
        let mut ids = Vec::with_capacity(key.len());
        for segment in key {
            let segment = segment.as_ref();
            if let Some(id) = self.cache.lock().token(segment) {
                ids.push(id);
                continue;
            }
            let id = if create {
                Some(self.db.find_or_insert_token(segment)?)
            } else {
                self.db.find_token(segment)?
            };
            match id {
                Some(id) => {
                    self.cache.lock().insert(segment, id);
                    ids.push(id);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    }

    /// Reverse token lookup for list results, falling back to the table.
    fn segment_for(&self, id: i64) -> Result<String> {
        if let Some(segment) = self.cache.lock().segment(id) {
            return Ok(segment);
        }
        let segment = self
            .db
            .token_segment(id)?
            .ok_or_else(|| Error::Store(anyhow!("counter token {id} has no segment")))?;
        self.cache.lock().insert(&segment, id);
        Ok(segment)
    }
}

/// Render token ids as the encoded counter key.
fn encode_key(ids: &[i64]) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    for id in ids {
        let _ = write!(out, "{id:x}:");
    }
    out
}

/// Parse an encoded counter key (or suffix of one) back into token ids.
fn decode_key(encoded: &str) -> Result<Vec<i64>> {
    encoded
        .split_terminator(':')
        .map(|part| {
            i64::from_str_radix(part, 16)
                .map_err(|_| Error::Store(anyhow!("malformed counter key token {part:?}")))
        })
        .collect()
}

fn day_floor(time: DateTime<Utc>) -> DateTime<Utc> {
    time.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Floor to the enclosing week, weeks starting Sunday 00:00 UTC.
fn week_floor(time: DateTime<Utc>) -> DateTime<Utc> {
    let days_into_week = time.weekday().num_days_from_sunday() as u64;
    (time.date_naive() - chrono::Days::new(days_into_week))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Bounded two-generation token cache.
///
/// Lookups consult the fresh generation, then the stale one; a stale hit is
/// not promoted. When the fresh generation is full and an insert arrives,
/// the stale generation is dropped and the fresh one takes its place. An
/// entry last touched in the stale generation is therefore lost on the next
/// rotation; that is the intended cost of keeping the cache bounded without
/// per-entry bookkeeping.
struct TokenCache {
    cap: usize,
    fresh: Generation,
    stale: Generation,
}

#[derive(Default)]
struct Generation {
    by_segment: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
}

impl Generation {
    fn insert(&mut self, segment: &str, id: i64) {
        self.by_segment.insert(segment.to_string(), id);
        self.by_id.insert(id, segment.to_string());
    }
}

impl TokenCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            fresh: Generation::default(),
            stale: Generation::default(),
        }
    }

    fn token(&self, segment: &str) -> Option<i64> {
        self.fresh
            .by_segment
            .get(segment)
            .or_else(|| self.stale.by_segment.get(segment))
            .copied()
    }

    fn segment(&self, id: i64) -> Option<String> {
        self.fresh
            .by_id
            .get(&id)
            .or_else(|| self.stale.by_id.get(&id))
            .cloned()
    }

    fn insert(&mut self, segment: &str, id: i64) {
        if self.fresh.by_segment.contains_key(segment) {
            return;
        }
        if self.fresh.by_segment.len() >= self.cap {
            self.stale = std::mem::take(&mut self.fresh);
        }
        self.fresh.insert(segment, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStorage;
    use crate::store::MemoryDatastore;
    use crate::{CharmStore, config::StoreConfig};

    fn stats_with_db() -> (CharmStore, Arc<MemoryDatastore>) {
        let db = Arc::new(MemoryDatastore::new());
        let store = CharmStore::new(
            Arc::clone(&db) as Arc<dyn Datastore>,
            Arc::new(MemoryBlobStorage::new()),
        );
        (store, db)
    }

    fn counter(key: &[&str], prefix: bool, count: u64) -> Counter {
        Counter {
            key: key.iter().map(|s| s.to_string()).collect(),
            prefix,
            count,
            time: None,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("time")
            .with_timezone(&Utc)
    }

    #[test]
    fn inc_rejects_empty_key() {
        let (store, _) = stats_with_db();
        let err = store.stats().inc::<&str>(&[]).expect_err("empty");
        assert!(matches!(err, Error::EmptyCounterKey));
    }

    #[test]
    fn sums_exact_key_without_descendants() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        stats.inc(&["a"]).expect("inc");
        stats.inc(&["a"]).expect("inc");
        stats.inc(&["a", "b"]).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got, vec![counter(&["a"], false, 2)]);
    }

    #[test]
    fn sums_prefix_including_exact_documents() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        stats.inc(&["a"]).expect("inc");
        stats.inc(&["a", "b"]).expect("inc");
        stats.inc(&["a", "b", "c"]).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                prefix: true,
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got, vec![counter(&["a"], true, 3)]);
    }

    #[test]
    fn unknown_key_counts_zero_without_creating_tokens() {
        let (store, db) = stats_with_db();
        let got = store
            .stats()
            .counters(&CounterRequest {
                key: vec!["ghost".to_string()],
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got, vec![counter(&["ghost"], false, 0)]);
        assert_eq!(db.find_token("ghost").expect("find"), None);

        let listed = store
            .stats()
            .counters(&CounterRequest {
                key: vec!["ghost".to_string()],
                prefix: true,
                list: true,
                ..Default::default()
            })
            .expect("counters");
        assert!(listed.is_empty());
    }

    #[test]
    fn list_groups_children_in_reference_order() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        let incs: &[&[&str]] = &[
            &["a", "b", "c"],
            &["a", "b"],
            &["a", "b", "c"],
            &["a", "b", "c"],
            &["a", "b", "c"],
            &["a", "f", "g"],
            &["a", "f", "h"],
            &["a", "c"],
            &["a", "i"],
            &["a", "i", "j"],
            &["b"],
            &["b"],
            &["c"],
        ];
        for key in incs {
            stats.inc(key).expect("inc");
        }

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                prefix: true,
                list: true,
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(
            got,
            vec![
                counter(&["a", "b"], true, 4),
                counter(&["a", "f"], true, 2),
                counter(&["a", "b"], false, 1),
                counter(&["a", "c"], false, 1),
                counter(&["a", "i"], false, 1),
                counter(&["a", "i"], true, 1),
            ]
        );
    }

    #[test]
    fn day_buckets_sort_by_time_then_count() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        stats.inc_at(&["a", "b"], at("2013-09-10T08:00:00Z")).expect("inc");
        stats.inc_at(&["a", "b"], at("2013-09-10T22:10:00Z")).expect("inc");
        stats.inc_at(&["a", "b"], at("2013-09-11T01:00:00Z")).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string(), "b".to_string()],
                by: By::Day,
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].time, Some(at("2013-09-10T00:00:00Z")));
        assert_eq!(got[0].count, 2);
        assert_eq!(got[1].time, Some(at("2013-09-11T00:00:00Z")));
        assert_eq!(got[1].count, 1);
    }

    #[test]
    fn week_buckets_start_sunday_utc() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        // 2013-09-10 is a Tuesday; its week starts Sunday 2013-09-08.
        stats.inc_at(&["a"], at("2013-09-10T12:00:00Z")).expect("inc");
        stats.inc_at(&["a"], at("2013-09-13T12:00:00Z")).expect("inc");
        stats.inc_at(&["a"], at("2013-09-15T00:00:00Z")).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                by: By::Week,
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].time, Some(at("2013-09-08T00:00:00Z")));
        assert_eq!(got[0].count, 2);
        assert_eq!(got[1].time, Some(at("2013-09-15T00:00:00Z")));
        assert_eq!(got[1].count, 1);
    }

    #[test]
    fn time_bounds_are_inclusive_start_exclusive_stop() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        stats.inc_at(&["a"], at("2013-09-10T00:00:00Z")).expect("inc");
        stats.inc_at(&["a"], at("2013-09-11T00:00:00Z")).expect("inc");
        stats.inc_at(&["a"], at("2013-09-12T00:00:00Z")).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                start: Some(at("2013-09-10T00:00:00Z")),
                stop: Some(at("2013-09-12T00:00:00Z")),
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(got, vec![counter(&["a"], false, 2)]);
    }

    #[test]
    fn day_bucketed_list_reports_children_per_day() {
        let (store, _) = stats_with_db();
        let stats = store.stats();
        stats.inc_at(&["a", "b"], at("2013-09-10T08:00:00Z")).expect("inc");
        stats.inc_at(&["a", "c"], at("2013-09-10T09:00:00Z")).expect("inc");
        stats.inc_at(&["a", "b"], at("2013-09-11T08:00:00Z")).expect("inc");

        let got = stats
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                prefix: true,
                list: true,
                by: By::Day,
                ..Default::default()
            })
            .expect("counters");
        let day1 = Some(at("2013-09-10T00:00:00Z"));
        let day2 = Some(at("2013-09-11T00:00:00Z"));
        assert_eq!(
            got.iter()
                .map(|c| (c.time, c.key.clone(), c.prefix, c.count))
                .collect::<Vec<_>>(),
            vec![
                (day1, vec!["a".to_string(), "b".to_string()], false, 1),
                (day1, vec!["a".to_string(), "c".to_string()], false, 1),
                (day2, vec!["a".to_string(), "b".to_string()], false, 1),
            ]
        );
    }

    #[test]
    fn second_handle_resolves_segments_from_the_table() {
        let (writer, db) = stats_with_db();
        writer.stats().inc(&["a", "b"]).expect("inc");
        writer.stats().inc(&["a", "c"]).expect("inc");

        // A fresh handle has a cold cache and must pull segments back out of
        // the token table for list results.
        let reader = CharmStore::with_config(
            Arc::clone(&db) as Arc<dyn Datastore>,
            Arc::new(MemoryBlobStorage::new()),
            StoreConfig::default(),
        );
        let got = reader
            .stats()
            .counters(&CounterRequest {
                key: vec!["a".to_string()],
                prefix: true,
                list: true,
                ..Default::default()
            })
            .expect("counters");
        assert_eq!(
            got,
            vec![counter(&["a", "b"], false, 1), counter(&["a", "c"], false, 1)]
        );
    }

    #[test]
    fn cache_rotation_drops_the_old_generation() {
        let mut cache = TokenCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Full: inserting rotates, so "a" and "b" move to the stale
        // generation and stay visible.
        cache.insert("c", 3);
        assert_eq!(cache.token("a"), Some(1));
        assert_eq!(cache.token("b"), Some(2));
        assert_eq!(cache.token("c"), Some(3));

        // Next rotation drops the stale generation entirely.
        cache.insert("d", 4);
        cache.insert("e", 5);
        assert_eq!(cache.token("a"), None);
        assert_eq!(cache.token("b"), None);
        assert_eq!(cache.token("c"), Some(3));
        assert_eq!(cache.token("d"), Some(4));
        assert_eq!(cache.token("e"), Some(5));
    }

    #[test]
    fn stale_hit_is_not_promoted() {
        let mut cache = TokenCache::new(1);
        cache.insert("a", 1);
        cache.insert("b", 2); // rotates; "a" is now stale

        // Hitting "a" in the stale generation must not refresh it.
        assert_eq!(cache.token("a"), Some(1));
        cache.insert("c", 3); // rotates again; "a" is gone
        assert_eq!(cache.token("a"), None);
        assert_eq!(cache.token("b"), Some(2));
        assert_eq!(cache.token("c"), Some(3));
    }

    #[test]
    fn reverse_lookup_follows_generations() {
        let mut cache = TokenCache::new(2);
        cache.insert("a", 1);
        assert_eq!(cache.segment(1).as_deref(), Some("a"));
        assert_eq!(cache.segment(2), None);
    }

    #[test]
    fn encode_and_decode_roundtrip() {
        let ids = vec![1, 10, 255];
        let encoded = encode_key(&ids);
        assert_eq!(encoded, "1:a:ff:");
        assert_eq!(decode_key(&encoded).expect("decode"), ids);
        assert_eq!(decode_key("").expect("decode"), Vec::<i64>::new());
    }
}
