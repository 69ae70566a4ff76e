//! Advisory update locks over sets of charm URLs.
//!
//! One lock document per unrevisioned URL, holding the acquisition
//! timestamp. Staleness is judged against that timestamp rather than an
//! infrastructure TTL, which keeps the design portable and lets release skip
//! documents a later holder has taken over. Multi-URL acquires always walk
//! the set in sorted order so two concurrent acquires cannot deadlock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{Datastore, LockInsert};
use crate::types::{Error, Result};
use crate::url::{CharmUrl, ensure_unrevisioned};

/// Default age after which a holder is considered gone and may be taken over.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Acquires and adjudicates update locks against the lock collection.
pub struct LockManager {
    db: Arc<dyn Datastore>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(db: Arc<dyn Datastore>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// Acquire the lock set over `urls`, or fail with
    /// [`Error::UpdateConflict`] if any URL is held by a live updater.
    ///
    /// Locks older than the timeout are taken over. On failure everything
    /// acquired so far is released before returning.
    pub fn acquire(&self, urls: &[CharmUrl]) -> Result<UpdateLock> {
        ensure_unrevisioned("lock-updates", urls)?;
        if urls.is_empty() {
            return Err(Error::EmptyUrlSet { op: "lock-updates" });
        }

        let mut keys: Vec<String> = urls.iter().map(CharmUrl::canonical).collect();
        keys.sort();
        keys.dedup();

        let time = Utc::now();
        let mut acquired: Vec<String> = Vec::new();
        for key in &keys {
            match self.acquire_one(key, time) {
                Ok(true) => acquired.push(key.clone()),
                Ok(false) => {
                    self.release_keys(&acquired, time);
                    return Err(Error::UpdateConflict);
                }
                Err(err) => {
                    self.release_keys(&acquired, time);
                    return Err(err);
                }
            }
        }

        Ok(UpdateLock {
            db: Arc::clone(&self.db),
            keys,
            time,
        })
    }

    fn acquire_one(&self, key: &str, time: DateTime<Utc>) -> Result<bool> {
        match self.db.insert_lock(key, time)? {
            LockInsert::Acquired => Ok(true),
            LockInsert::Held(held_since) => {
                let age = time - held_since;
                if age.num_seconds() >= self.timeout.as_secs() as i64 {
                    tracing::warn!(url = %key, %held_since, "taking over expired update lock");
                    // A raced takeover means someone else got there first.
                    Ok(self.db.replace_lock(key, held_since, time)?)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn release_keys(&self, keys: &[String], time: DateTime<Utc>) {
        for key in keys {
            if let Err(err) = self.db.remove_lock(key, time) {
                tracing::warn!(url = %key, error = %err, "failed to release update lock");
            }
        }
    }
}

/// A held lock set.
///
/// Deliberately not a scope guard: the publish engine carries the lock
/// across calls and decides per error path whether to release, so release is
/// an explicit operation.
pub struct UpdateLock {
    db: Arc<dyn Datastore>,
    keys: Vec<String>,
    time: DateTime<Utc>,
}

impl std::fmt::Debug for UpdateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLock")
            .field("keys", &self.keys)
            .field("time", &self.time)
            .finish()
    }
}

impl UpdateLock {
    /// Delete the lock documents this acquisition created.
    ///
    /// The delete is conditional on the acquisition time, so releasing after
    /// a takeover is a no-op and never disturbs the new holder.
    pub fn release(&self) -> Result<()> {
        for key in &self.keys {
            self.db.remove_lock(key, self.time)?;
        }
        Ok(())
    }

    /// The sorted canonical URLs this lock covers.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The acquisition timestamp recorded in the lock documents.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}
