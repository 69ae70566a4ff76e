//! Core publish, read, and event-query logic.
//!
//! Publication is a two-phase affair. [`CharmStore::publisher`] takes the
//! update lock over every requested alias, checks redundancy against the
//! alias pointers, and assigns the next revision.
//! [`Publisher::publish`] then streams the bundle into blob storage, commits
//! one charm record per alias under a `(url, revision)` unique constraint,
//! monotonically bumps the alias pointers, and appends a `published` event.
//!
//! If the lock ever fails (a takeover after expiry, or an operator clearing
//! the collection), two publishers can race to the same revision. The unique
//! constraint picks exactly one winner per URL and the loser surfaces
//! [`Error::UpdateConflict`]; the monotonic alias upsert makes the pointers
//! land on the winning revision regardless of commit order, so no rollback
//! of sibling records is needed.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::blob::{BlobRef, BlobWriter};
use crate::config::StoreConfig;
use crate::events::Event;
use crate::lock::{LockManager, UpdateLock};
use crate::stats::Stats;
use crate::storage::{BlobStorage, MemoryBlobStorage};
use crate::store::{Datastore, MemoryDatastore};
use crate::types::{CharmConfig, CharmInfo, CharmMeta, CharmRecord, Error, Result};
use crate::url::{CharmUrl, ensure_unrevisioned};

/// Source of a charm's metadata and bundle bytes during publication.
///
/// Anything that can describe itself and stream its bytes qualifies; the
/// engine tells the bundler its assigned revision before asking for bytes so
/// revision-dependent content can be produced.
pub trait Bundler {
    fn meta(&self) -> &CharmMeta;
    fn config(&self) -> &CharmConfig;
    fn set_revision(&mut self, revision: i32);
    fn bundle_to(&mut self, sink: &mut dyn Write) -> anyhow::Result<()>;
}

/// The charm store: publish engine, read path, and counter engine over a
/// backing [`Datastore`] and [`BlobStorage`].
pub struct CharmStore {
    db: Arc<dyn Datastore>,
    blobs: Arc<dyn BlobStorage>,
    locks: LockManager,
    stats: Stats,
}

impl CharmStore {
    /// A store with default configuration.
    pub fn new(db: Arc<dyn Datastore>, blobs: Arc<dyn BlobStorage>) -> Self {
        Self::with_config(db, blobs, StoreConfig::default())
    }

    pub fn with_config(
        db: Arc<dyn Datastore>,
        blobs: Arc<dyn BlobStorage>,
        config: StoreConfig,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&db), config.lock.timeout);
        let stats = Stats::new(
            Arc::clone(&db),
            config.stats.token_cache_size,
            config.stats.counter_window,
        );
        Self {
            db,
            blobs,
            locks,
            stats,
        }
    }

    /// A fully in-memory store, mainly for tests and experiments.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryBlobStorage::new()),
        )
    }

    /// The counter engine handle.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Take the update lock over `urls` without publishing.
    pub fn lock_updates(&self, urls: &[CharmUrl]) -> Result<UpdateLock> {
        self.locks.acquire(urls)
    }

    /// Prepare a publication of `digest` to every URL in `urls`.
    ///
    /// Takes the update lock, verifies at least one alias is missing or
    /// behind the digest (otherwise [`Error::RedundantUpdate`]), and assigns
    /// the next revision across the whole set.
    pub fn publisher(&self, urls: &[CharmUrl], digest: &str) -> Result<Publisher<'_>> {
        ensure_unrevisioned("publisher", urls)?;
        if urls.is_empty() {
            return Err(Error::EmptyUrlSet { op: "publisher" });
        }

        let lock = self.locks.acquire(urls)?;
        match self.next_revision(urls, digest) {
            Ok(revision) => Ok(Publisher {
                store: self,
                urls: urls.to_vec(),
                digest: digest.to_string(),
                revision,
                lock,
            }),
            Err(err) => {
                release_or_warn(&lock);
                Err(err)
            }
        }
    }

    /// Revision the next publication should get, or
    /// [`Error::RedundantUpdate`] when every alias already carries `digest`.
    fn next_revision(&self, urls: &[CharmUrl], digest: &str) -> Result<i32> {
        let mut max_rev = -1;
        let mut all_current = true;
        for url in urls {
            match self.db.alias(&url.canonical())? {
                Some(alias) => {
                    max_rev = max_rev.max(alias.latest_revision);
                    if alias.digest != digest {
                        all_current = false;
                    }
                }
                None => all_current = false,
            }
        }
        if all_current {
            return Err(Error::RedundantUpdate);
        }
        Ok(max_rev + 1)
    }

    /// Resolve `url` to its charm record: directly when revisioned, through
    /// the alias pointer otherwise.
    pub fn info(&self, url: &CharmUrl) -> Result<CharmInfo> {
        let base = url.unrevisioned();
        let revision = match url.revision() {
            Some(revision) => revision,
            None => {
                self.db
                    .alias(&base.canonical())?
                    .ok_or(Error::NotFound)?
                    .latest_revision
            }
        };
        let record = self
            .db
            .charm(&base.canonical(), revision)?
            .ok_or(Error::NotFound)?;
        Ok(CharmInfo {
            url: base.with_revision(revision),
            revision,
            digest: record.digest,
            meta: record.meta,
            config: record.config,
            sha256: record.blob_sha256,
            size: record.blob_size,
        })
    }

    /// Like [`CharmStore::info`], plus a reader over the charm's bundle.
    pub fn open(&self, url: &CharmUrl) -> Result<(CharmInfo, Box<dyn Read + Send>)> {
        let info = self.info(url)?;
        let record = self
            .db
            .charm(&info.url.unrevisioned().canonical(), info.revision)?
            .ok_or(Error::NotFound)?;
        let reader = self
            .blobs
            .open(&record.blob_handle)?
            .ok_or_else(|| Error::Store(anyhow::anyhow!("charm blob {} is missing from storage", record.blob_handle)))?;
        Ok((info, reader))
    }

    /// The latest event recorded for `url`, optionally restricted to events
    /// carrying `digest`.
    pub fn event(&self, url: &CharmUrl, digest: Option<&str>) -> Result<Event> {
        ensure_unrevisioned("event", std::slice::from_ref(url))?;
        let events = self.db.events(&url.canonical())?;
        events
            .into_iter()
            .rev()
            .find(|event| digest.is_none_or(|d| event.digest == d))
            .ok_or(Error::NotFound)
    }
}

/// An in-flight publication: lock held, revision assigned, bundle pending.
///
/// Single-shot; [`Publisher::publish`] consumes it. Dropping an unused
/// Publisher abandons the attempt and leaves the lock to expire.
pub struct Publisher<'a> {
    store: &'a CharmStore,
    urls: Vec<CharmUrl>,
    digest: String,
    revision: i32,
    lock: UpdateLock,
}

impl std::fmt::Debug for Publisher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("urls", &self.urls)
            .field("digest", &self.digest)
            .field("revision", &self.revision)
            .field("lock", &self.lock)
            .finish()
    }
}

impl Publisher<'_> {
    /// The revision assigned at creation. Stable for this Publisher's
    /// lifetime.
    pub fn revision(&self) -> i32 {
        self.revision
    }

    /// The lock held for this publication.
    pub fn lock(&self) -> &UpdateLock {
        &self.lock
    }

    /// Stream the bundle and commit the publication to every alias.
    ///
    /// A bundler failure discards the blob and surfaces verbatim; the lock
    /// is deliberately left to expire on that path so no competing updater
    /// slips in between a failed attempt and its retry. Every other failure
    /// appends a `publish-error` event and releases the lock.
    pub fn publish(self, bundler: &mut dyn Bundler) -> Result<()> {
        let Publisher {
            store,
            urls,
            digest,
            revision,
            lock,
        } = self;
        let url_strs: Vec<String> = urls.iter().map(CharmUrl::canonical).collect();

        let blob = match capture_bundle(store, revision, bundler) {
            Ok(blob) => blob,
            Err(CaptureFailure::Bundler(err)) => {
                record_failure(store, &url_strs, revision, &digest, &err);
                return Err(err);
            }
            Err(CaptureFailure::Storage(err)) => {
                record_failure(store, &url_strs, revision, &digest, &err);
                release_or_warn(&lock);
                return Err(err);
            }
        };

        match commit(store, &url_strs, revision, &digest, bundler, &blob) {
            Ok(()) => {
                release_or_warn(&lock);
                Ok(())
            }
            Err(err) => {
                record_failure(store, &url_strs, revision, &digest, &err);
                release_or_warn(&lock);
                Err(err)
            }
        }
    }
}

enum CaptureFailure {
    Bundler(Error),
    Storage(Error),
}

/// Steps 1-3: open the blob writer and stream the bundle through it.
fn capture_bundle(
    store: &CharmStore,
    revision: i32,
    bundler: &mut dyn Bundler,
) -> Result<BlobRef, CaptureFailure> {
    let sink = store
        .blobs
        .create()
        .map_err(|err| CaptureFailure::Storage(err.into()))?;
    let mut writer = BlobWriter::new(sink);

    bundler.set_revision(revision);
    if let Err(err) = bundler.bundle_to(&mut writer) {
        if let Err(discard_err) = writer.discard() {
            tracing::warn!(error = %discard_err, "failed to discard staged blob");
        }
        return Err(CaptureFailure::Bundler(err.into()));
    }

    writer
        .finish()
        .map_err(|err| CaptureFailure::Storage(err.into()))
}

/// Steps 4-6: charm records, alias pointers, published event.
fn commit(
    store: &CharmStore,
    urls: &[String],
    revision: i32,
    digest: &str,
    bundler: &dyn Bundler,
    blob: &BlobRef,
) -> Result<()> {
    let meta = bundler.meta().clone();
    let config = bundler.config().clone();

    for url in urls {
        let record = CharmRecord {
            url: url.clone(),
            revision,
            digest: digest.to_string(),
            meta: meta.clone(),
            config: config.clone(),
            blob_sha256: blob.sha256.clone(),
            blob_size: blob.size,
            blob_handle: blob.handle.clone(),
        };
        if !store.db.insert_charm(&record)? {
            // A racing publisher committed this revision first. Siblings
            // already inserted stay; the monotonic alias upsert reconciles
            // whichever attempt wins.
            return Err(Error::UpdateConflict);
        }
    }

    for url in urls {
        store.db.set_alias_if_newer(url, revision, digest)?;
    }

    store
        .db
        .append_event(&Event::published(urls.to_vec(), revision, digest.to_string()))?;
    Ok(())
}

fn record_failure(store: &CharmStore, urls: &[String], revision: i32, digest: &str, err: &Error) {
    let event = Event::publish_error(
        urls.to_vec(),
        revision,
        digest.to_string(),
        err.to_string(),
    );
    if let Err(log_err) = store.db.append_event(&event) {
        tracing::warn!(error = %log_err, "failed to record publish-error event");
    }
}

fn release_or_warn(lock: &UpdateLock) {
    if let Err(err) = lock.release() {
        tracing::warn!(error = %err, "failed to release update lock");
    }
}
