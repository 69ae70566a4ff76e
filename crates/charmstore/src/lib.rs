//! # Charmstore
//!
//! The core of a content-addressable charm store: a publish/revision engine
//! and a usage-counter engine over a document-oriented backing store.
//!
//! Charms are versioned packages addressed by logical URLs
//! (`cs:<series>/<name>[-<revision>]`). Publication assigns gap-free
//! revisions per URL, commits the same bundle to any number of aliases
//! atomically with respect to success, and records every attempt in an
//! append-only event log. Usage counters aggregate hierarchical keys with
//! time-bucketed rollups.
//!
//! ## Publication
//!
//! The flow is **lock → assign revision → stream bundle → commit**:
//!
//! 1. [`CharmStore::publisher`] takes the advisory update lock over every
//!    requested alias, rejects redundant publications (every alias already
//!    at the supplied digest), and assigns `max(latest) + 1`.
//! 2. [`Publisher::publish`] streams the caller's [`Bundler`] through a
//!    SHA-256-counting blob writer, inserts one charm record per alias under
//!    a `(url, revision)` unique constraint, and monotonically advances the
//!    alias pointers.
//! 3. Readers ([`CharmStore::info`], [`CharmStore::open`]) never lock; an
//!    unrevisioned URL resolves through its alias pointer.
//!
//! Locks expire by timestamp: a holder gone for longer than the configured
//! timeout is taken over, and the revision-level unique constraint keeps the
//! store consistent even when two publishers race through an expired lock.
//!
//! ## Counters
//!
//! [`Stats::inc`] is lock-free: key segments become stable numeric tokens
//! (through a bounded two-generation cache), and increments merge into
//! per-bucket counter documents. [`Stats::counters`] sums exact keys or
//! prefixes, lists children of a prefix, and buckets by UTC day or week.
//!
//! ## Example
//!
//! ```
//! use charmstore::{CharmStore, CharmUrl};
//!
//! let store = CharmStore::in_memory();
//! let url = CharmUrl::parse("cs:oneiric/wordpress")?;
//! // let publisher = store.publisher(&[url], "digest")?;
//! // publisher.publish(&mut bundler)?;
//! # let _ = store.info(&url);
//! # Ok::<(), charmstore::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`url`] — Charm URL parsing and canonical rendering
//! - [`engine`] — Publish engine, read path, and event queries
//! - [`lock`] — Advisory update locks with timestamp-based takeover
//! - [`blob`] — Streaming SHA-256/size capture over blob storage
//! - [`stats`] — Counter engine with the two-generation token cache
//! - [`events`] — Append-only publication event log
//! - [`store`] — `Datastore` trait and the in-memory reference backend
//! - [`storage`] — `BlobStorage` trait with file and memory backends
//! - [`config`] — `charmstore.toml` tunables
//! - [`download`] — Disposable, cancellable HTTP fetch collaborator
//! - [`types`] — Domain types and the sentinel error set

/// Streaming SHA-256/size capture over blob storage.
pub mod blob;

/// Configuration file (`charmstore.toml`) loading.
pub mod config;

/// Disposable, cancellable HTTP fetch collaborator.
pub mod download;

/// Core publish, read, and event-query logic.
pub mod engine;

/// Append-only publication event log.
pub mod events;

/// Advisory update locks with timestamp-based takeover.
pub mod lock;

/// Counter engine with the two-generation token cache.
pub mod stats;

/// Blob storage backends with a pluggable `BlobStorage` trait.
pub mod storage;

/// `Datastore` trait and the in-memory reference backend.
pub mod store;

/// Domain types and the sentinel error set.
pub mod types;

/// Charm URL parsing and canonical rendering.
pub mod url;

pub use engine::{Bundler, CharmStore, Publisher};
pub use types::{CharmInfo, Counter, CounterRequest, Error, Result};
pub use url::CharmUrl;



/// Shared helpers for the crate's test suites.
#[cfg(test)]
mod testutil;
