//! Core domain types for the charm store: records, metadata, counters, and errors.
//!
//! This module defines the persisted document shapes (charm records, alias
//! pointers) and the request/response types of the counter engine. Everything
//! persisted derives `Serialize`/`Deserialize` from `serde`; maps use
//! `BTreeMap` so serialized documents are deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::url::CharmUrl;

/// Crate-wide result alias over the sentinel [`Error`] set.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Sentinel error set surfaced by the store engines.
///
/// Callers match on the variant to decide whether to retry
/// ([`Error::UpdateConflict`]), stop ([`Error::RedundantUpdate`]), or treat
/// the failure as terminal. Transport and IO faults from the backing store
/// are wrapped opaquely in [`Error::Store`].
#[derive(Debug, Error)]
pub enum Error {
    /// No charm record, alias, or event exists for the requested key.
    #[error("entry not found")]
    NotFound,

    /// Another updater holds the lock, or a revision race was lost.
    #[error("charm update already in progress")]
    UpdateConflict,

    /// Every requested alias already carries the supplied digest.
    #[error("charm is up-to-date")]
    RedundantUpdate,

    /// The input string does not match the charm URL grammar.
    #[error("invalid charm URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    /// An operation that requires unrevisioned URLs was given a revisioned one.
    #[error("{op}: got charm URL with revision: {url}")]
    RevisionedUrl { op: &'static str, url: String },

    /// An operation that requires at least one URL was given none.
    #[error("{op}: no charm URLs given")]
    EmptyUrlSet { op: &'static str },

    /// Counter keys must carry at least one segment.
    #[error("counter key must not be empty")]
    EmptyCounterKey,

    /// Opaque transport/IO fault from the backing store or blob storage.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One endpoint of a charm relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub interface: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Parsed charm metadata as supplied by the bundler.
///
/// The relation maps may be empty but are always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmMeta {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub provides: BTreeMap<String, Relation>,
    #[serde(default)]
    pub requires: BTreeMap<String, Relation>,
    #[serde(default)]
    pub peers: BTreeMap<String, Relation>,
}

/// A single entry in a charm's configuration schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(rename = "type")]
    pub option_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// Charm configuration schema: option name to its declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharmConfig {
    #[serde(default)]
    pub options: BTreeMap<String, ConfigOption>,
}

/// One published revision of a charm, as stored in the `charms` collection.
///
/// Keyed by `(url, revision)`; `url` is the canonical unrevisioned form.
/// `blob_sha256` and `blob_size` reflect exactly the bytes committed to the
/// blob identified by `blob_handle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmRecord {
    pub url: String,
    pub revision: i32,
    pub digest: String,
    pub meta: CharmMeta,
    pub config: CharmConfig,
    pub blob_sha256: String,
    pub blob_size: u64,
    pub blob_handle: String,
}

/// Latest-revision pointer for an unrevisioned URL, stored in `aliases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasPointer {
    pub latest_revision: i32,
    pub digest: String,
}

/// Resolved view of a single charm revision returned by the read path.
#[derive(Debug, Clone, PartialEq)]
pub struct CharmInfo {
    /// The revisioned URL this info describes.
    pub url: CharmUrl,
    pub revision: i32,
    pub digest: String,
    pub meta: CharmMeta,
    pub config: CharmConfig,
    pub sha256: String,
    pub size: u64,
}

/// Time bucketing for counter aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum By {
    /// No bucketing: one aggregate over the whole time range.
    #[default]
    None,
    /// Bucket by UTC day (00:00).
    Day,
    /// Bucket by week, starting Sunday 00:00 UTC.
    Week,
}

/// A counter aggregation query.
///
/// `start` is inclusive and `stop` exclusive when present.
#[derive(Debug, Clone, Default)]
pub struct CounterRequest {
    pub key: Vec<String>,
    pub prefix: bool,
    pub list: bool,
    pub by: By,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

/// One aggregated counter row.
///
/// `prefix` distinguishes a subtree total (`true`) from an exact-key total.
/// `time` carries the bucket start when the query asked for bucketing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub key: Vec<String>,
    pub prefix: bool,
    pub count: u64,
    pub time: Option<DateTime<Utc>>,
}
