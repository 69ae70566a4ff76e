//! Append-only publication event log.
//!
//! Every publish attempt leaves a trace in the `events` collection: a
//! `published` event on success, a `publish-error` event when the attempt
//! failed after taking the lock. Events are never rewritten; the latest event
//! for a URL answers "what happened last time someone touched this charm".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a publication event.
///
/// Wire form is the lowercase-and-dash identifier (`published`,
/// `publish-error`); new kinds must follow the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Published,
    PublishError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Published => "published",
            EventKind::PublishError => "publish-error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Canonical unrevisioned URLs the attempt covered.
    pub urls: Vec<String>,
    pub revision: i32,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub time: DateTime<Utc>,
}

impl Event {
    /// A successful publication of `urls` at `revision`.
    pub fn published(urls: Vec<String>, revision: i32, digest: String) -> Self {
        Self {
            kind: EventKind::Published,
            urls,
            revision,
            digest,
            errors: Vec::new(),
            warnings: Vec::new(),
            time: Utc::now(),
        }
    }

    /// A failed publication attempt with the error it surfaced.
    pub fn publish_error(urls: Vec<String>, revision: i32, digest: String, error: String) -> Self {
        Self {
            kind: EventKind::PublishError,
            urls,
            revision,
            digest,
            errors: vec![error],
            warnings: Vec::new(),
            time: Utc::now(),
        }
    }
}
