//! Canonical charm URL parsing and rendering.
//!
//! A charm URL has the form `cs:<series>/<name>[-<revision>]`. The revision
//! suffix is peeled greedily: a trailing `-<digits>` is always a revision,
//! never part of the name. URLs without a revision address the latest
//! published revision of the charm.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{Error, Result};

/// The schema prefix every charm URL carries.
pub const SCHEMA: &str = "cs:";

/// A parsed charm URL.
///
/// Equality and ordering consider the revision, so two URLs that differ only
/// in revision are distinct, while two unrevisioned URLs for the same charm
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharmUrl {
    series: String,
    name: String,
    revision: Option<i32>,
}

impl CharmUrl {
    /// Parse a string of the form `cs:<series>/<name>[-<revision>]`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &'static str| Error::InvalidUrl {
            url: s.to_string(),
            reason,
        };

        let rest = s
            .strip_prefix(SCHEMA)
            .ok_or_else(|| invalid("missing cs: schema"))?;
        let (series, name_rev) = rest
            .split_once('/')
            .ok_or_else(|| invalid("expected <series>/<name>"))?;
        if name_rev.contains('/') {
            return Err(invalid("expected a single series/name separator"));
        }

        let (name, revision) = split_revision(name_rev);
        let revision = match revision {
            Some(digits) => Some(
                digits
                    .parse::<i32>()
                    .map_err(|_| invalid("revision out of range"))?,
            ),
            None => None,
        };

        if !valid_series(series) {
            return Err(invalid("invalid series"));
        }
        if !valid_name(name) {
            return Err(invalid("invalid name"));
        }

        Ok(Self {
            series: series.to_string(),
            name: name.to_string(),
            revision,
        })
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pinned revision, or `None` for an unrevisioned URL.
    pub fn revision(&self) -> Option<i32> {
        self.revision
    }

    pub fn is_revisioned(&self) -> bool {
        self.revision.is_some()
    }

    /// A copy of this URL pinned to `revision`.
    pub fn with_revision(&self, revision: i32) -> Self {
        Self {
            revision: Some(revision),
            ..self.clone()
        }
    }

    /// A copy of this URL with any revision pin removed.
    pub fn unrevisioned(&self) -> Self {
        Self {
            revision: None,
            ..self.clone()
        }
    }

    /// The canonical string form, `cs:<series>/<name>[-<revision>]`.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

/// Peel a trailing `-<digits>` revision suffix off a name segment.
fn split_revision(name_rev: &str) -> (&str, Option<&str>) {
    if let Some(idx) = name_rev.rfind('-') {
        let tail = &name_rev[idx + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return (&name_rev[..idx], Some(tail));
        }
    }
    (name_rev, None)
}

/// `^[a-z][a-z0-9]*$`
fn valid_series(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// `^[a-z][a-z0-9-]*[a-z0-9]$`
fn valid_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    if !(bytes[bytes.len() - 1].is_ascii_lowercase() || bytes[bytes.len() - 1].is_ascii_digit()) {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Fail with the standard validation error if any URL carries a revision.
pub(crate) fn ensure_unrevisioned(op: &'static str, urls: &[CharmUrl]) -> Result<()> {
    for url in urls {
        if url.is_revisioned() {
            return Err(Error::RevisionedUrl {
                op,
                url: url.canonical(),
            });
        }
    }
    Ok(())
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision {
            Some(rev) => write!(f, "{}{}/{}-{}", SCHEMA, self.series, self.name, rev),
            None => write!(f, "{}{}/{}", SCHEMA, self.series, self.name),
        }
    }
}

impl FromStr for CharmUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for CharmUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for CharmUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unrevisioned_url() {
        let url = CharmUrl::parse("cs:oneiric/wordpress").expect("parse");
        assert_eq!(url.series(), "oneiric");
        assert_eq!(url.name(), "wordpress");
        assert_eq!(url.revision(), None);
        assert!(!url.is_revisioned());
    }

    #[test]
    fn parses_revisioned_url() {
        let url = CharmUrl::parse("cs:oneiric/wordpress-2").expect("parse");
        assert_eq!(url.name(), "wordpress");
        assert_eq!(url.revision(), Some(2));
    }

    #[test]
    fn revision_suffix_is_peeled_greedily() {
        // The name keeps interior dashes; only a trailing all-digit part is a
        // revision.
        let url = CharmUrl::parse("cs:precise/mysql-cluster-42").expect("parse");
        assert_eq!(url.name(), "mysql-cluster");
        assert_eq!(url.revision(), Some(42));

        let url = CharmUrl::parse("cs:oneiric/wordpress-a").expect("parse");
        assert_eq!(url.name(), "wordpress-a");
        assert_eq!(url.revision(), None);
    }

    #[test]
    fn canonical_roundtrips() {
        for s in ["cs:oneiric/wordpress", "cs:oneiric/wordpress-0", "cs:precise/mysql-cluster-7"] {
            let url = CharmUrl::parse(s).expect("parse");
            assert_eq!(url.canonical(), s);
            assert_eq!(CharmUrl::parse(&url.canonical()).expect("reparse"), url);
        }
    }

    #[test]
    fn with_revision_pins_and_unrevisioned_clears() {
        let url = CharmUrl::parse("cs:oneiric/wordpress").expect("parse");
        let pinned = url.with_revision(3);
        assert_eq!(pinned.canonical(), "cs:oneiric/wordpress-3");
        assert_eq!(pinned.unrevisioned(), url);
    }

    #[test]
    fn equality_ignores_nothing_but_matches_unrevisioned_pairs() {
        let a = CharmUrl::parse("cs:oneiric/wordpress").expect("parse");
        let b = CharmUrl::parse("cs:oneiric/wordpress").expect("parse");
        assert_eq!(a, b);
        assert_ne!(a, a.with_revision(0));
    }

    #[test]
    fn rejects_malformed_urls() {
        for s in [
            "wordpress",
            "cs:wordpress",
            "cs:oneiric/",
            "cs:oneiric/w",
            "cs:oneiric/Wordpress",
            "cs:Oneiric/wordpress",
            "cs:one-iric/wordpress",
            "cs:oneiric/word_press",
            "cs:oneiric/wordpress-",
            "cs:oneiric/wordpress/extra",
            "cs:oneiric/-wordpress",
            "cs:/wordpress",
        ] {
            let err = CharmUrl::parse(s).expect_err(s);
            assert!(matches!(err, Error::InvalidUrl { .. }), "{s}: {err}");
        }
    }

    #[test]
    fn rejects_out_of_range_revision() {
        let err = CharmUrl::parse("cs:oneiric/wordpress-99999999999999999999").expect_err("parse");
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[test]
    fn ensure_unrevisioned_flags_the_offending_url() {
        let ok = CharmUrl::parse("cs:oneiric/wordpress").expect("parse");
        let bad = ok.with_revision(1);
        assert!(ensure_unrevisioned("publisher", &[ok.clone()]).is_ok());
        let err = ensure_unrevisioned("publisher", &[ok, bad]).expect_err("revisioned");
        assert_eq!(
            err.to_string(),
            "publisher: got charm URL with revision: cs:oneiric/wordpress-1"
        );
    }

    #[test]
    fn serde_uses_canonical_string_form() {
        let url = CharmUrl::parse("cs:oneiric/wordpress-5").expect("parse");
        let json = serde_json::to_string(&url).expect("serialize");
        assert_eq!(json, "\"cs:oneiric/wordpress-5\"");
        let parsed: CharmUrl = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, url);
    }

    #[test]
    fn sorts_by_series_then_name() {
        let mut urls = vec![
            CharmUrl::parse("cs:precise/apache2").expect("parse"),
            CharmUrl::parse("cs:oneiric/wordpress").expect("parse"),
            CharmUrl::parse("cs:oneiric/mysql").expect("parse"),
        ];
        urls.sort();
        let names: Vec<String> = urls.iter().map(CharmUrl::canonical).collect();
        assert_eq!(
            names,
            ["cs:oneiric/mysql", "cs:oneiric/wordpress", "cs:precise/apache2"]
        );
    }
}
