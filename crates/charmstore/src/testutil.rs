//! Shared helpers for the crate's test suites.

use std::io::Write;
use std::sync::Arc;

use anyhow::bail;

use crate::engine::{Bundler, CharmStore};
use crate::storage::MemoryBlobStorage;
use crate::store::{Datastore, MemoryDatastore};
use crate::types::{CharmConfig, CharmMeta, ConfigOption, Relation, Result};
use crate::url::CharmUrl;

/// An in-memory store plus a handle on its datastore for white-box checks.
pub(crate) fn store_with_db() -> (CharmStore, Arc<MemoryDatastore>) {
    let db = Arc::new(MemoryDatastore::new());
    let store = CharmStore::new(
        Arc::clone(&db) as Arc<dyn Datastore>,
        Arc::new(MemoryBlobStorage::new()),
    );
    (store, db)
}

pub(crate) fn url(s: &str) -> CharmUrl {
    CharmUrl::parse(s).expect("parse charm URL")
}

/// Publish a dummy bundle to `urls` and report the assigned revision.
pub(crate) fn publish(store: &CharmStore, urls: &[&CharmUrl], digest: &str) -> Result<i32> {
    let urls: Vec<CharmUrl> = urls.iter().map(|u| (*u).clone()).collect();
    let publisher = store.publisher(&urls, digest)?;
    let revision = publisher.revision();
    publisher.publish(&mut TestBundle::new("wordpress"))?;
    Ok(revision)
}

/// A bundler that renders `charm-revision-<n>` as its bundle bytes.
pub(crate) struct TestBundle {
    meta: CharmMeta,
    config: CharmConfig,
    revision: i32,
    fail_with: Option<String>,
}

impl TestBundle {
    pub(crate) fn new(name: &str) -> Self {
        let mut meta = CharmMeta {
            name: name.to_string(),
            summary: format!("the {name} charm"),
            description: "a test fixture".to_string(),
            ..Default::default()
        };
        meta.provides.insert(
            "website".to_string(),
            Relation {
                interface: "http".to_string(),
                optional: false,
                limit: None,
            },
        );

        let mut config = CharmConfig::default();
        config.options.insert(
            "title".to_string(),
            ConfigOption {
                option_type: "string".to_string(),
                default: Some(serde_json::json!("My Blog")),
                description: "site title".to_string(),
            },
        );

        Self {
            meta,
            config,
            revision: 0,
            fail_with: None,
        }
    }

    /// A bundler whose `bundle_to` fails with `message`.
    pub(crate) fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new("wordpress")
        }
    }
}

impl Bundler for TestBundle {
    fn meta(&self) -> &CharmMeta {
        &self.meta
    }

    fn config(&self) -> &CharmConfig {
        &self.config
    }

    fn set_revision(&mut self, revision: i32) {
        self.revision = revision;
    }

    fn bundle_to(&mut self, sink: &mut dyn Write) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_with {
            bail!("{message}");
        }
        write!(sink, "charm-revision-{}", self.revision)?;
        Ok(())
    }
}
