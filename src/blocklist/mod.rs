//! The set of blocked domains and where it is read from.
//!
//! The blocklist lives in a small JSON document shared with external editors:
//!
//! ```json
//! { "blocked_domains": ["ads.example.com", "tracker.net"] }
//! ```
//!
//! The query path goes through the [`BlocklistSource`] trait so it can read the
//! file fresh on every query (edits apply without a restart) while tests
//! substitute an in-memory set.
//!
//! ```
//! use dnsgate::blocklist::BlockedDomainSet;
//!
//! let set: BlockedDomainSet = ["Example.com.", "example.com", " Test.com"].into_iter().collect();
//! assert_eq!(set.to_vec(), vec!["example.com", "test.com"]);
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::state;

/// Unique, normalized domains. Iteration is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedDomainSet {
    domains: BTreeSet<String>,
}

impl BlockedDomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a blocklist entry: trimmed, lowercase, no trailing dot.
    /// Returns `None` when nothing is left.
    pub fn normalize_entry(domain: &str) -> Option<String> {
        let domain = domain.trim().trim_end_matches('.').trim().to_lowercase();
        (!domain.is_empty()).then_some(domain)
    }

    /// Insert a domain, returning `true` if it was not present.
    pub fn insert(&mut self, domain: &str) -> bool {
        match Self::normalize_entry(domain) {
            Some(domain) => self.domains.insert(domain),
            None => false,
        }
    }

    /// Remove a domain, returning `true` if it was present.
    pub fn remove(&mut self, domain: &str) -> bool {
        match Self::normalize_entry(domain) {
            Some(domain) => self.domains.remove(&domain),
            None => false,
        }
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.domains.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for BlockedDomainSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for domain in iter {
            set.insert(domain.as_ref());
        }
        set
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlocklistDocument {
    #[serde(default)]
    blocked_domains: Vec<String>,
}

/// Load the blocklist file. Missing or corrupt content yields an empty set.
pub fn load_domains(path: &Path) -> BlockedDomainSet {
    state::read_json::<BlocklistDocument>(path)
        .map(|doc| doc.blocked_domains.into_iter().collect())
        .unwrap_or_default()
}

/// Replace the blocklist file with the sorted, deduplicated, lowercase form of `domains`.
pub fn save_domains<I, S>(path: &Path, domains: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BlockedDomainSet = domains.into_iter().collect();
    let doc = BlocklistDocument {
        blocked_domains: set.to_vec(),
    };
    state::write_json(path, &doc)?;
    Ok(())
}

/// Source of the current blocklist, consulted once per query.
pub trait BlocklistSource: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = BlockedDomainSet> + Send;
}

/// Reads the blocklist file on every call so edits apply immediately.
#[derive(Debug, Clone)]
pub struct FileBlocklist {
    path: PathBuf,
}

impl FileBlocklist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlocklistSource for FileBlocklist {
    async fn load(&self) -> BlockedDomainSet {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = ?self.path, "blocklist not readable: {err}");
                return BlockedDomainSet::new();
            }
        };

        // a write landing mid-read shows up as invalid JSON: treat as empty
        match serde_json::from_slice::<BlocklistDocument>(&bytes) {
            Ok(doc) => doc.blocked_domains.into_iter().collect(),
            Err(err) => {
                debug!(path = ?self.path, "blocklist not parseable: {err}");
                BlockedDomainSet::new()
            }
        }
    }
}

/// In-memory blocklist shared between handles.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlocklist {
    inner: Arc<RwLock<BlockedDomainSet>>,
}

impl MemoryBlocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            inner: Arc::new(RwLock::new(domains.into_iter().collect())),
        }
    }

    pub fn insert(&self, domain: &str) -> bool {
        self.inner.write().insert(domain)
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.inner.write().remove(domain)
    }
}

impl BlocklistSource for MemoryBlocklist {
    async fn load(&self) -> BlockedDomainSet {
        self.inner.read().clone()
    }
}

/// Operator-facing edits of the blocklist file.
#[derive(Debug, Clone)]
pub struct DomainStore {
    path: PathBuf,
}

impl DomainStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn list(&self) -> BlockedDomainSet {
        load_domains(&self.path)
    }

    /// Add a domain. Returns `false` when it was empty or already present.
    pub fn add(&self, domain: &str) -> Result<bool> {
        let mut set = self.list();
        if !set.insert(domain) {
            return Ok(false);
        }
        save_domains(&self.path, set.iter())?;
        info!(domain = %domain.trim().to_lowercase(), "domain added to blocklist");
        Ok(true)
    }

    /// Remove a domain. Removal weakens blocking, so it needs an authorized operator.
    pub fn remove(&self, domain: &str, authorized: bool) -> Result<bool> {
        if !authorized {
            return Err(Error::AuthorizationDenied);
        }
        let mut set = self.list();
        if !set.remove(domain) {
            return Ok(false);
        }
        save_domains(&self.path, set.iter())?;
        info!(domain = %domain.trim().to_lowercase(), "domain removed from blocklist");
        Ok(true)
    }
}
