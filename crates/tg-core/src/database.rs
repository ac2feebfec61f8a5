//! Pattern Database
//!
//! Immutable catalog of tracker patterns. Every pattern layer maps to a slot
//! in the tracker table; slots are assigned while building, so a pattern can
//! only ever point at a tracker that exists. Patterns that reference unknown
//! tracker ids are dropped at build time with a warning.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;

use crate::trie::HostTrie;
use crate::types::{Category, Organization, Tracker};

/// Error type for database loading.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Invalid database JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported database version: {0}")]
    UnsupportedVersion(u32),
    #[error("Duplicate tracker id: {0}")]
    DuplicateTracker(String),
}

/// Highest database format version this build understands.
pub const DATABASE_FORMAT_VERSION: u32 = 1;

// =============================================================================
// Regex Layer
// =============================================================================

/// A regex pattern, compiled on first use.
#[derive(Debug)]
pub struct RegexRule {
    pattern: String,
    target: u32,
    compiled: OnceLock<Option<Regex>>,
}

impl RegexRule {
    fn new(pattern: String, target: u32) -> Self {
        Self {
            pattern,
            target,
            compiled: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Compiled form; an invalid pattern is memoized as `None`.
    pub fn compiled(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Regex::new(&self.pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Ignoring invalid tracker regex '{}': {}", self.pattern, e);
                    None
                }
            })
            .as_ref()
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.compiled().is_some_and(|re| re.is_match(haystack))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Immutable tracker pattern catalog.
#[derive(Debug, Default)]
pub struct PatternDatabase {
    version: u32,
    trie: HostTrie,
    paths: Vec<(String, u32)>,
    regexes: Vec<RegexRule>,
    trackers: Vec<Tracker>,
    tracker_slots: HashMap<String, u32>,
    categories: HashMap<String, Category>,
    organizations: HashMap<String, Organization>,
}

impl PatternDatabase {
    /// Load from the JSON source format.
    pub fn from_json(json: &str) -> Result<Self, DatabaseError> {
        let source: DatabaseSource = serde_json::from_str(json)?;
        source.build()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn trie(&self) -> &HostTrie {
        &self.trie
    }

    /// Path-only substring table, in registration order.
    pub fn paths(&self) -> &[(String, u32)] {
        &self.paths
    }

    pub fn regexes(&self) -> &[RegexRule] {
        &self.regexes
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn trackers(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter()
    }

    pub fn tracker_by_slot(&self, slot: u32) -> Option<&Tracker> {
        self.trackers.get(slot as usize)
    }

    pub fn tracker(&self, id: &str) -> Option<&Tracker> {
        self.tracker_slots.get(id).and_then(|&slot| self.tracker_by_slot(slot))
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.get(id)
    }

    pub fn organization(&self, id: &str) -> Option<&Organization> {
        self.organizations.get(id)
    }

    /// Compile every regex now and return the patterns that failed.
    pub fn invalid_regexes(&self) -> Vec<&str> {
        self.regexes
            .iter()
            .filter(|rule| rule.compiled().is_none())
            .map(|rule| rule.pattern())
            .collect()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Incremental construction of a [`PatternDatabase`].
///
/// Trackers may be added before or after the patterns that reference them;
/// unresolved references are reported and dropped in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct PatternDatabaseBuilder {
    version: u32,
    hosts: Vec<(String, String)>,
    host_paths: Vec<(String, String, String)>,
    paths: Vec<(String, String)>,
    regexes: Vec<(String, String)>,
    trackers: Vec<Tracker>,
    categories: Vec<Category>,
    organizations: Vec<Organization>,
}

impl PatternDatabaseBuilder {
    pub fn new() -> Self {
        Self {
            version: DATABASE_FORMAT_VERSION,
            ..Self::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn tracker(mut self, tracker: Tracker) -> Self {
        self.trackers.push(tracker);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.push(category);
        self
    }

    pub fn organization(mut self, organization: Organization) -> Self {
        self.organizations.push(organization);
        self
    }

    pub fn host(mut self, host: &str, tracker_id: &str) -> Self {
        self.hosts.push((host.to_string(), tracker_id.to_string()));
        self
    }

    pub fn host_path(mut self, host: &str, path: &str, tracker_id: &str) -> Self {
        self.host_paths
            .push((host.to_string(), path.to_string(), tracker_id.to_string()));
        self
    }

    pub fn path(mut self, substring: &str, tracker_id: &str) -> Self {
        self.paths.push((substring.to_string(), tracker_id.to_string()));
        self
    }

    pub fn regex(mut self, pattern: &str, tracker_id: &str) -> Self {
        self.regexes.push((pattern.to_string(), tracker_id.to_string()));
        self
    }

    pub fn build(self) -> Result<PatternDatabase, DatabaseError> {
        if self.version > DATABASE_FORMAT_VERSION {
            return Err(DatabaseError::UnsupportedVersion(self.version));
        }

        let mut tracker_slots = HashMap::with_capacity(self.trackers.len());
        for (slot, tracker) in self.trackers.iter().enumerate() {
            if tracker_slots.insert(tracker.id.clone(), slot as u32).is_some() {
                return Err(DatabaseError::DuplicateTracker(tracker.id.clone()));
            }
        }

        let resolve = |kind: &str, pattern: &str, id: &str| -> Option<u32> {
            let slot = tracker_slots.get(id).copied();
            if slot.is_none() {
                warn!("Dropping {} pattern '{}': unknown tracker '{}'", kind, pattern, id);
            }
            slot
        };

        let mut trie = HostTrie::new();
        for (host, id) in &self.hosts {
            let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
            if let Some(slot) = resolve("host", &host, id) {
                trie.insert_host(&host, slot);
            }
        }
        for (host, path, id) in &self.host_paths {
            let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
            if let Some(slot) = resolve("host+path", &host, id) {
                trie.insert_host_path(&host, &path.to_ascii_lowercase(), slot);
            }
        }

        let paths = self
            .paths
            .iter()
            .filter_map(|(substring, id)| {
                let slot = resolve("path", substring, id)?;
                Some((substring.to_ascii_lowercase(), slot))
            })
            .collect();

        let regexes = self
            .regexes
            .into_iter()
            .filter_map(|(pattern, id)| {
                let slot = resolve("regex", &pattern, &id)?;
                Some(RegexRule::new(pattern, slot))
            })
            .collect();

        let database = PatternDatabase {
            version: self.version,
            trie,
            paths,
            regexes,
            trackers: self.trackers,
            tracker_slots,
            categories: self
                .categories
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
            organizations: self
                .organizations
                .into_iter()
                .map(|o| (o.id.clone(), o))
                .collect(),
        };

        debug!(
            "Built pattern database v{}: {} trackers, {} trie nodes, {} paths, {} regexes",
            database.version,
            database.trackers.len(),
            database.trie.node_count(),
            database.paths.len(),
            database.regexes.len()
        );

        Ok(database)
    }
}

// =============================================================================
// JSON Source Format
// =============================================================================

#[derive(Debug, Deserialize)]
struct TrackerSource {
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CategorySource {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OrganizationSource {
    name: String,
    #[serde(default)]
    default_category: Option<String>,
}

/// On-disk layout. Maps are `BTreeMap` so that building is deterministic.
#[derive(Debug, Deserialize)]
struct DatabaseSource {
    version: u32,
    #[serde(default)]
    hosts: BTreeMap<String, String>,
    #[serde(default)]
    host_paths: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    paths: Vec<(String, String)>,
    #[serde(default)]
    regexes: Vec<(String, String)>,
    #[serde(default)]
    trackers: BTreeMap<String, TrackerSource>,
    #[serde(default)]
    categories: BTreeMap<String, CategorySource>,
    #[serde(default)]
    organizations: BTreeMap<String, OrganizationSource>,
}

impl DatabaseSource {
    fn build(self) -> Result<PatternDatabase, DatabaseError> {
        let mut builder = PatternDatabaseBuilder::new().version(self.version);

        for (id, t) in self.trackers {
            builder = builder.tracker(Tracker {
                id,
                name: t.name,
                category: t.category,
                organization: t.organization,
                domains: t.domains,
            });
        }
        for (id, c) in self.categories {
            builder = builder.category(Category { id, name: c.name });
        }
        for (id, o) in self.organizations {
            builder = builder.organization(Organization {
                id,
                name: o.name,
                default_category: o.default_category,
            });
        }
        for (host, id) in &self.hosts {
            builder = builder.host(host, id);
        }
        for (host, paths) in &self.host_paths {
            for (path, id) in paths {
                builder = builder.host_path(host, path, id);
            }
        }
        for (substring, id) in &self.paths {
            builder = builder.path(substring, id);
        }
        for (pattern, id) in &self.regexes {
            builder = builder.regex(pattern, id);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": 1,
        "hosts": { "doubleclick.net": "doubleclick", "ghost.example": "ghost" },
        "host_paths": { "facebook.com": { "tr": "facebook_pixel" } },
        "paths": [["/piwik.js", "matomo"]],
        "regexes": [["^stats\\.[a-z]+\\.com/collect", "matomo"], ["(unclosed", "matomo"]],
        "trackers": {
            "doubleclick": { "name": "DoubleClick", "organization": "google", "domains": ["doubleclick.net"] },
            "facebook_pixel": { "name": "Facebook Pixel", "category": "advertising" },
            "matomo": { "name": "Matomo", "category": "site_analytics" }
        },
        "categories": {
            "advertising": { "name": "Advertising" },
            "site_analytics": { "name": "Site Analytics" }
        },
        "organizations": {
            "google": { "name": "Google", "default_category": "advertising" }
        }
    }"#;

    #[test]
    fn loads_json_source() {
        let db = PatternDatabase::from_json(SAMPLE).expect("database should load");
        assert_eq!(db.version(), 1);
        assert_eq!(db.tracker_count(), 3);
        assert_eq!(db.paths().len(), 1);
        assert_eq!(db.regexes().len(), 2);
        assert_eq!(db.tracker("doubleclick").map(|t| t.name.as_str()), Some("DoubleClick"));
        assert_eq!(db.organization("google").and_then(|o| o.default_category.as_deref()), Some("advertising"));
    }

    #[test]
    fn unknown_tracker_patterns_are_dropped() {
        let db = PatternDatabase::from_json(SAMPLE).unwrap();
        // "ghost.example" points at a tracker that is not in the catalog
        assert!(db.trie().walk("ghost.example").is_empty());
    }

    #[test]
    fn invalid_regex_is_memoized_as_no_match() {
        let db = PatternDatabase::from_json(SAMPLE).unwrap();
        assert_eq!(db.invalid_regexes(), vec!["(unclosed"]);
        assert!(!db.regexes()[1].is_match("(unclosed"));
        assert!(db.regexes()[0].is_match("stats.site.com/collect?x"));
    }

    #[test]
    fn rejects_newer_versions() {
        let err = PatternDatabaseBuilder::new().version(99).build().unwrap_err();
        assert!(matches!(err, DatabaseError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_duplicate_trackers() {
        let tracker = Tracker {
            id: "a".into(),
            name: "A".into(),
            category: None,
            organization: None,
            domains: vec![],
        };
        let err = PatternDatabaseBuilder::new()
            .tracker(tracker.clone())
            .tracker(tracker)
            .build()
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateTracker(id) if id == "a"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            PatternDatabase::from_json("{ not json"),
            Err(DatabaseError::Json(_))
        ));
    }
}
