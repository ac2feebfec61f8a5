//! Tracker Resolver
//!
//! Maps a request URL to the cataloged tracker it belongs to. Layers are
//! tried in a fixed order and the first one that matches decides:
//!
//! 1. host + path prefix
//! 2. host suffix
//! 3. path substring
//! 4. regex over `host + path`
//!
//! Requests to the same site as their origin are never trackers.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::database::PatternDatabase;
use crate::psl::PublicSuffixList;
use crate::types::{MatchLayer, TrackerMatch};
use crate::url::RequestUrl;

/// Resolves request URLs against the currently loaded [`PatternDatabase`].
///
/// Until a database is loaded every request resolves to `None`, which callers
/// must read as "unknown", not as "safe".
#[derive(Debug, Default)]
pub struct TrackerResolver {
    database: RwLock<Option<Arc<PatternDatabase>>>,
    psl: Arc<PublicSuffixList>,
}

impl TrackerResolver {
    pub fn new(database: Option<Arc<PatternDatabase>>, psl: Arc<PublicSuffixList>) -> Self {
        Self {
            database: RwLock::new(database),
            psl,
        }
    }

    pub fn with_database(database: PatternDatabase) -> Self {
        Self::new(Some(Arc::new(database)), Arc::new(PublicSuffixList::default()))
    }

    /// Swap in a new database snapshot. In-flight lookups keep the old one.
    pub fn replace_database(&self, database: Arc<PatternDatabase>) {
        if let Ok(mut current) = self.database.write() {
            *current = Some(database);
        }
    }

    /// Current database snapshot, if one has been loaded.
    pub fn database(&self) -> Option<Arc<PatternDatabase>> {
        self.database.read().ok().and_then(|db| db.clone())
    }

    pub fn psl(&self) -> &PublicSuffixList {
        &self.psl
    }

    /// Identify the tracker behind `url` when requested from `origin_hostname`.
    pub fn resolve(&self, url: &str, origin_hostname: Option<&str>) -> Option<TrackerMatch> {
        let database = self.database()?;
        let request = RequestUrl::parse(url)?;

        if let Some(origin) = origin_hostname {
            let origin = origin.trim_end_matches('.').to_ascii_lowercase();
            if origin == request.hostname || self.psl.is_same_site(&origin, &request.hostname) {
                return None;
            }
        }

        let (slot, layer) = find_slot(&database, &request)?;
        build_match(&database, slot, layer)
    }
}

fn find_slot(database: &PatternDatabase, request: &RequestUrl) -> Option<(u32, MatchLayer)> {
    let trie = database.trie();
    let visited = trie.walk(&request.hostname);

    if let Some(slot) = trie.match_host_path(&visited, &request.path) {
        return Some((slot, MatchLayer::HostPath));
    }

    if let Some(slot) = trie.match_host(&visited) {
        return Some((slot, MatchLayer::Host));
    }

    if let Some((_, slot)) = database
        .paths()
        .iter()
        .find(|(substring, _)| request.path.contains(substring.as_str()))
    {
        return Some((*slot, MatchLayer::Path));
    }

    let haystack = format!("{}{}", request.hostname, request.path);
    database
        .regexes()
        .iter()
        .find(|rule| rule.is_match(&haystack))
        .map(|rule| (rule.target(), MatchLayer::Regex))
}

fn build_match(database: &PatternDatabase, slot: u32, layer: MatchLayer) -> Option<TrackerMatch> {
    let tracker = match database.tracker_by_slot(slot) {
        Some(tracker) => tracker.clone(),
        None => {
            debug!("Pattern matched unknown tracker slot {}", slot);
            return None;
        }
    };

    let organization = tracker
        .organization
        .as_deref()
        .and_then(|id| database.organization(id))
        .cloned();

    let category_id = tracker.category.clone().or_else(|| {
        organization
            .as_ref()
            .and_then(|org| org.default_category.clone())
    });
    let category = category_id
        .as_deref()
        .and_then(|id| database.category(id))
        .cloned();

    Some(TrackerMatch {
        tracker,
        category,
        organization,
        layer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PatternDatabaseBuilder;
    use crate::types::{Category, Organization, Tracker};
    use proptest::prelude::*;

    fn tracker(id: &str) -> Tracker {
        Tracker {
            id: id.to_string(),
            name: id.to_uppercase(),
            category: None,
            organization: None,
            domains: vec![],
        }
    }

    fn resolver() -> TrackerResolver {
        let db = PatternDatabaseBuilder::new()
            .tracker(tracker("host_only"))
            .tracker(tracker("host_path"))
            .tracker(tracker("deep_host"))
            .tracker(tracker("path_only"))
            .tracker(tracker("by_regex"))
            .tracker(Tracker {
                organization: Some("acme".into()),
                ..tracker("orphan_category")
            })
            .category(Category { id: "advertising".into(), name: "Advertising".into() })
            .organization(Organization {
                id: "acme".into(),
                name: "Acme".into(),
                default_category: Some("advertising".into()),
            })
            .host("tracker.com", "host_only")
            .host_path("tracker.com", "/collect", "host_path")
            .host("deep.sub.tracker.com", "deep_host")
            .host("acme-ads.net", "orphan_category")
            .path("/beacon.js", "path_only")
            .regex(r"^metrics\.[a-z]+\.org/v\d+/", "by_regex")
            .build()
            .unwrap();
        TrackerResolver::with_database(db)
    }

    fn id_of(r: &TrackerResolver, url: &str, origin: Option<&str>) -> Option<String> {
        r.resolve(url, origin).map(|m| m.tracker.id)
    }

    #[test]
    fn layer_precedence() {
        let r = resolver();
        let m = r.resolve("https://tracker.com/collect?x=1", Some("news.site")).unwrap();
        assert_eq!((m.tracker.id.as_str(), m.layer), ("host_path", MatchLayer::HostPath));

        let m = r.resolve("https://cdn.tracker.com/lib.js", Some("news.site")).unwrap();
        assert_eq!((m.tracker.id.as_str(), m.layer), ("host_only", MatchLayer::Host));

        let m = r.resolve("https://cdn.other.com/js/beacon.js", Some("news.site")).unwrap();
        assert_eq!((m.tracker.id.as_str(), m.layer), ("path_only", MatchLayer::Path));

        let m = r.resolve("https://metrics.foo.org/v2/hit", Some("news.site")).unwrap();
        assert_eq!((m.tracker.id.as_str(), m.layer), ("by_regex", MatchLayer::Regex));

        assert_eq!(id_of(&r, "https://clean.org/index.html", Some("news.site")), None);
    }

    #[test]
    fn shallow_path_list_beats_deeper_host_terminal() {
        let r = resolver();
        assert_eq!(
            id_of(&r, "https://deep.sub.tracker.com/collect/1", Some("news.site")),
            Some("host_path".to_string())
        );
        assert_eq!(
            id_of(&r, "https://deep.sub.tracker.com/other", Some("news.site")),
            Some("deep_host".to_string())
        );
    }

    #[test]
    fn first_party_is_never_a_tracker() {
        let r = resolver();
        assert_eq!(id_of(&r, "https://tracker.com/collect", Some("tracker.com")), None);
        assert_eq!(id_of(&r, "https://cdn.tracker.com/x", Some("www.tracker.com")), None);
        assert!(id_of(&r, "https://tracker.com/collect", None).is_some());
    }

    #[test]
    fn malformed_urls_and_missing_database() {
        let r = resolver();
        assert_eq!(id_of(&r, "not a url", None), None);
        assert_eq!(id_of(&r, "", None), None);

        let empty = TrackerResolver::default();
        assert_eq!(id_of(&empty, "https://tracker.com/collect", None), None);
    }

    #[test]
    fn category_falls_back_to_organization_default() {
        let r = resolver();
        let m = r.resolve("https://acme-ads.net/p.gif", None).unwrap();
        assert_eq!(m.category.map(|c| c.id), Some("advertising".to_string()));
        assert_eq!(m.organization.map(|o| o.name), Some("Acme".to_string()));
    }

    #[test]
    fn replace_database_swaps_snapshot() {
        let r = resolver();
        let db = PatternDatabaseBuilder::new()
            .tracker(tracker("new"))
            .host("fresh.io", "new")
            .build()
            .unwrap();
        r.replace_database(Arc::new(db));
        assert_eq!(id_of(&r, "https://tracker.com/", None), None);
        assert_eq!(id_of(&r, "https://fresh.io/", None), Some("new".to_string()));
    }

    proptest! {
        #[test]
        fn inserted_host_paths_resolve(
            labels in proptest::collection::vec("[a-z][a-z0-9]{0,8}", 2..4),
            path in "[a-z]{1,10}(/[a-z0-9]{1,6}){0,2}",
        ) {
            let host = labels.join(".");
            let db = PatternDatabaseBuilder::new()
                .tracker(tracker("t"))
                .host_path(&host, &path, "t")
                .build()
                .unwrap();
            let r = TrackerResolver::with_database(db);
            let url = format!("https://{}/{}", host, path);
            prop_assert_eq!(id_of(&r, &url, Some("origin.invalid")), Some("t".to_string()));
        }
    }
}
