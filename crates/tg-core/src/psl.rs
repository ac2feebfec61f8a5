//! Public Suffix List (PSL) utilities for eTLD+1 extraction
//!
//! A [`PublicSuffixList`] is loaded from the standard `public_suffix_list.dat`
//! text. Without any rules it falls back to a small heuristic that knows the
//! common two-part TLDs.
//!
//! # Examples
//!
//! ```
//! use tg_core::psl::PublicSuffixList;
//!
//! let psl = PublicSuffixList::default();
//! assert_eq!(psl.get_etld1("sub.example.com"), "example.com");
//! assert_eq!(psl.get_etld1("sub.example.co.uk"), "example.co.uk");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::url::is_ip_literal;

/// Entries kept before the memo is flushed.
const MEMO_CAPACITY: usize = 4096;

/// Two-part suffixes the heuristic knows about when no list is loaded.
const FALLBACK_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "gov.uk", "ac.uk",
    "co.jp", "ne.jp", "or.jp", "ac.jp",
    "co.nz", "net.nz", "co.za", "co.in", "co.kr",
    "com.au", "net.au", "org.au", "gov.au",
    "com.br", "com.cn", "com.mx", "com.tw", "com.hk",
];

// =============================================================================
// Rules
// =============================================================================

/// Parsed PSL rules, each stored without its `*.` or `!` marker.
#[derive(Debug, Default)]
struct SuffixRules {
    plain: HashSet<String>,
    wildcard: HashSet<String>,
    exception: HashSet<String>,
}

impl SuffixRules {
    fn parse(text: &str) -> Self {
        let mut rules = Self::default();
        for rule in text.lines().filter_map(|line| line.split_whitespace().next()) {
            if rule.starts_with("//") {
                continue;
            }
            let rule = rule.to_ascii_lowercase();
            if let Some(name) = rule.strip_prefix('!') {
                rules.exception.insert(name.to_string());
            } else if let Some(name) = rule.strip_prefix("*.") {
                rules.wildcard.insert(name.to_string());
            } else {
                rules.plain.insert(rule);
            }
        }
        rules
    }

    fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.wildcard.is_empty() && self.exception.is_empty()
    }

    /// Number of labels in the public suffix of `labels` (left to right).
    fn suffix_len(&self, labels: &[&str]) -> usize {
        let n = labels.len();
        for start in 0..n {
            let suffix = labels[start..].join(".");
            if self.exception.contains(&suffix) {
                // "!www.ck": the suffix is everything after the first label
                return n - start - 1;
            }
            let under_wildcard = start + 1 < n && self.wildcard.contains(&labels[start + 1..].join("."));
            if under_wildcard || self.plain.contains(&suffix) {
                return n - start;
            }
        }
        // Implicit "*" rule
        1
    }
}

// =============================================================================
// Public Suffix List
// =============================================================================

/// Public suffix list with a memoizing eTLD+1 lookup.
pub struct PublicSuffixList {
    rules: SuffixRules,
    memo: Mutex<HashMap<String, String>>,
}

impl Default for PublicSuffixList {
    fn default() -> Self {
        Self::with_rules(SuffixRules::default())
    }
}

impl std::fmt::Debug for PublicSuffixList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicSuffixList")
            .field("plain", &self.rules.plain.len())
            .field("wildcard", &self.rules.wildcard.len())
            .field("exception", &self.rules.exception.len())
            .finish()
    }
}

impl PublicSuffixList {
    fn with_rules(rules: SuffixRules) -> Self {
        Self {
            rules,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Parse the `public_suffix_list.dat` text format.
    pub fn from_text(text: &str) -> Self {
        Self::with_rules(SuffixRules::parse(text))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.plain.len() + self.rules.wildcard.len() + self.rules.exception.len()
    }

    /// Registrable domain of `host`. IP literals and single labels are
    /// returned as they are.
    pub fn get_etld1(&self, host: &str) -> String {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = memo.get(&host) {
            return hit.clone();
        }

        let etld1 = self.registrable_domain(&host);
        if memo.len() >= MEMO_CAPACITY {
            memo.clear();
        }
        memo.insert(host, etld1.clone());
        etld1
    }

    fn registrable_domain(&self, host: &str) -> String {
        if is_ip_literal(host) {
            return host.to_string();
        }

        let labels: Vec<&str> = host.split('.').collect();
        let suffix_len = if self.rules.is_empty() {
            fallback_suffix_len(&labels)
        } else {
            self.rules.suffix_len(&labels)
        };

        // One label more than the suffix, or the whole host when it is
        // itself a public suffix
        let keep = (suffix_len + 1).min(labels.len());
        labels[labels.len() - keep..].join(".")
    }

    /// Check if two hosts share the same eTLD+1.
    pub fn is_same_site(&self, host1: &str, host2: &str) -> bool {
        self.get_etld1(host1) == self.get_etld1(host2)
    }
}

fn fallback_suffix_len(labels: &[&str]) -> usize {
    match labels {
        [.., second, last] if FALLBACK_SUFFIXES.contains(&format!("{second}.{last}").as_str()) => 2,
        _ => 1,
    }
}

/// Get the parent domain (strip leftmost label).
pub fn get_parent_domain(host: &str) -> Option<&str> {
    match host.find('.') {
        Some(idx) if idx < host.len() - 1 => Some(&host[idx + 1..]),
        _ => None,
    }
}

/// `host` followed by each of its parent domains.
pub fn host_suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(host), |h| get_parent_domain(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSL_SAMPLE: &str = "\
// comment line
com
uk
co.uk
*.ck
!www.ck
github.io
";

    #[test]
    fn heuristic_without_rules() {
        let psl = PublicSuffixList::default();
        assert_eq!(psl.get_etld1("example.com"), "example.com");
        assert_eq!(psl.get_etld1("a.b.example.com."), "example.com");
        assert_eq!(psl.get_etld1("sub.example.co.uk"), "example.co.uk");
        assert_eq!(psl.get_etld1("co.uk"), "co.uk");
        assert_eq!(psl.get_etld1("localhost"), "localhost");
    }

    #[test]
    fn test_get_parent_domain() {
        assert_eq!(get_parent_domain("sub.example.com"), Some("example.com"));
        assert_eq!(get_parent_domain("example.com"), Some("com"));
        assert_eq!(get_parent_domain("com"), None);
        assert_eq!(get_parent_domain(""), None);
        assert_eq!(
            host_suffixes("a.b.example.com").collect::<Vec<_>>(),
            vec!["a.b.example.com", "b.example.com", "example.com", "com"]
        );
    }

    #[test]
    fn loaded_rules() {
        let psl = PublicSuffixList::from_text(PSL_SAMPLE);
        assert_eq!(psl.rule_count(), 6);
        assert_eq!(psl.get_etld1("a.b.example.co.uk"), "example.co.uk");
        assert_eq!(psl.get_etld1("user.github.io"), "user.github.io");
        assert_eq!(psl.get_etld1("x.site.ck"), "x.site.ck");
        assert_eq!(psl.get_etld1("a.www.ck"), "www.ck");
        assert_eq!(psl.get_etld1("a.example.org"), "example.org");
    }

    #[test]
    fn ip_literal_is_its_own_site() {
        let psl = PublicSuffixList::default();
        assert_eq!(psl.get_etld1("192.168.1.10"), "192.168.1.10");
        assert!(!psl.is_same_site("192.168.1.10", "192.168.1.11"));
    }

    #[test]
    fn memo_is_flushed_when_full() {
        let psl = PublicSuffixList::default();
        for i in 0..MEMO_CAPACITY + 10 {
            psl.get_etld1(&format!("h{i}.example.com"));
        }
        let memo = psl.memo.lock().unwrap();
        assert!(memo.len() <= MEMO_CAPACITY);
    }
}
