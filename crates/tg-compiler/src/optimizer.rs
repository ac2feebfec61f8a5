//! Filter list optimizer: `$badfilter` cancellation and exact dedupe.
//!
//! Both passes keep the relative order of the surviving filters, so rule IDs
//! assigned afterwards still follow source order.

use std::collections::HashSet;

use tg_core::types::ResourceType;

use crate::parser::{DomainConstraint, FilterAction, FilterPattern, NetworkFilter};
use crate::rule::DomainType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub before: usize,
    pub after: usize,
    pub deduped: usize,
    pub badfilter_rules: usize,
    pub badfiltered_rules: usize,
}

pub fn optimize_filters(filters: &mut Vec<NetworkFilter>) -> OptimizeStats {
    let before = filters.len();
    let mut badfilter_keys: HashSet<FilterKey> = HashSet::new();
    let mut badfilter_rules = 0usize;

    for filter in filters.iter() {
        if filter.badfilter {
            badfilter_rules += 1;
            badfilter_keys.insert(FilterKey::from(filter));
        }
    }

    let mut badfiltered_rules = 0usize;
    filters.retain(|filter| {
        if filter.badfilter {
            return false;
        }
        if badfilter_keys.contains(&FilterKey::from(filter)) {
            badfiltered_rules += 1;
            return false;
        }
        true
    });

    let mut seen: HashSet<FilterKey> = HashSet::new();
    let mut deduped = 0usize;
    filters.retain(|filter| {
        if seen.insert(FilterKey::from(filter)) {
            true
        } else {
            deduped += 1;
            false
        }
    });

    OptimizeStats {
        before,
        after: filters.len(),
        deduped,
        badfilter_rules,
        badfiltered_rules,
    }
}

/// Everything that affects the emitted rule. Line number and the
/// badfilter flag are left out so a `$badfilter` line keys like its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    action: FilterAction,
    pattern: FilterPattern,
    important: bool,
    match_case: bool,
    document: bool,
    resource_types: ResourceType,
    domain_type: Option<DomainType>,
    domains: Option<DomainConstraint>,
}

impl From<&NetworkFilter> for FilterKey {
    fn from(filter: &NetworkFilter) -> Self {
        Self {
            action: filter.action,
            pattern: filter.pattern.clone(),
            important: filter.important,
            match_case: filter.match_case,
            document: filter.document,
            resource_types: filter.resource_types,
            domain_type: filter.domain_type,
            domains: filter.domains.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter_list;

    fn optimized(text: &str) -> (Vec<usize>, OptimizeStats) {
        let mut filters = parse_filter_list(text).network;
        let stats = optimize_filters(&mut filters);
        (filters.iter().map(|f| f.line).collect(), stats)
    }

    #[test]
    fn removes_exact_duplicates_keeping_first() {
        let (lines, stats) = optimized("||a.com^\n||b.com^\n||a.com^\n||a.com^$script");
        assert_eq!(lines, vec![1, 2, 4]);
        assert_eq!(stats.deduped, 1);
        assert_eq!(stats.before, 4);
        assert_eq!(stats.after, 3);
    }

    #[test]
    fn badfilter_cancels_matching_filter_only() {
        let (lines, stats) = optimized("||a.com^$script\n||a.com^\n||a.com^$script,badfilter");
        assert_eq!(lines, vec![2]);
        assert_eq!(stats.badfilter_rules, 1);
        assert_eq!(stats.badfiltered_rules, 1);
    }

    #[test]
    fn option_order_does_not_matter() {
        let (lines, _) = optimized("||a.com^$image,script\n||a.com^$script,image");
        assert_eq!(lines, vec![1]);
    }
}
