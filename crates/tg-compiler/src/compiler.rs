//! Rule Compiler
//!
//! Turns a [`PolicyState`] into the full set of host rules it implies. The
//! output depends only on the state, the pattern database and `now`:
//! identical inputs serialize to identical bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tg_core::policy::{ExceptionStatus, PolicyState, Timestamp};
use tg_core::types::ResourceType;
use tg_core::url::is_hostname;
use tg_core::PatternDatabase;

use crate::optimizer::optimize_filters;
use crate::origin::{priority, IdAllocator, Origin, RulesetId};
use crate::parser::{parse_filter_list, CustomFilterError, FilterAction, FilterPattern, NetworkFilter};
use crate::reconcile::DesiredState;
use crate::rule::{ActionType, Rule, RuleCondition};

// =============================================================================
// Output
// =============================================================================

/// Non-fatal problems found while compiling. Reported next to the rules.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CompileIssue {
    #[error("{origin} ID range exhausted, {dropped} rules dropped")]
    RangeExhausted { origin: Origin, dropped: usize },

    #[error("exception key `{key}` is neither a known tracker nor a hostname")]
    UnknownException { key: String },

    #[error("custom filter {0}")]
    CustomFilter(CustomFilterError),

    #[error("{ruleset} rule {id} is outside the {ruleset} ID range")]
    StaticIdOutOfRange { ruleset: RulesetId, id: u32 },

    #[error("{ruleset} rule {id} has priority {priority}, above the baseline band")]
    StaticPriorityTooHigh { ruleset: RulesetId, id: u32, priority: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledRules {
    pub by_origin: BTreeMap<Origin, Vec<Rule>>,
    pub enabled_rulesets: BTreeSet<RulesetId>,
    /// Cosmetic custom filter lines, for the content-script side
    pub cosmetic_filters: Vec<String>,
    pub issues: Vec<CompileIssue>,
}

impl CompiledRules {
    pub fn rules(&self, origin: Origin) -> &[Rule] {
        self.by_origin.get(&origin).map(Vec::as_slice).unwrap_or_default()
    }

    /// All dynamic rules, grouped by origin in range order.
    pub fn dynamic_rules(&self) -> Vec<Rule> {
        self.by_origin
            .iter()
            .filter(|(origin, _)| origin.is_dynamic())
            .flat_map(|(_, rules)| rules.iter().cloned())
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.by_origin.values().map(Vec::len).sum()
    }

    /// Combine with the interceptor's session rules into a reconcile target.
    pub fn into_desired(self, session_rules: Vec<Rule>) -> DesiredState {
        DesiredState {
            dynamic_rules: self.dynamic_rules(),
            enabled_rulesets: self.enabled_rulesets,
            session_rules,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles policy state into host rules.
///
/// The pattern database is only consulted to expand tracker-keyed
/// exceptions into the tracker's domains.
#[derive(Debug, Clone, Default)]
pub struct RuleCompiler {
    database: Option<Arc<PatternDatabase>>,
}

impl RuleCompiler {
    pub fn new(database: Option<Arc<PatternDatabase>>) -> Self {
        Self { database }
    }

    pub fn compile(&self, state: &PolicyState, now: Timestamp) -> CompiledRules {
        let mut out = CompiledRules {
            enabled_rulesets: enabled_rulesets(state, now),
            ..CompiledRules::default()
        };

        compile_pauses(state, now, &mut out);

        // A global pause turns off every blocking source
        if !state.is_globally_paused(now) {
            self.compile_exceptions(state, &mut out);
            compile_custom_filters(state, &mut out);
        }

        compile_redirect_protection(state, &mut out);

        debug!(
            "Compiled {} rules across {} origins ({} rulesets, {} issues)",
            out.rule_count(),
            out.by_origin.len(),
            out.enabled_rulesets.len(),
            out.issues.len()
        );

        out
    }

    fn compile_exceptions(&self, state: &PolicyState, out: &mut CompiledRules) {
        let mut rules = OriginRules::new(Origin::Exceptions);

        for (key, entry) in &state.exceptions {
            let Some(domains) = self.exception_domains(key) else {
                out.issues.push(CompileIssue::UnknownException { key: key.clone() });
                continue;
            };

            if let Some(status) = entry.global {
                rules.push(
                    priority::EXCEPTION_GLOBAL,
                    exception_action(status),
                    RuleCondition::default().with_request_domains(domains.clone()),
                );
            }

            for (site, status) in &entry.sites {
                rules.push(
                    priority::EXCEPTION_SITE,
                    exception_action(*status),
                    RuleCondition::default()
                        .with_request_domains(domains.clone())
                        .with_initiator_domains(vec![site.clone()]),
                );
            }
        }

        rules.finish(out);
    }

    /// Domains an exception key expands to.
    fn exception_domains(&self, key: &str) -> Option<Vec<String>> {
        let tracker = self.database.as_ref().and_then(|db| db.tracker(key));
        if let Some(tracker) = tracker.filter(|t| !t.domains.is_empty()) {
            let domains: BTreeSet<String> = tracker
                .domains
                .iter()
                .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
                .collect();
            return Some(domains.into_iter().collect());
        }

        let host = key.trim_end_matches('.').to_ascii_lowercase();
        is_hostname(&host).then(|| vec![host])
    }
}

/// Static groups to enable: the selected categories plus fixes, or nothing
/// while a global pause is active.
pub fn enabled_rulesets(state: &PolicyState, now: Timestamp) -> BTreeSet<RulesetId> {
    let mut enabled = BTreeSet::new();
    if state.is_globally_paused(now) {
        return enabled;
    }

    let blocking = &state.blocking;
    for (selected, id) in [
        (blocking.ads, RulesetId::Ads),
        (blocking.tracking, RulesetId::Tracking),
        (blocking.annoyances, RulesetId::Annoyances),
    ] {
        if selected {
            enabled.insert(id);
        }
    }

    if !enabled.is_empty() {
        enabled.insert(RulesetId::Fixes);
    }
    enabled
}

fn compile_pauses(state: &PolicyState, now: Timestamp, out: &mut CompiledRules) {
    let mut rules = OriginRules::new(Origin::Pause);

    for host in state.active_pauses(now) {
        let Some(first) = rules.ids.next_block(2) else {
            rules.dropped += 2;
            continue;
        };
        rules.rules.push(Rule::new(
            first,
            priority::PAUSE,
            ActionType::Allow,
            RuleCondition::default()
                .with_initiator_domains(vec![host.to_string()])
                .with_resource_types(ResourceType::ALL),
        ));
        rules.rules.push(Rule::new(
            first + 1,
            priority::PAUSE,
            ActionType::AllowAllRequests,
            RuleCondition::default()
                .with_request_domains(vec![host.to_string()])
                .with_resource_types(ResourceType::DOCUMENT),
        ));
    }

    rules.finish(out);
}

fn compile_custom_filters(state: &PolicyState, out: &mut CompiledRules) {
    let filters = &state.custom_filters;
    if !filters.enabled || filters.text.trim().is_empty() {
        return;
    }

    let mut parsed = parse_filter_list(&filters.text);
    let stats = optimize_filters(&mut parsed.network);
    debug!(
        "Custom filters: {} parsed, {} kept, {} duplicates, {} badfiltered, {} errors",
        stats.before,
        stats.after,
        stats.deduped,
        stats.badfiltered_rules,
        parsed.errors.len()
    );

    let mut rules = OriginRules::new(Origin::CustomFilters);
    for filter in &parsed.network {
        let (kind, priority) = filter_action(filter);
        rules.push(priority, kind, filter_condition(filter));
    }
    rules.finish(out);

    out.cosmetic_filters = parsed.cosmetic;
    out.issues
        .extend(parsed.errors.into_iter().map(CompileIssue::CustomFilter));
}

fn compile_redirect_protection(state: &PolicyState, out: &mut CompiledRules) {
    let settings = &state.redirect_protection;
    if !settings.enabled {
        return;
    }

    let mut rules = OriginRules::new(Origin::RedirectProtection);
    for host in &settings.disabled {
        rules.push(
            priority::REDIRECT_PROTECTION,
            ActionType::Allow,
            RuleCondition::default()
                .with_request_domains(vec![host.clone()])
                .with_resource_types(ResourceType::MAIN_FRAME),
        );
    }
    rules.finish(out);
}

/// Single-use "allow once" rules for exact top-level URLs.
pub fn compile_session_allows<'a>(urls: impl IntoIterator<Item = &'a str>) -> Vec<Rule> {
    let mut rules = OriginRules::new(Origin::RedirectProtectionSession);
    for url in urls {
        rules.push(
            priority::REDIRECT_PROTECTION_SESSION,
            ActionType::Allow,
            RuleCondition::default()
                .with_url_filter(format!("|{url}|"))
                .with_resource_types(ResourceType::MAIN_FRAME),
        );
    }
    if rules.dropped > 0 {
        warn!("Session allow list exceeds its ID range, {} entries dropped", rules.dropped);
    }
    rules.rules
}

/// Check a bundled static group against its ID range and the baseline band.
pub fn validate_static_rules(ruleset: RulesetId, rules: &[Rule]) -> Vec<CompileIssue> {
    let mut issues = Vec::new();
    for rule in rules {
        if let Some(origin) = ruleset.origin() {
            if !origin.id_range().contains(rule.id) {
                issues.push(CompileIssue::StaticIdOutOfRange { ruleset, id: rule.id });
            }
        }
        if rule.priority > priority::BASELINE_MAX {
            issues.push(CompileIssue::StaticPriorityTooHigh {
                ruleset,
                id: rule.id,
                priority: rule.priority,
            });
        }
    }
    issues
}

// =============================================================================
// Helpers
// =============================================================================

/// Rules of one origin being assembled, with their ID allocator.
struct OriginRules {
    origin: Origin,
    ids: IdAllocator,
    rules: Vec<Rule>,
    dropped: usize,
}

impl OriginRules {
    fn new(origin: Origin) -> Self {
        Self {
            origin,
            ids: IdAllocator::new(origin),
            rules: Vec::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, priority: u32, kind: ActionType, condition: RuleCondition) {
        match self.ids.next_id() {
            Some(id) => self.rules.push(Rule::new(id, priority, kind, condition)),
            None => self.dropped += 1,
        }
    }

    fn finish(self, out: &mut CompiledRules) {
        if self.dropped > 0 {
            warn!("{} ID range exhausted, dropping {} rules", self.origin, self.dropped);
            out.issues.push(CompileIssue::RangeExhausted {
                origin: self.origin,
                dropped: self.dropped,
            });
        }
        if !self.rules.is_empty() {
            out.by_origin.insert(self.origin, self.rules);
        }
    }
}

fn exception_action(status: ExceptionStatus) -> ActionType {
    match status {
        ExceptionStatus::Trusted => ActionType::Allow,
        ExceptionStatus::Blocked => ActionType::Block,
    }
}

fn filter_action(filter: &NetworkFilter) -> (ActionType, u32) {
    match (filter.action, filter.important) {
        (FilterAction::Block, false) => (ActionType::Block, priority::CUSTOM_FILTER),
        (FilterAction::Block, true) => (ActionType::Block, priority::CUSTOM_FILTER_IMPORTANT),
        (FilterAction::Allow, important) => {
            let kind = if filter.document {
                ActionType::AllowAllRequests
            } else {
                ActionType::Allow
            };
            let priority = if important {
                priority::CUSTOM_FILTER_IMPORTANT_ALLOW
            } else {
                priority::CUSTOM_FILTER_ALLOW
            };
            (kind, priority)
        }
    }
}

fn filter_condition(filter: &NetworkFilter) -> RuleCondition {
    let mut condition = RuleCondition::default();

    match &filter.pattern {
        FilterPattern::Any => {}
        FilterPattern::UrlFilter(pattern) => condition.url_filter = Some(pattern.clone()),
        FilterPattern::Regex(pattern) => condition.regex_filter = Some(pattern.clone()),
    }

    if filter.match_case && filter.pattern != FilterPattern::Any {
        condition.is_url_filter_case_sensitive = Some(true);
    }

    if !filter.resource_types.is_empty() {
        condition = condition.with_resource_types(filter.resource_types);
    }

    condition.domain_type = filter.domain_type;

    if let Some(domains) = &filter.domains {
        if !domains.include.is_empty() {
            condition.initiator_domains = Some(domains.include.clone());
        }
        if !domains.exclude.is_empty() {
            condition.excluded_initiator_domains = Some(domains.exclude.clone());
        }
    }

    condition
}
