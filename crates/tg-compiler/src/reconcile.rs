//! Reconcile planning
//!
//! Computes the minimal set of host calls that turns what the host has
//! installed into what the latest compile wants. Planning is pure; applying
//! the plan is the runtime's job.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::origin::{Origin, RulesetId};
use crate::rule::Rule;

/// What the host currently has installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSnapshot {
    pub enabled_rulesets: BTreeSet<RulesetId>,
    pub dynamic_rules: Vec<Rule>,
    pub session_rules: Vec<Rule>,
}

/// What the host should have installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesiredState {
    pub enabled_rulesets: BTreeSet<RulesetId>,
    pub dynamic_rules: Vec<Rule>,
    pub session_rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilePlan {
    pub enable: Vec<RulesetId>,
    pub disable: Vec<RulesetId>,
    pub add_dynamic: Vec<Rule>,
    pub remove_dynamic_ids: Vec<u32>,
    pub add_session: Vec<Rule>,
    pub remove_session_ids: Vec<u32>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.enable.is_empty()
            && self.disable.is_empty()
            && self.add_dynamic.is_empty()
            && self.remove_dynamic_ids.is_empty()
            && self.add_session.is_empty()
            && self.remove_session_ids.is_empty()
    }

    pub fn touches_rulesets(&self) -> bool {
        !self.enable.is_empty() || !self.disable.is_empty()
    }

    pub fn touches_dynamic(&self) -> bool {
        !self.add_dynamic.is_empty() || !self.remove_dynamic_ids.is_empty()
    }

    pub fn touches_session(&self) -> bool {
        !self.add_session.is_empty() || !self.remove_session_ids.is_empty()
    }
}

pub fn plan(desired: &DesiredState, actual: &HostSnapshot) -> ReconcilePlan {
    let (add_dynamic, remove_dynamic_ids) =
        diff_rules(&desired.dynamic_rules, &actual.dynamic_rules, Origin::is_dynamic);
    let (add_session, remove_session_ids) =
        diff_rules(&desired.session_rules, &actual.session_rules, Origin::is_session);

    ReconcilePlan {
        enable: desired
            .enabled_rulesets
            .difference(&actual.enabled_rulesets)
            .copied()
            .collect(),
        disable: actual
            .enabled_rulesets
            .difference(&desired.enabled_rulesets)
            .copied()
            .collect(),
        add_dynamic,
        remove_dynamic_ids,
        add_session,
        remove_session_ids,
    }
}

/// Diff by ID. Installed rules outside the ranges `owned` accepts belong to
/// someone else and are never touched.
fn diff_rules(desired: &[Rule], actual: &[Rule], owned: fn(Origin) -> bool) -> (Vec<Rule>, Vec<u32>) {
    let installed: BTreeMap<u32, &Rule> = actual
        .iter()
        .filter(|rule| Origin::of_id(rule.id).is_some_and(owned))
        .map(|rule| (rule.id, rule))
        .collect();
    let wanted: BTreeMap<u32, &Rule> = desired.iter().map(|rule| (rule.id, rule)).collect();

    let mut add = Vec::new();
    let mut remove = Vec::new();

    for (id, rule) in &installed {
        match wanted.get(id) {
            Some(want) if want == rule => {}
            // Changed rules are removed and re-added under the same ID
            _ => remove.push(*id),
        }
    }

    for (id, rule) in &wanted {
        if installed.get(id) != Some(rule) {
            add.push((*rule).clone());
        }
    }

    (add, remove)
}
