//! Host declarative filter interface
//!
//! The host evaluates rules; we only install them. Each update call is
//! atomic: on error nothing it asked for is applied.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tg_compiler::{HostSnapshot, Rule, RulesetId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("dynamic rule quota exceeded: {requested} rules requested, limit is {limit}")]
    QuotaExceeded { requested: usize, limit: usize },

    #[error("duplicate rule id {0}")]
    DuplicateId(u32),

    #[error("host rejected the update: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait HostFilter: Send + Sync {
    /// Everything currently installed.
    async fn snapshot(&self) -> Result<HostSnapshot, HostError>;

    async fn update_enabled_rulesets(
        &self,
        enable: Vec<RulesetId>,
        disable: Vec<RulesetId>,
    ) -> Result<(), HostError>;

    /// Removals are applied before additions.
    async fn update_dynamic_rules(&self, remove_ids: Vec<u32>, add: Vec<Rule>) -> Result<(), HostError>;

    /// Removals are applied before additions.
    async fn update_session_rules(&self, remove_ids: Vec<u32>, add: Vec<Rule>) -> Result<(), HostError>;
}

// =============================================================================
// In-memory host
// =============================================================================

#[derive(Debug, Default)]
struct HostState {
    installed: HostSnapshot,
    dynamic_quota: Option<usize>,
    update_calls: usize,
}

/// Host filter kept in memory, with an optional cap on dynamic rules.
#[derive(Debug, Default)]
pub struct MemoryHostFilter {
    state: Mutex<HostState>,
}

impl MemoryHostFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dynamic_quota(limit: usize) -> Self {
        let host = Self::default();
        host.set_dynamic_quota(Some(limit));
        host
    }

    /// Start from rules someone else already installed.
    pub fn with_installed(installed: HostSnapshot) -> Self {
        Self {
            state: Mutex::new(HostState {
                installed,
                ..HostState::default()
            }),
        }
    }

    pub fn set_dynamic_quota(&self, limit: Option<usize>) {
        self.lock().dynamic_quota = limit;
    }

    /// Number of update calls that were accepted.
    pub fn update_calls(&self) -> usize {
        self.lock().update_calls
    }

    pub fn installed(&self) -> HostSnapshot {
        self.lock().installed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remove then add, rejecting duplicate IDs.
fn apply_rules(current: &[Rule], remove_ids: &[u32], add: Vec<Rule>) -> Result<Vec<Rule>, HostError> {
    let removed: BTreeSet<u32> = remove_ids.iter().copied().collect();
    let mut next: Vec<Rule> = current
        .iter()
        .filter(|rule| !removed.contains(&rule.id))
        .cloned()
        .collect();

    let mut ids: BTreeSet<u32> = next.iter().map(|rule| rule.id).collect();
    for rule in add {
        if !ids.insert(rule.id) {
            return Err(HostError::DuplicateId(rule.id));
        }
        next.push(rule);
    }
    Ok(next)
}

#[async_trait]
impl HostFilter for MemoryHostFilter {
    async fn snapshot(&self) -> Result<HostSnapshot, HostError> {
        Ok(self.installed())
    }

    async fn update_enabled_rulesets(
        &self,
        enable: Vec<RulesetId>,
        disable: Vec<RulesetId>,
    ) -> Result<(), HostError> {
        let mut state = self.lock();
        for id in disable {
            state.installed.enabled_rulesets.remove(&id);
        }
        state.installed.enabled_rulesets.extend(enable);
        state.update_calls += 1;
        Ok(())
    }

    async fn update_dynamic_rules(&self, remove_ids: Vec<u32>, add: Vec<Rule>) -> Result<(), HostError> {
        let mut state = self.lock();
        let next = apply_rules(&state.installed.dynamic_rules, &remove_ids, add)?;
        if let Some(limit) = state.dynamic_quota {
            if next.len() > limit {
                return Err(HostError::QuotaExceeded {
                    requested: next.len(),
                    limit,
                });
            }
        }
        state.installed.dynamic_rules = next;
        state.update_calls += 1;
        Ok(())
    }

    async fn update_session_rules(&self, remove_ids: Vec<u32>, add: Vec<Rule>) -> Result<(), HostError> {
        let mut state = self.lock();
        let next = apply_rules(&state.installed.session_rules, &remove_ids, add)?;
        state.installed.session_rules = next;
        state.update_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_compiler::{ActionType, RuleCondition};

    fn rule(id: u32) -> Rule {
        Rule::new(id, 1, ActionType::Block, RuleCondition::default())
    }

    #[tokio::test]
    async fn removals_happen_before_additions() {
        let host = MemoryHostFilter::new();
        host.update_dynamic_rules(vec![], vec![rule(1), rule(2)]).await.unwrap();
        // Re-adding an ID in the same call as its removal is fine
        host.update_dynamic_rules(vec![1], vec![rule(1)]).await.unwrap();
        assert_eq!(host.installed().dynamic_rules.len(), 2);

        let err = host.update_dynamic_rules(vec![], vec![rule(2)]).await.unwrap_err();
        assert_eq!(err, HostError::DuplicateId(2));
    }

    #[tokio::test]
    async fn quota_rejection_leaves_state_untouched() {
        let host = MemoryHostFilter::with_dynamic_quota(2);
        host.update_dynamic_rules(vec![], vec![rule(1)]).await.unwrap();

        let err = host
            .update_dynamic_rules(vec![], vec![rule(2), rule(3)])
            .await
            .unwrap_err();
        assert_eq!(err, HostError::QuotaExceeded { requested: 3, limit: 2 });
        assert_eq!(host.installed().dynamic_rules, vec![rule(1)]);
        assert_eq!(host.update_calls(), 1);
    }

    #[tokio::test]
    async fn rulesets_toggle() {
        let host = MemoryHostFilter::new();
        host.update_enabled_rulesets(vec![RulesetId::Ads, RulesetId::Fixes], vec![])
            .await
            .unwrap();
        host.update_enabled_rulesets(vec![], vec![RulesetId::Ads]).await.unwrap();
        assert_eq!(host.snapshot().await.unwrap().enabled_rulesets, [RulesetId::Fixes].into());
    }
}
