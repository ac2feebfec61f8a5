//! Ruleset Reconciler
//!
//! Brings the host's installed rules in line with the latest policy state.
//! Each pass reads a fresh host snapshot, compiles, plans and applies; the
//! background worker coalesces bursts of store changes into single passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tg_compiler::{plan, RuleCompiler};
use tg_core::TrackerResolver;

use crate::host::{HostError, HostFilter};
use crate::redirect_protection::RedirectProtectionInterceptor;
use crate::store::{PolicyStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read policy state: {0}")]
    Store(#[from] StoreError),

    #[error("host rejected rule update: {0}")]
    Host(#[from] HostError),

    #[error("reconciler stopped")]
    Stopped,
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Store revision the pass compiled from
    pub revision: u64,
    pub rulesets_enabled: usize,
    pub rulesets_disabled: usize,
    pub dynamic_added: usize,
    pub dynamic_removed: usize,
    pub session_added: usize,
    pub session_removed: usize,
    pub issues: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.rulesets_enabled == 0
            && self.rulesets_disabled == 0
            && self.dynamic_added == 0
            && self.dynamic_removed == 0
            && self.session_added == 0
            && self.session_removed == 0
    }
}

pub struct Reconciler {
    store: Arc<PolicyStore>,
    host: Arc<dyn HostFilter>,
    resolver: Arc<TrackerResolver>,
    interceptor: Arc<RedirectProtectionInterceptor>,
}

impl Reconciler {
    pub fn new(
        store: Arc<PolicyStore>,
        host: Arc<dyn HostFilter>,
        resolver: Arc<TrackerResolver>,
        interceptor: Arc<RedirectProtectionInterceptor>,
    ) -> Self {
        Self {
            store,
            host,
            resolver,
            interceptor,
        }
    }

    /// One full pass against a fresh host snapshot.
    ///
    /// On a host error the calls made so far stay applied and the rest is
    /// left for the next pass, which re-plans from scratch.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let revision = self.store.revision();
        let state = self.store.load().await?;
        let now = self.store.now();

        let compiled = RuleCompiler::new(self.resolver.database()).compile(&state, now);
        let issues = compiled.issues.len();
        for issue in &compiled.issues {
            debug!("Compile issue: {}", issue);
        }

        let desired = compiled.into_desired(self.interceptor.session_rules());
        let actual = self.host.snapshot().await?;
        let plan = plan(&desired, &actual);

        let report = ReconcileReport {
            revision,
            rulesets_enabled: plan.enable.len(),
            rulesets_disabled: plan.disable.len(),
            dynamic_added: plan.add_dynamic.len(),
            dynamic_removed: plan.remove_dynamic_ids.len(),
            session_added: plan.add_session.len(),
            session_removed: plan.remove_session_ids.len(),
            issues,
        };

        let (rulesets, dynamic, session) = (
            plan.touches_rulesets(),
            plan.touches_dynamic(),
            plan.touches_session(),
        );
        if rulesets {
            self.host
                .update_enabled_rulesets(plan.enable, plan.disable)
                .await?;
        }
        if dynamic {
            self.host
                .update_dynamic_rules(plan.remove_dynamic_ids, plan.add_dynamic)
                .await?;
        }
        if session {
            self.host
                .update_session_rules(plan.remove_session_ids, plan.add_session)
                .await?;
        }

        if !report.is_noop() {
            info!(
                "Reconciled revision {}: rulesets +{}/-{}, dynamic +{}/-{}, session +{}/-{}",
                report.revision,
                report.rulesets_enabled,
                report.rulesets_disabled,
                report.dynamic_added,
                report.dynamic_removed,
                report.session_added,
                report.session_removed
            );
        }

        Ok(report)
    }
}

// =============================================================================
// Background worker
// =============================================================================

/// Last successful pass: the store revision it compiled and the latest
/// explicit request it covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub revision: u64,
    pub request: u64,
}

pub struct ReconcilerHandle {
    applied: watch::Receiver<Applied>,
    requests: Arc<AtomicU64>,
    nudge: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Ask for a pass even though the store did not change (session rules).
    /// Returns a ticket for [`wait_for_request`](Self::wait_for_request).
    pub fn request(&self) -> u64 {
        let ticket = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.nudge.notify_one();
        ticket
    }

    pub fn applied(&self) -> Applied {
        *self.applied.borrow()
    }

    /// Wait until a pass compiled from `revision` or later has been applied.
    pub async fn wait_for(&self, revision: u64) -> Result<Applied, ReconcileError> {
        let mut applied = self.applied.clone();
        let result = applied.wait_for(|a| a.revision >= revision).await;
        result.map(|a| *a).map_err(|_| ReconcileError::Stopped)
    }

    pub async fn wait_for_request(&self, ticket: u64) -> Result<Applied, ReconcileError> {
        let mut applied = self.applied.clone();
        let result = applied.wait_for(|a| a.request >= ticket).await;
        result.map(|a| *a).map_err(|_| ReconcileError::Stopped)
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Run `reconciler` whenever the store revision moves or a pass is
/// requested. The worker runs until [`ReconcilerHandle::shutdown`].
pub fn spawn_reconciler(reconciler: Reconciler) -> ReconcilerHandle {
    let (applied_tx, applied_rx) = watch::channel(Applied::default());
    let requests = Arc::new(AtomicU64::new(0));
    let nudge = Arc::new(Notify::new());

    let mut revisions = reconciler.store.subscribe();
    let worker_requests = requests.clone();
    let worker_nudge = nudge.clone();

    let task = tokio::spawn(async move {
        loop {
            revisions.borrow_and_update();
            let request = worker_requests.load(Ordering::SeqCst);

            match reconciler.reconcile_once().await {
                Ok(report) => {
                    applied_tx.send_replace(Applied {
                        revision: report.revision,
                        request,
                    });
                }
                Err(e) => warn!("Reconcile pass failed, will retry on next change: {}", e),
            }

            tokio::select! {
                changed = revisions.changed() => {
                    if changed.is_err() {
                        debug!("Policy store dropped, reconciler exiting");
                        break;
                    }
                }
                _ = worker_nudge.notified() => {}
            }
        }
    });

    ReconcilerHandle {
        applied: applied_rx,
        requests,
        nudge,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::MemoryHostFilter;
    use crate::redirect_protection::RedirectProtectionConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tg_compiler::{priority, HostSnapshot, Origin, Rule, RuleCondition, ActionType, RulesetId};
    use tg_core::PauseExpiry;

    struct Fixture {
        store: Arc<PolicyStore>,
        host: Arc<MemoryHostFilter>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
    }

    fn fixture(host: MemoryHostFilter) -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(PolicyStore::new(Arc::new(MemoryStore::new()), clock.clone()));
        let host = Arc::new(host);
        let resolver = Arc::new(TrackerResolver::default());
        let interceptor = Arc::new(RedirectProtectionInterceptor::new(
            resolver.clone(),
            RedirectProtectionConfig::default(),
        ));
        let reconciler = Reconciler::new(store.clone(), host.clone(), resolver, interceptor);
        Fixture {
            store,
            host,
            clock,
            reconciler,
        }
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let f = fixture(MemoryHostFilter::new());
        f.store
            .update(|s| s.pause("example.com", PauseExpiry::Forever))
            .await
            .unwrap();

        let first = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(first.rulesets_enabled, 4);
        assert_eq!(first.dynamic_added, 2);

        let installed = f.host.installed();
        assert_eq!(installed.dynamic_rules[0].id, Origin::Pause.id_range().start);
        assert_eq!(installed.dynamic_rules[0].priority, priority::PAUSE);

        let calls = f.host.update_calls();
        let second = f.reconciler.reconcile_once().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(f.host.update_calls(), calls);
    }

    #[tokio::test]
    async fn pause_expiry_removes_rules() {
        let f = fixture(MemoryHostFilter::new());
        f.store
            .update(|s| s.pause("example.com", PauseExpiry::Until(1_000)))
            .await
            .unwrap();
        f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(f.host.installed().dynamic_rules.len(), 2);

        f.clock.set(1_000);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.dynamic_removed, 2);
        assert!(f.host.installed().dynamic_rules.is_empty());
    }

    #[tokio::test]
    async fn foreign_rules_survive() {
        let foreign = Rule::new(7, 1, ActionType::Block, RuleCondition::default());
        let f = fixture(MemoryHostFilter::with_installed(HostSnapshot {
            dynamic_rules: vec![foreign.clone()],
            ..HostSnapshot::default()
        }));
        f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(f.host.installed().dynamic_rules, vec![foreign]);
    }

    #[tokio::test]
    async fn quota_rejection_converges_later() {
        let f = fixture(MemoryHostFilter::with_dynamic_quota(2));
        f.store
            .update(|s| {
                s.pause("a.com", PauseExpiry::Forever);
                s.pause("b.com", PauseExpiry::Forever);
            })
            .await
            .unwrap();

        let err = f.reconciler.reconcile_once().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Host(HostError::QuotaExceeded { .. })));
        assert!(f.host.installed().dynamic_rules.is_empty());
        // The ruleset call went through before the rejection
        assert!(f.host.installed().enabled_rulesets.contains(&RulesetId::Fixes));

        f.host.set_dynamic_quota(Some(10));
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.dynamic_added, 4);
        assert!(f.reconciler.reconcile_once().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn worker_acknowledges_revisions() {
        let f = fixture(MemoryHostFilter::new());
        let host = f.host.clone();
        let store = f.store.clone();
        let handle = spawn_reconciler(f.reconciler);

        let mut last = 0;
        for host_name in ["a.com", "b.com", "c.com"] {
            let (_, revision) = store
                .update(|s| s.pause(host_name, PauseExpiry::Forever))
                .await
                .unwrap();
            last = revision;
        }

        let applied = tokio::time::timeout(Duration::from_secs(5), handle.wait_for(last))
            .await
            .unwrap()
            .unwrap();
        assert!(applied.revision >= 3);
        assert_eq!(host.installed().dynamic_rules.len(), 6);

        let ticket = handle.request();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_request(ticket))
            .await
            .unwrap()
            .unwrap();
        handle.shutdown();
    }
}
