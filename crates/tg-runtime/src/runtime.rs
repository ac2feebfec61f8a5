//! Runtime wiring: store, resolver, interceptor and the reconcile worker.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tg_core::{PatternDatabase, PauseExpiry, TrackerResolver};

use crate::host::HostFilter;
use crate::reconciler::{spawn_reconciler, ReconcileError, Reconciler, ReconcilerHandle};
use crate::redirect_protection::{
    ActionOutcome, InterstitialAction, NavigationDecision, RedirectProtectionConfig,
    RedirectProtectionInterceptor, TabId,
};
use crate::store::{PolicyStore, StoreError};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("rules for revision {0} were not applied in time")]
    AckTimeout(u64),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub redirect_protection: RedirectProtectionConfig,
    /// How long to wait for the host to pick up a change before giving up.
    pub ack_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redirect_protection: RedirectProtectionConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

pub struct Runtime {
    store: Arc<PolicyStore>,
    resolver: Arc<TrackerResolver>,
    interceptor: Arc<RedirectProtectionInterceptor>,
    reconciler: ReconcilerHandle,
    ack_timeout: Duration,
}

impl Runtime {
    /// Wire everything up and start the reconcile worker. Must be called
    /// from within a tokio runtime.
    pub fn start(
        store: Arc<PolicyStore>,
        host: Arc<dyn HostFilter>,
        resolver: Arc<TrackerResolver>,
        config: RuntimeConfig,
    ) -> Self {
        let interceptor = Arc::new(RedirectProtectionInterceptor::new(
            resolver.clone(),
            config.redirect_protection,
        ));
        let reconciler = spawn_reconciler(Reconciler::new(
            store.clone(),
            host,
            resolver.clone(),
            interceptor.clone(),
        ));

        Self {
            store,
            resolver,
            interceptor,
            reconciler,
            ack_timeout: config.ack_timeout,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<TrackerResolver> {
        &self.resolver
    }

    pub fn interceptor(&self) -> &Arc<RedirectProtectionInterceptor> {
        &self.interceptor
    }

    pub fn reconciler(&self) -> &ReconcilerHandle {
        &self.reconciler
    }

    /// Swap in a new pattern database and recompile against it. Returns the
    /// reconcile ticket covering the swap.
    pub fn replace_database(&self, database: Arc<PatternDatabase>) -> u64 {
        info!(
            "Pattern database {} loaded ({} trackers)",
            database.version(),
            database.tracker_count()
        );
        self.resolver.replace_database(database);
        self.reconciler.request()
    }

    /// Top-level navigation hook.
    pub async fn on_navigation(
        &self,
        tab: TabId,
        url: &str,
        source_hostname: Option<&str>,
    ) -> Result<NavigationDecision, RuntimeError> {
        let state = self.store.load().await?;
        let decision =
            self.interceptor
                .on_navigation(tab, url, source_hostname, &state, self.store.now());
        if self.interceptor.take_session_changed() {
            self.reconciler.request();
        }
        Ok(decision)
    }

    /// Interstitial page hook. Returns once the rules needed for a retry
    /// are installed.
    pub async fn on_user_action(
        &self,
        tab: TabId,
        action: InterstitialAction,
    ) -> Result<ActionOutcome, RuntimeError> {
        match self.interceptor.on_user_action(tab, action) {
            ActionOutcome::Retry(url) => {
                let ticket = self.reconciler.request();
                self.await_ack(ticket, self.reconciler.wait_for_request(ticket))
                    .await?;
                Ok(ActionOutcome::Retry(url))
            }
            ActionOutcome::AllowHostname { hostname, url } => {
                self.always_allow(&hostname).await?;
                Ok(ActionOutcome::Retry(url))
            }
            other => Ok(other),
        }
    }

    /// Persist `hostname` as always allowed and wait for the host to apply it.
    pub async fn always_allow(&self, hostname: &str) -> Result<u64, RuntimeError> {
        let (_, revision) = self
            .store
            .update(|state| {
                state.disable_redirect_protection_for(hostname);
            })
            .await?;
        info!("Redirect protection disabled for {}", hostname);
        self.await_ack(revision, self.reconciler.wait_for(revision))
            .await?;
        Ok(revision)
    }

    pub async fn pause(&self, hostname: &str, expiry: PauseExpiry) -> Result<u64, RuntimeError> {
        let (_, revision) = self.store.update(|state| state.pause(hostname, expiry)).await?;
        Ok(revision)
    }

    pub async fn resume(&self, hostname: &str) -> Result<u64, RuntimeError> {
        let (_, revision) = self
            .store
            .update(|state| {
                state.resume(hostname);
            })
            .await?;
        Ok(revision)
    }

    pub fn shutdown(self) {
        self.reconciler.shutdown();
    }

    async fn await_ack<F, T>(&self, id: u64, ack: F) -> Result<T, RuntimeError>
    where
        F: std::future::Future<Output = Result<T, ReconcileError>>,
    {
        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("Timed out waiting for the host to apply {}", id);
                Err(RuntimeError::AckTimeout(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::MemoryHostFilter;
    use crate::store::MemoryStore;
    use tg_compiler::{priority, Origin};
    use tg_core::types::Tracker;
    use tg_core::{ExceptionScope, ExceptionStatus, PatternDatabaseBuilder};

    const LINK: &str = "https://go.clicktrack.net/c/abc";

    fn clicktrack_db() -> PatternDatabase {
        PatternDatabaseBuilder::new()
            .tracker(Tracker {
                id: "clicktrack".into(),
                name: "ClickTrack".into(),
                category: None,
                organization: None,
                domains: vec!["clicktrack.net".into()],
            })
            .host("clicktrack.net", "clicktrack")
            .build()
            .unwrap()
    }

    fn runtime(host: Arc<MemoryHostFilter>) -> Runtime {
        let store = Arc::new(PolicyStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        ));
        Runtime::start(
            store,
            host,
            Arc::new(TrackerResolver::with_database(clicktrack_db())),
            RuntimeConfig {
                ack_timeout: Duration::from_secs(5),
                ..RuntimeConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn always_allow_flow() {
        let host = Arc::new(MemoryHostFilter::new());
        let rt = runtime(host.clone());

        let decision = rt.on_navigation(1, LINK, Some("mail.example")).await.unwrap();
        assert!(matches!(decision, NavigationDecision::Redirect(_)));

        let outcome = rt
            .on_user_action(1, InterstitialAction::AlwaysAllow("go.clicktrack.net".into()))
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Retry(LINK.to_string()));

        // The allow rule is installed before the retry is handed back
        let installed = host.installed();
        let allow = installed
            .dynamic_rules
            .iter()
            .find(|r| Origin::of_id(r.id) == Some(Origin::RedirectProtection))
            .unwrap();
        assert_eq!(allow.priority, priority::REDIRECT_PROTECTION);
        assert_eq!(
            allow.condition.request_domains,
            Some(vec!["go.clicktrack.net".to_string()])
        );

        assert_eq!(
            rt.on_navigation(1, LINK, Some("mail.example")).await.unwrap(),
            NavigationDecision::Proceed
        );
        rt.shutdown();
    }

    #[tokio::test]
    async fn allow_once_installs_and_retires_session_rule() {
        let host = Arc::new(MemoryHostFilter::new());
        let rt = runtime(host.clone());

        rt.on_navigation(2, LINK, None).await.unwrap();
        let outcome = rt.on_user_action(2, InterstitialAction::AllowOnce).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Retry(LINK.to_string()));
        assert_eq!(host.installed().session_rules.len(), 1);

        assert_eq!(rt.on_navigation(2, LINK, None).await.unwrap(), NavigationDecision::Proceed);
        let ticket = rt.reconciler().request();
        rt.reconciler().wait_for_request(ticket).await.unwrap();
        assert!(host.installed().session_rules.is_empty());

        assert!(matches!(
            rt.on_navigation(2, LINK, None).await.unwrap(),
            NavigationDecision::Redirect(_)
        ));
        rt.shutdown();
    }

    #[tokio::test]
    async fn concurrent_always_allow_keeps_both_hosts() {
        let host = Arc::new(MemoryHostFilter::new());
        let rt = runtime(host.clone());

        let (a, b) = tokio::join!(rt.always_allow("a.clicktrack.net"), rt.always_allow("b.clicktrack.net"));
        a.unwrap();
        b.unwrap();

        let state = rt.store().load().await.unwrap();
        assert!(state.is_redirect_protection_disabled_for("a.clicktrack.net"));
        assert!(state.is_redirect_protection_disabled_for("b.clicktrack.net"));
        assert_eq!(host.installed().dynamic_rules.len(), 2);
        rt.shutdown();
    }

    #[tokio::test]
    async fn database_swap_installs_pending_exceptions() {
        let host = Arc::new(MemoryHostFilter::new());
        let store = Arc::new(PolicyStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        ));
        let rt = Runtime::start(
            store.clone(),
            host.clone(),
            Arc::new(TrackerResolver::default()),
            RuntimeConfig::default(),
        );

        let (_, revision) = store
            .update(|s| s.set_exception("clicktrack", ExceptionScope::Global, ExceptionStatus::Blocked))
            .await
            .unwrap();
        rt.reconciler().wait_for(revision).await.unwrap();
        assert!(host.installed().dynamic_rules.is_empty());

        let ticket = rt.replace_database(Arc::new(clicktrack_db()));
        rt.reconciler().wait_for_request(ticket).await.unwrap();

        let installed = host.installed();
        assert_eq!(installed.dynamic_rules.len(), 1);
        let rule = &installed.dynamic_rules[0];
        assert_eq!(Origin::of_id(rule.id), Some(Origin::Exceptions));
        assert_eq!(rule.condition.request_domains, Some(vec!["clicktrack.net".to_string()]));
        rt.shutdown();
    }

    #[tokio::test]
    async fn trusted_tracker_is_not_intercepted() {
        let host = Arc::new(MemoryHostFilter::new());
        let rt = runtime(host);

        rt.store()
            .update(|s| s.set_exception("clicktrack", ExceptionScope::Global, ExceptionStatus::Trusted))
            .await
            .unwrap();
        assert_eq!(
            rt.on_navigation(1, LINK, Some("mail.example")).await.unwrap(),
            NavigationDecision::Proceed
        );
        rt.shutdown();
    }

    #[tokio::test]
    async fn cancel_and_pause() {
        let host = Arc::new(MemoryHostFilter::new());
        let rt = runtime(host.clone());

        rt.on_navigation(3, LINK, None).await.unwrap();
        assert_eq!(
            rt.on_user_action(3, InterstitialAction::Cancel).await.unwrap(),
            ActionOutcome::Dismissed
        );

        let revision = rt.pause("clicktrack.net", PauseExpiry::Forever).await.unwrap();
        rt.reconciler().wait_for(revision).await.unwrap();
        assert_eq!(rt.on_navigation(3, LINK, None).await.unwrap(), NavigationDecision::Proceed);
        assert_eq!(host.installed().dynamic_rules.len(), 2);

        let revision = rt.resume("clicktrack.net").await.unwrap();
        rt.reconciler().wait_for(revision).await.unwrap();
        assert!(host.installed().dynamic_rules.is_empty());
        rt.shutdown();
    }
}
