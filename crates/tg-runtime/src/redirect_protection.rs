//! Redirect Protection Interceptor
//!
//! Catches top-level navigations to tracking hosts (typically redirect or
//! click-tracking links the static lists would block outright) and sends
//! the tab to an interstitial page instead. From there the user can allow
//! the exact URL once, allow the hostname from now on, or go back.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use tg_compiler::{compile_session_allows, enabled_rulesets, Rule};
use tg_core::psl::host_suffixes;
use tg_core::types::Tracker;
use tg_core::url::RequestUrl;
use tg_core::{ExceptionStatus, PolicyState, Timestamp, TrackerResolver};

pub type TabId = i32;

pub const DEFAULT_INTERSTITIAL_BASE: &str = "redirect-protection.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectProtectionConfig {
    /// Interstitial page the tab is sent to.
    pub interstitial_base: String,
}

impl Default for RedirectProtectionConfig {
    fn default() -> Self {
        Self {
            interstitial_base: DEFAULT_INTERSTITIAL_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
    Proceed,
    /// Send the tab to this interstitial URL.
    Redirect(String),
}

/// Choices the interstitial page reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterstitialAction {
    AllowOnce,
    AlwaysAllow(String),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Navigate the tab to `url` again.
    Retry(String),
    /// Persist the hostname as always allowed, then retry `url`.
    AllowHostname { hostname: String, url: String },
    Dismissed,
    /// The tab has no intercepted navigation.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabState {
    Unprotected,
    Intercepted { target: String, hostname: String },
}

#[derive(Debug, Clone)]
struct Interception {
    target: String,
    hostname: String,
}

#[derive(Debug)]
pub struct RedirectProtectionInterceptor {
    resolver: Arc<TrackerResolver>,
    config: RedirectProtectionConfig,
    tabs: Mutex<HashMap<TabId, Interception>>,
    /// Exact URLs allowed once, consumed on use.
    allow_once: Mutex<BTreeSet<String>>,
    session_changed: AtomicBool,
}

impl RedirectProtectionInterceptor {
    pub fn new(resolver: Arc<TrackerResolver>, config: RedirectProtectionConfig) -> Self {
        Self {
            resolver,
            config,
            tabs: Mutex::new(HashMap::new()),
            allow_once: Mutex::new(BTreeSet::new()),
            session_changed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RedirectProtectionConfig {
        &self.config
    }

    /// Decide a top-level navigation of `tab` to `url`.
    ///
    /// Only navigations the compiled rules would block are intercepted.
    pub fn on_navigation(
        &self,
        tab: TabId,
        url: &str,
        source_hostname: Option<&str>,
        state: &PolicyState,
        now: Timestamp,
    ) -> NavigationDecision {
        let settings = &state.redirect_protection;
        if !settings.enabled || state.is_globally_paused(now) {
            return NavigationDecision::Proceed;
        }

        let Some(request) = RequestUrl::parse(url) else {
            return NavigationDecision::Proceed;
        };

        if state.is_redirect_protection_disabled_for(&request.hostname)
            || state.is_paused(&request.hostname, now)
        {
            return NavigationDecision::Proceed;
        }

        let Some(found) = self.resolver.resolve(url, source_hostname) else {
            return NavigationDecision::Proceed;
        };

        if !would_block(state, now, &request.hostname, &found.tracker, source_hostname) {
            debug!("{} is not blocked by the current rules", request.hostname);
            return NavigationDecision::Proceed;
        }

        if lock(&self.allow_once).remove(url) {
            debug!("Consumed single-use allowance for {}", url);
            self.session_changed.store(true, Ordering::SeqCst);
            return NavigationDecision::Proceed;
        }

        lock(&self.tabs).insert(
            tab,
            Interception {
                target: url.to_string(),
                hostname: request.hostname.clone(),
            },
        );
        debug!("Intercepted navigation of tab {} to {}", tab, request.hostname);

        NavigationDecision::Redirect(interstitial_url(
            &self.config.interstitial_base,
            url,
            &request.hostname,
        ))
    }

    /// Handle the user's choice on the interstitial of `tab`.
    ///
    /// After [`ActionOutcome::Retry`] the caller must apply
    /// [`session_rules`](Self::session_rules) before navigating again.
    pub fn on_user_action(&self, tab: TabId, action: InterstitialAction) -> ActionOutcome {
        let Some(interception) = lock(&self.tabs).remove(&tab) else {
            return ActionOutcome::Ignored;
        };

        match action {
            InterstitialAction::AllowOnce => {
                lock(&self.allow_once).insert(interception.target.clone());
                ActionOutcome::Retry(interception.target)
            }
            InterstitialAction::AlwaysAllow(hostname) => {
                let hostname = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
                ActionOutcome::AllowHostname {
                    hostname: if hostname.is_empty() {
                        interception.hostname
                    } else {
                        hostname
                    },
                    url: interception.target,
                }
            }
            InterstitialAction::Cancel => ActionOutcome::Dismissed,
        }
    }

    pub fn tab_state(&self, tab: TabId) -> TabState {
        match lock(&self.tabs).get(&tab) {
            Some(interception) => TabState::Intercepted {
                target: interception.target.clone(),
                hostname: interception.hostname.clone(),
            },
            None => TabState::Unprotected,
        }
    }

    /// Drop any pending interception, e.g. when the tab closes.
    pub fn forget_tab(&self, tab: TabId) {
        lock(&self.tabs).remove(&tab);
    }

    /// Session rules matching the current single-use allowances.
    pub fn session_rules(&self) -> Vec<Rule> {
        let allow_once = lock(&self.allow_once);
        compile_session_allows(allow_once.iter().map(String::as_str))
    }

    /// Whether a navigation consumed an allowance since the last call.
    pub fn take_session_changed(&self) -> bool {
        self.session_changed.swap(false, Ordering::SeqCst)
    }
}

/// Whether the compiled rules block a navigation to `hostname`, which the
/// resolver attributed to `tracker`.
///
/// Exception rules outrank the baseline groups: a trusted tracker or host is
/// let through, a blocked one is stopped whatever the category selection.
fn would_block(
    state: &PolicyState,
    now: Timestamp,
    hostname: &str,
    tracker: &Tracker,
    initiator: Option<&str>,
) -> bool {
    let suffixes: Vec<&str> = host_suffixes(hostname).collect();
    let tracker_applies = tracker.domains.iter().any(|domain| {
        let domain = domain.trim_end_matches('.');
        suffixes.iter().any(|s| s.eq_ignore_ascii_case(domain))
    });

    let keys = suffixes
        .iter()
        .copied()
        .chain(tracker_applies.then_some(tracker.id.as_str()));
    let initiator = initiator.map(|host| host.trim_end_matches('.').to_ascii_lowercase());

    match state.exception_status(keys, initiator.as_deref()) {
        Some(ExceptionStatus::Trusted) => false,
        Some(ExceptionStatus::Blocked) => true,
        None => !enabled_rulesets(state, now).is_empty(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Interstitial URL
// =============================================================================

pub fn interstitial_url(base: &str, target: &str, hostname: &str) -> String {
    format!(
        "{base}?url={}&hostname={hostname}",
        URL_SAFE_NO_PAD.encode(target.as_bytes())
    )
}

/// Target URL and hostname carried by an interstitial URL.
pub fn decode_interstitial_target(interstitial: &str) -> Option<(String, String)> {
    let (_, query) = interstitial.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();

    let mut target = None;
    let mut hostname = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("url", value)) => {
                let bytes = URL_SAFE_NO_PAD.decode(value.trim_end_matches('=')).ok()?;
                target = Some(String::from_utf8(bytes).ok()?);
            }
            Some(("hostname", value)) => hostname = Some(value.to_string()),
            _ => {}
        }
    }

    Some((target?, hostname?))
}
