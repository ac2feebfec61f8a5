//! Policy State
//!
//! The single persisted document every compiled rule is derived from. All
//! maps are ordered so that anything iterating them (the rule compiler in
//! particular) sees the same order on every run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::psl::host_suffixes;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// How long a pause lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseExpiry {
    Forever,
    Until(Timestamp),
}

impl PauseExpiry {
    #[inline]
    pub fn is_active(&self, now: Timestamp) -> bool {
        match self {
            Self::Forever => true,
            Self::Until(expiry) => now < *expiry,
        }
    }
}

/// Override applied to a tracker or hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExceptionStatus {
    Trusted,
    Blocked,
}

/// Where an override applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionScope {
    Global,
    Site(String),
}

/// Overrides for one tracker id or hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExceptionEntry {
    pub global: Option<ExceptionStatus>,
    pub sites: BTreeMap<String, ExceptionStatus>,
}

impl ExceptionEntry {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.sites.is_empty()
    }
}

/// User-authored filter text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomFilters {
    pub enabled: bool,
    pub text: String,
}

impl Default for CustomFilters {
    fn default() -> Self {
        Self {
            enabled: true,
            text: String::new(),
        }
    }
}

/// Redirect protection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectProtection {
    pub enabled: bool,
    /// Hostnames the user chose to always allow.
    pub disabled: BTreeSet<String>,
}

impl Default for RedirectProtection {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled: BTreeSet::new(),
        }
    }
}

/// Baseline category lists the user subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockingOptions {
    pub ads: bool,
    pub tracking: bool,
    pub annoyances: bool,
}

impl Default for BlockingOptions {
    fn default() -> Self {
        Self {
            ads: true,
            tracking: true,
            annoyances: true,
        }
    }
}

/// The complete user policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyState {
    pub global_pause: Option<PauseExpiry>,
    /// Hostname -> pause expiry. Expired entries count as absent.
    pub paused: BTreeMap<String, PauseExpiry>,
    /// Tracker id or hostname -> overrides.
    pub exceptions: BTreeMap<String, ExceptionEntry>,
    pub custom_filters: CustomFilters,
    pub redirect_protection: RedirectProtection,
    pub blocking: BlockingOptions,
}

impl PolicyState {
    pub fn is_globally_paused(&self, now: Timestamp) -> bool {
        self.global_pause.is_some_and(|p| p.is_active(now))
    }

    /// Paused hostnames that have not expired, in sorted order.
    pub fn active_pauses(&self, now: Timestamp) -> impl Iterator<Item = &str> + '_ {
        self.paused
            .iter()
            .filter(move |(_, expiry)| expiry.is_active(now))
            .map(|(host, _)| host.as_str())
    }

    /// Whether `host` or one of its parent domains is paused.
    pub fn is_paused(&self, host: &str, now: Timestamp) -> bool {
        host_suffixes(host).any(|candidate| self.paused.get(candidate).is_some_and(|p| p.is_active(now)))
    }

    /// Drop expired pauses. Returns true if anything was removed.
    pub fn evict_expired(&mut self, now: Timestamp) -> bool {
        let before = self.paused.len();
        self.paused.retain(|_, expiry| expiry.is_active(now));
        let mut changed = self.paused.len() != before;
        if self.global_pause.is_some_and(|p| !p.is_active(now)) {
            self.global_pause = None;
            changed = true;
        }
        changed
    }

    pub fn pause(&mut self, host: &str, expiry: PauseExpiry) {
        self.paused.insert(normalize_host(host), expiry);
    }

    pub fn resume(&mut self, host: &str) -> bool {
        self.paused.remove(&normalize_host(host)).is_some()
    }

    pub fn set_exception(&mut self, key: &str, scope: ExceptionScope, status: ExceptionStatus) {
        let entry = self.exceptions.entry(key.to_string()).or_default();
        match scope {
            ExceptionScope::Global => entry.global = Some(status),
            ExceptionScope::Site(site) => {
                entry.sites.insert(normalize_host(&site), status);
            }
        }
    }

    pub fn clear_exception(&mut self, key: &str, scope: ExceptionScope) {
        if let Some(entry) = self.exceptions.get_mut(key) {
            match scope {
                ExceptionScope::Global => entry.global = None,
                ExceptionScope::Site(site) => {
                    entry.sites.remove(&normalize_host(&site));
                }
            }
            if entry.is_empty() {
                self.exceptions.remove(key);
            }
        }
    }

    /// Status the exception rules give a request covered by `keys`, made
    /// from a page on `initiator`.
    ///
    /// Site overrides rank above global ones. Within a rank `Trusted` wins,
    /// as an allow does over a block of equal priority.
    pub fn exception_status<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        initiator: Option<&str>,
    ) -> Option<ExceptionStatus> {
        let mut site = None;
        let mut global = None;
        for entry in keys.into_iter().filter_map(|key| self.exceptions.get(key)) {
            let on_site = initiator
                .into_iter()
                .flat_map(host_suffixes)
                .find_map(|candidate| entry.sites.get(candidate));
            if let Some(status) = on_site {
                site = strongest(site, *status);
            }
            if let Some(status) = entry.global {
                global = strongest(global, status);
            }
        }
        site.or(global)
    }

    /// "Always allow" for redirect protection.
    pub fn disable_redirect_protection_for(&mut self, host: &str) -> bool {
        self.redirect_protection.disabled.insert(normalize_host(host))
    }

    pub fn enable_redirect_protection_for(&mut self, host: &str) -> bool {
        self.redirect_protection.disabled.remove(&normalize_host(host))
    }

    /// Whether `host` or one of its parent domains is always allowed.
    pub fn is_redirect_protection_disabled_for(&self, host: &str) -> bool {
        let host = normalize_host(host);
        let disabled = host_suffixes(&host).any(|candidate| self.redirect_protection.disabled.contains(candidate));
        disabled
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn strongest(current: Option<ExceptionStatus>, status: ExceptionStatus) -> Option<ExceptionStatus> {
    match current {
        Some(ExceptionStatus::Trusted) => current,
        _ => Some(status),
    }
}
