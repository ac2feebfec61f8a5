//! Rule ID space and priority bands
//!
//! Every rule handed to the host carries an ID from the range reserved for
//! the subsystem that produced it, so independently compiled groups can
//! never collide. Priorities encode which group wins when several rules
//! match the same request.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Ranges
// =============================================================================

/// Inclusive range of rule IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u32,
    pub end: u32,
}

impl IdRange {
    #[inline]
    pub const fn contains(&self, id: u32) -> bool {
        id >= self.start && id <= self.end
    }

    #[inline]
    pub const fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        false
    }

    pub const fn overlaps(&self, other: &IdRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Subsystem a rule comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// Bundled fix-up list (static group, validated against its range)
    Fixes,
    Pause,
    CustomFilters,
    Exceptions,
    /// Persistent "always allow" entries
    RedirectProtection,
    /// Single-use "allow once" entries
    RedirectProtectionSession,
}

impl Origin {
    pub const ALL: [Origin; 6] = [
        Origin::Fixes,
        Origin::Pause,
        Origin::CustomFilters,
        Origin::Exceptions,
        Origin::RedirectProtection,
        Origin::RedirectProtectionSession,
    ];

    pub const fn id_range(self) -> IdRange {
        match self {
            Origin::Fixes => IdRange { start: 1, end: 999_999 },
            Origin::Pause => IdRange { start: 1_000_000, end: 1_999_999 },
            Origin::CustomFilters => IdRange { start: 2_000_000, end: 2_999_999 },
            Origin::Exceptions => IdRange { start: 3_000_000, end: 3_999_999 },
            Origin::RedirectProtection => IdRange { start: 4_000_000, end: 4_999_999 },
            Origin::RedirectProtectionSession => IdRange { start: 5_000_000, end: 5_999_999 },
        }
    }

    /// Origin whose range contains `id`.
    pub fn of_id(id: u32) -> Option<Origin> {
        Self::ALL.into_iter().find(|origin| origin.id_range().contains(id))
    }

    /// Rules installed through the host's dynamic rule API.
    pub const fn is_dynamic(self) -> bool {
        matches!(
            self,
            Origin::Pause | Origin::CustomFilters | Origin::Exceptions | Origin::RedirectProtection
        )
    }

    /// Rules installed through the host's session rule API.
    pub const fn is_session(self) -> bool {
        matches!(self, Origin::RedirectProtectionSession)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Origin::Fixes => "fixes",
            Origin::Pause => "pause",
            Origin::CustomFilters => "customFilters",
            Origin::Exceptions => "exceptions",
            Origin::RedirectProtection => "redirectProtection",
            Origin::RedirectProtectionSession => "redirectProtectionSession",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hands out IDs from one origin's range, in order.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    range: IdRange,
    next: u32,
}

impl IdAllocator {
    pub const fn new(origin: Origin) -> Self {
        let range = origin.id_range();
        Self {
            range,
            next: range.start,
        }
    }

    /// Next free ID, or `None` once the range is used up.
    pub fn next_id(&mut self) -> Option<u32> {
        if !self.range.contains(self.next) {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    /// Reserve `count` consecutive IDs.
    pub fn next_block(&mut self, count: u32) -> Option<u32> {
        let last = self.next.checked_add(count.checked_sub(1)?)?;
        if !self.range.contains(last) {
            return None;
        }
        let first = self.next;
        self.next = last + 1;
        Some(first)
    }
}

// =============================================================================
// Priority Bands
// =============================================================================

/// Rule priorities. Higher wins.
pub mod priority {
    pub const PAUSE: u32 = 10_000_000;
    pub const EXCEPTION_GLOBAL: u32 = 3_000_000;
    /// Site-scoped overrides beat global ones
    pub const EXCEPTION_SITE: u32 = 3_000_001;
    pub const REDIRECT_PROTECTION_SESSION: u32 = 2_000_000;
    pub const REDIRECT_PROTECTION: u32 = 1_500_000;
    pub const CUSTOM_FILTER: u32 = 1_000;
    pub const CUSTOM_FILTER_ALLOW: u32 = 1_001;
    pub const CUSTOM_FILTER_IMPORTANT: u32 = 1_002;
    pub const CUSTOM_FILTER_IMPORTANT_ALLOW: u32 = 1_003;
    /// Static lists must stay below every dynamic band
    pub const BASELINE_MAX: u32 = 999;
}

// =============================================================================
// Static Rule Groups
// =============================================================================

/// Bundled rule groups the host enables or disables as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesetId {
    Ads,
    Tracking,
    Annoyances,
    Fixes,
}

impl RulesetId {
    pub const ALL: [RulesetId; 4] = [
        RulesetId::Ads,
        RulesetId::Tracking,
        RulesetId::Annoyances,
        RulesetId::Fixes,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RulesetId::Ads => "ads",
            RulesetId::Tracking => "tracking",
            RulesetId::Annoyances => "annoyances",
            RulesetId::Fixes => "fixes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == name)
    }

    /// ID range the group's rules must come from, if it has one.
    pub const fn origin(self) -> Option<Origin> {
        match self {
            RulesetId::Fixes => Some(Origin::Fixes),
            _ => None,
        }
    }
}

impl std::fmt::Display for RulesetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
