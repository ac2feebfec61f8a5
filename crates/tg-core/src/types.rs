//! Core type definitions for Trackguard
//!
//! These types are shared between the resolver, the rule compiler and the
//! host-facing rule documents.

use serde::{Deserialize, Serialize};

// =============================================================================
// Resource Types (bit mask for type filtering)
// =============================================================================

bitflags::bitflags! {
    /// Resource type bit mask, using the host filter's resource type names.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceType: u32 {
        const MAIN_FRAME = 1 << 0;
        const SUB_FRAME = 1 << 1;  // iframe/frame
        const STYLESHEET = 1 << 2;
        const SCRIPT = 1 << 3;
        const IMAGE = 1 << 4;
        const FONT = 1 << 5;
        const OBJECT = 1 << 6;
        const XMLHTTPREQUEST = 1 << 7;
        const PING = 1 << 8;
        const CSP_REPORT = 1 << 9;
        const MEDIA = 1 << 10;
        const WEBSOCKET = 1 << 11;
        const WEBTRANSPORT = 1 << 12;
        const WEBBUNDLE = 1 << 13;
        const OTHER = 1 << 14;

        /// All resource types
        const ALL = 0x7FFF;
        /// Document types (main_frame + sub_frame)
        const DOCUMENT = Self::MAIN_FRAME.bits() | Self::SUB_FRAME.bits();
    }
}

/// Host names for each resource type bit, in bit order.
const RESOURCE_TYPE_NAMES: [(ResourceType, &str); 15] = [
    (ResourceType::MAIN_FRAME, "main_frame"),
    (ResourceType::SUB_FRAME, "sub_frame"),
    (ResourceType::STYLESHEET, "stylesheet"),
    (ResourceType::SCRIPT, "script"),
    (ResourceType::IMAGE, "image"),
    (ResourceType::FONT, "font"),
    (ResourceType::OBJECT, "object"),
    (ResourceType::XMLHTTPREQUEST, "xmlhttprequest"),
    (ResourceType::PING, "ping"),
    (ResourceType::CSP_REPORT, "csp_report"),
    (ResourceType::MEDIA, "media"),
    (ResourceType::WEBSOCKET, "websocket"),
    (ResourceType::WEBTRANSPORT, "webtransport"),
    (ResourceType::WEBBUNDLE, "webbundle"),
    (ResourceType::OTHER, "other"),
];

impl ResourceType {
    /// Parse from a host resource type name.
    pub fn from_host_name(s: &str) -> Option<Self> {
        RESOURCE_TYPE_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(ty, _)| *ty)
    }

    /// Host names of every type set in this mask, in a fixed order.
    pub fn names(self) -> Vec<String> {
        RESOURCE_TYPE_NAMES
            .iter()
            .filter(|(ty, _)| self.contains(*ty))
            .map(|(_, name)| (*name).to_string())
            .collect()
    }
}

// =============================================================================
// Catalog Records
// =============================================================================

/// A tracker category (advertising, site analytics, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// The organization that operates one or more trackers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// Category used for trackers of this organization that lack their own.
    #[serde(default)]
    pub default_category: Option<String>,
}

/// A cataloged tracker entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    /// Domains the tracker is known to issue requests from.
    #[serde(default)]
    pub domains: Vec<String>,
}

// =============================================================================
// Match Result
// =============================================================================

/// Pattern layer that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLayer {
    /// Host suffix plus path prefix
    HostPath,
    /// Host suffix only
    Host,
    /// Path substring
    Path,
    /// Regular expression over host + path
    Regex,
}

/// Result of resolving a request to a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerMatch {
    pub tracker: Tracker,
    /// Category after falling back to the organization default
    pub category: Option<Category>,
    pub organization: Option<Organization>,
    pub layer: MatchLayer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_names_round_trip() {
        for name in ResourceType::ALL.names() {
            let ty = ResourceType::from_host_name(&name).expect("known name");
            assert_eq!(ty.names(), vec![name]);
        }
        assert_eq!(ResourceType::from_host_name("beacon"), None);
    }

    #[test]
    fn document_names() {
        assert_eq!(ResourceType::DOCUMENT.names(), vec!["main_frame", "sub_frame"]);
        assert_eq!(ResourceType::ALL.names().len(), 15);
    }
}
