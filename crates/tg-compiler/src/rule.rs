//! Declarative rule documents
//!
//! Serializes to the JSON shape the host filter consumes.

use serde::{Deserialize, Serialize};
use tg_core::types::ResourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Block,
    Allow,
    AllowAllRequests,
    Redirect,
    UpgradeScheme,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
}

impl RuleAction {
    pub const fn new(kind: ActionType) -> Self {
        Self {
            kind,
            redirect: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DomainType {
    FirstParty,
    ThirdParty,
}

/// Request conditions. Absent fields do not constrain the match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_url_filter_case_sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_resource_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_type: Option<DomainType>,
}

impl RuleCondition {
    pub fn with_resource_types(mut self, types: ResourceType) -> Self {
        self.resource_types = Some(types.names());
        self
    }

    pub fn with_initiator_domains(mut self, domains: Vec<String>) -> Self {
        self.initiator_domains = Some(domains);
        self
    }

    pub fn with_request_domains(mut self, domains: Vec<String>) -> Self {
        self.request_domains = Some(domains);
        self
    }

    pub fn with_url_filter(mut self, filter: String) -> Self {
        self.url_filter = Some(filter);
        self
    }
}

/// A single host rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl Rule {
    pub fn new(id: u32, priority: u32, kind: ActionType, condition: RuleCondition) -> Self {
        Self {
            id,
            priority,
            action: RuleAction::new(kind),
            condition,
        }
    }

    #[inline]
    pub fn is_allow(&self) -> bool {
        matches!(self.action.kind, ActionType::Allow | ActionType::AllowAllRequests)
    }
}
