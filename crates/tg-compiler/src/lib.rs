//! Trackguard Rule Compiler
//!
//! Compiles persisted policy state into the declarative rules the host
//! filter evaluates, and plans the host calls that bring the installed
//! rules in line with a compile.

pub mod compiler;
pub mod optimizer;
pub mod origin;
pub mod parser;
pub mod reconcile;
pub mod rule;

pub use compiler::{compile_session_allows, enabled_rulesets, CompileIssue, CompiledRules, RuleCompiler};
pub use optimizer::optimize_filters;
pub use origin::{priority, IdRange, Origin, RulesetId};
pub use parser::{parse_filter_list, CustomFilterError, ParsedFilterList};
pub use reconcile::{plan, DesiredState, HostSnapshot, ReconcilePlan};
pub use rule::{ActionType, DomainType, Rule, RuleAction, RuleCondition};
