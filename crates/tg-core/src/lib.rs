//! Trackguard Core Library
//!
//! Tracker identification and the policy data model shared by the rule
//! compiler, the runtime and the bindings.
//!
//! # Architecture
//!
//! A [`PatternDatabase`] is built once from its JSON source and never mutated
//! afterwards; updates replace it wholesale. The [`TrackerResolver`] reads the
//! current snapshot and classifies request URLs without taking any write
//! lock on the hot path.
//!
//! # Modules
//!
//! - `url`: URL slicing helpers
//! - `psl`: Public Suffix List for eTLD+1 extraction
//! - `trie`: Arena-backed reversed-hostname trie
//! - `database`: Pattern database and its JSON source format
//! - `resolver`: Request URL to tracker classification
//! - `policy`: Persisted user policy
//! - `types`: Shared type definitions

pub mod database;
pub mod policy;
pub mod psl;
pub mod resolver;
pub mod trie;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use database::{DatabaseError, PatternDatabase, PatternDatabaseBuilder};
pub use policy::{ExceptionScope, ExceptionStatus, PauseExpiry, PolicyState, Timestamp};
pub use psl::PublicSuffixList;
pub use resolver::TrackerResolver;
pub use types::{Category, MatchLayer, Organization, ResourceType, Tracker, TrackerMatch};
