//! Trackguard Runtime
//!
//! The stateful side of the blocker: persisted policy, the worker that keeps
//! the host's installed rules in sync with it, and the redirect protection
//! interstitial flow.
//!
//! # Modules
//!
//! - `clock`: Wall clock, swappable in tests
//! - `store`: Key-value backends and the serialized policy store
//! - `host`: Host declarative filter interface and an in-memory host
//! - `reconciler`: Compile, diff and apply passes, plus the background worker
//! - `redirect_protection`: Navigation interception and interstitial actions
//! - `runtime`: Everything wired together

pub mod clock;
pub mod host;
pub mod reconciler;
pub mod redirect_protection;
pub mod runtime;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use host::{HostError, HostFilter, MemoryHostFilter};
pub use reconciler::{spawn_reconciler, ReconcileError, ReconcileReport, Reconciler, ReconcilerHandle};
pub use redirect_protection::{
    decode_interstitial_target, interstitial_url, ActionOutcome, InterstitialAction, NavigationDecision,
    RedirectProtectionConfig, RedirectProtectionInterceptor, TabId,
};
pub use runtime::{Runtime, RuntimeConfig, RuntimeError};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, PolicyStore, StoreError};
