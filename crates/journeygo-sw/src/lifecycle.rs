//! Lifecycle states and the events emitted while moving between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cache manager lifecycle.
///
/// ```text
/// Uninstalled ──install──▶ Installing ──ok──▶ Installed ──activate──▶ Active
///      ▲                       │
///      └────────failed─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Nothing installed for this version yet, or the last install failed.
    #[default]
    Uninstalled,
    /// App shell is being fetched.
    Installing,
    /// App shell stored; not serving traffic yet.
    Installed,
    /// Stale versions purged; intercepting requests.
    Active,
}

impl LifecycleState {
    /// Whether requests are intercepted in this state.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninstalled => write!(f, "uninstalled"),
            LifecycleState::Installing => write!(f, "installing"),
            LifecycleState::Installed => write!(f, "installed"),
            LifecycleState::Active => write!(f, "active"),
        }
    }
}

/// Events emitted by a [`ServiceWorker`](crate::ServiceWorker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwEvent {
    /// State changed.
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// The installed version asked to take over without a grace period.
    SkipWaiting { version: String },
    /// Existing clients are now controlled by `version`.
    ClientsClaimed { version: String, count: usize },
    /// A stale store was removed during activation.
    CacheDeleted { name: String },
    /// A background write was dropped.
    CacheWriteFailed { url: String, reason: String },
}
