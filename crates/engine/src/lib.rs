//! polity-engine: decides what happens to governed actions.
//!
//! An integration hands an action to [`Engine::propose_and_evaluate`]. The
//! selector finds the policy that claims it, and the engine drives that
//! policy's stages through the sandbox:
//! filter, initialize, check, then success or fail, revert, notify.
//! Proposals left pending are picked up again by the [`Scheduler`].
//!
//! # Public API
//!
//! - [`Engine`] -- selection and the per-proposal state machine
//! - [`Scheduler`] -- periodic re-evaluation of pending proposals
//! - [`EngineConfig`] -- TOML configuration
//! - [`PlatformAdapter`] / [`PlatformRegistry`] -- connected platforms
//! - [`GovernanceService`] -- external governance processes
//! - [`EngineError`] -- everything evaluation can fail with

use std::sync::Arc;

use polity_storage::PolicyStore;

pub mod action;
pub mod audit;
pub mod config;
pub mod constitution;
pub mod context;
pub mod engine;
pub mod error;
pub mod governance;
pub mod platform;
pub mod scheduler;

mod host;
mod selector;

// ── Convenience re-exports ───────────────────────────────────────────

pub use audit::AuditLogger;
pub use config::{EngineConfig, EngineSettings, GovernanceConfig, SchedulerConfig};
pub use context::EvaluationContext;
pub use engine::{coerce_check_result, Engine, ProposalLocks};
pub use error::{ConfigError, EngineError};
pub use governance::{
    DisabledGovernance, GovernanceError, GovernanceService, HttpGovernanceService, ProcessClient,
    ProcessData, ProcessStatus, StartedProcess,
};
pub use platform::{PlatformAdapter, PlatformError, PlatformRegistry};
pub use scheduler::{Scheduler, SweepReport};

/// The collaborators an evaluation reaches through its context objects.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn PolicyStore>,
    pub platforms: Arc<PlatformRegistry>,
    pub governance: Arc<dyn GovernanceService>,
}
