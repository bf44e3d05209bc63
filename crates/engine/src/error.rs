use std::path::PathBuf;

use polity_core::Stage;
use polity_sandbox::SandboxError;
use polity_storage::{ActionId, PolicyId, ProposalId, StorageError};

use crate::governance::GovernanceError;
use crate::platform::PlatformError;

/// Errors surfaced by selection and evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A governable action matched no active policy. Every community is
    /// expected to carry a base policy for each governable kind.
    #[error("no eligible {kind} policy for action type '{action_type}'")]
    NoEligiblePolicy { kind: String, action_type: String },

    #[error("proposal {0} not found")]
    ProposalNotFound(ProposalId),

    #[error("action {0} not found")]
    ActionNotFound(ActionId),

    #[error("policy for proposal {proposal} was deleted")]
    PolicyDeleted { proposal: ProposalId },

    #[error("policy {policy} is not active")]
    PolicyInactive { policy: PolicyId },

    #[error("proposal {proposal} does not pass the filter of policy {policy}")]
    DoesNotPassFilter {
        proposal: ProposalId,
        policy: PolicyId,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A constitution change carried policy code that does not lint.
    #[error("policy '{name}' has invalid code: {}", diagnostics.join("; "))]
    InvalidPolicyCode {
        name: String,
        diagnostics: Vec<String>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("governance error: {0}")]
    Governance(#[from] GovernanceError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl EngineError {
    /// The proposal points at a policy that can no longer govern it. The
    /// recovery is to delete the proposal and select again.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            EngineError::PolicyDeleted { .. }
                | EngineError::PolicyInactive { .. }
                | EngineError::DoesNotPassFilter { .. }
        )
    }

    /// Stage the error is attributed to, when it came from policy code.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineError::Sandbox(e) => Some(e.stage()),
            _ => None,
        }
    }
}

/// Errors loading an [`EngineConfig`](crate::EngineConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_errors_are_recognised() {
        assert!(EngineError::PolicyDeleted {
            proposal: ProposalId(1)
        }
        .is_stale());
        assert!(EngineError::PolicyInactive {
            policy: PolicyId(2)
        }
        .is_stale());
        assert!(!EngineError::ActionNotFound(ActionId(3)).is_stale());
    }

    #[test]
    fn policy_code_errors_keep_their_stage() {
        let err = EngineError::from(SandboxError::PolicyCode {
            stage: Stage::Initialize,
            kind: "Exception".into(),
            line: 1,
            message: "Exception at line 1 of initialize: boom".into(),
        });
        assert_eq!(err.stage(), Some(Stage::Initialize));
        assert_eq!(err.to_string(), "Exception at line 1 of initialize: boom");
    }
}
