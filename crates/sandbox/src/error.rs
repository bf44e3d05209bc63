use polity_core::Stage;

/// Errors returned by [`crate::Sandbox::run`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    /// The source failed to parse or used something outside the allow-lists.
    /// Nothing was executed.
    #[error("non-whitelisted code in {stage} stage: {}", diagnostics.join("; "))]
    NotWhitelisted {
        stage: Stage,
        diagnostics: Vec<String>,
    },

    /// The code raised while running.
    #[error("{message}")]
    PolicyCode {
        stage: Stage,
        kind: String,
        line: u32,
        message: String,
    },
}

impl SandboxError {
    pub fn stage(&self) -> Stage {
        match self {
            SandboxError::NotWhitelisted { stage, .. } | SandboxError::PolicyCode { stage, .. } => *stage,
        }
    }
}
