//! The durable evaluation log policy authors read.

use std::sync::Arc;

use polity_sandbox::{CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{CommunityId, EvaluationLogRecord, LogLevel, PolicyStore, ProposalId};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// Writes [`EvaluationLogRecord`]s for one community, optionally tied to a
/// proposal, and mirrors every entry to `tracing`.
///
/// Without a proposal, entries from policy code go to `tracing` only; the
/// engine's own entries are still stored at community level.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn PolicyStore>,
    community: CommunityId,
    proposal: Option<ProposalId>,
}

impl AuditLogger {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        community: CommunityId,
        proposal: Option<ProposalId>,
    ) -> Self {
        AuditLogger {
            store,
            community,
            proposal,
        }
    }

    pub fn proposal(&self) -> Option<ProposalId> {
        self.proposal
    }

    /// Store and mirror one entry. A failed write is reported to `tracing`
    /// and otherwise ignored.
    pub fn log(&self, level: LogLevel, message: &str, trace: Option<String>) {
        self.mirror(level, message);
        self.persist(level, message, trace);
    }

    fn persist(&self, level: LogLevel, message: &str, trace: Option<String>) {
        let entry = EvaluationLogRecord {
            community: self.community,
            proposal: self.proposal,
            level,
            message: message.to_string(),
            trace,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.append_log(entry) {
            warn!(community = %self.community, error = %e, "failed to write evaluation log");
        }
    }

    fn mirror(&self, level: LogLevel, message: &str) {
        let community = self.community.0;
        let proposal = self.proposal.map(|p| p.0);
        match level {
            LogLevel::Debug => debug!(community, proposal, "{}", message),
            LogLevel::Info => info!(community, proposal, "{}", message),
            LogLevel::Warning => warn!(community, proposal, "{}", message),
            LogLevel::Error => error!(community, proposal, "{}", message),
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message, None);
    }

    pub fn error(&self, message: &str, trace: Option<String>) {
        self.log(LogLevel::Error, message, trace);
    }
}

impl HostObject for AuditLogger {
    fn type_name(&self) -> &str {
        "Logger"
    }

    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "debug" | "info" | "warning" | "error")
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        args.no_keywords(name)?;
        args.at_most(1, name)?;
        let level = match name {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => {
                return Err(RuntimeError::attribute_error(format!(
                    "'Logger' object has no method '{}'",
                    name
                )))
            }
        };
        let message = args.require(0, "msg", name)?.to_display();
        self.mirror(level, &message);
        if self.proposal.is_some() {
            self.persist(level, &message, None);
        }
        Ok(Value::None)
    }
}
