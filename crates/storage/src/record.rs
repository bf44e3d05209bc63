use std::collections::BTreeSet;
use std::fmt;

use polity_core::Stage;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use time::OffsetDateTime;

/// Free-form JSON object used for scratch data stores.
pub type DataMap = Map<String, serde_json::Value>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ActionId);
id_type!(PolicyId);
id_type!(ProposalId);
id_type!(CommunityId);

// ── Actions ─────────────────────────────────────────────────────────────────

/// Which policies may govern a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Platform,
    Constitution,
    Trigger,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Platform => "platform",
            PolicyKind::Constitution => "constitution",
            PolicyKind::Trigger => "trigger",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stage bodies and metadata of a policy, as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub kind: PolicyKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stages: StageCode,
    #[serde(default)]
    pub action_types: BTreeSet<String>,
    #[serde(default)]
    pub variables: DataMap,
}

impl PolicyDraft {
    pub fn new(kind: PolicyKind, name: impl Into<String>) -> Self {
        PolicyDraft {
            kind,
            name: name.into(),
            description: String::new(),
            stages: StageCode::default(),
            action_types: BTreeSet::new(),
            variables: DataMap::new(),
        }
    }

    pub fn stage(mut self, stage: Stage, code: impl Into<String>) -> Self {
        self.stages.set(stage, code);
        self
    }

    pub fn action_type(mut self, action_type: impl Into<String>) -> Self {
        self.action_types.insert(action_type.into());
        self
    }
}

/// A change to the community's set of policies, carried by constitution
/// actions and applied when the action executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ConstitutionChange {
    AddPolicy { draft: PolicyDraft },
    ChangePolicy { policy: PolicyId, draft: PolicyDraft },
    RemovePolicy { policy: PolicyId },
    RecoverPolicy { policy: PolicyId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Something done on (or through) a connected platform.
    Platform,
    Constitution { change: ConstitutionChange },
    /// Notification that something happened. `executed_action` is set when
    /// the trigger reports that a governable action was executed.
    Trigger { executed_action: Option<ActionId> },
}

impl ActionKind {
    pub fn policy_kind(&self) -> PolicyKind {
        match self {
            ActionKind::Platform => PolicyKind::Platform,
            ActionKind::Constitution { .. } => PolicyKind::Constitution,
            ActionKind::Trigger { .. } => PolicyKind::Trigger,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Initiator {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// The platform community an action belongs to, and the parent community
/// that owns the policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityRef {
    pub community: CommunityId,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// `None` until the action passes some policy's filter.
    pub id: Option<ActionId>,
    pub version: i64,
    pub kind: ActionKind,
    pub action_type: String,
    pub initiator: Option<Initiator>,
    pub community: CommunityRef,
    /// The action first happened on the external platform.
    pub community_origin: bool,
    /// The action has been reverted on the external platform.
    pub community_revert: bool,
    pub executed: bool,
    /// Platform-specific fields, readable as attributes by policy code.
    #[serde(default)]
    pub payload: DataMap,
    #[serde(default)]
    pub data: DataMap,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ActionRecord {
    pub fn new(kind: ActionKind, action_type: impl Into<String>, community: CommunityRef) -> Self {
        ActionRecord {
            id: None,
            version: 0,
            kind,
            action_type: action_type.into(),
            initiator: None,
            community,
            community_origin: false,
            community_revert: false,
            executed: false,
            payload: DataMap::new(),
            data: DataMap::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, ActionKind::Trigger { .. })
    }

    /// Whether `execute` may act on this record right now.
    pub fn is_executable(&self) -> bool {
        match self.kind {
            ActionKind::Trigger { .. } => false,
            ActionKind::Constitution { .. } => true,
            ActionKind::Platform => !self.community_origin || self.community_revert,
        }
    }

    /// Whether the action happened on the platform and can be held there.
    pub fn is_reversible(&self) -> bool {
        matches!(self.kind, ActionKind::Platform) && self.community_origin
    }
}

// ── Policies ────────────────────────────────────────────────────────────────

/// The six stage bodies of a policy. An empty body behaves as `pass`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCode {
    pub filter: String,
    pub initialize: String,
    pub check: String,
    pub notify: String,
    pub success: String,
    pub fail: String,
}

impl StageCode {
    pub fn get(&self, stage: Stage) -> &str {
        match stage {
            Stage::Filter => &self.filter,
            Stage::Initialize => &self.initialize,
            Stage::Check => &self.check,
            Stage::Notify => &self.notify,
            Stage::Success => &self.success,
            Stage::Fail => &self.fail,
        }
    }

    pub fn set(&mut self, stage: Stage, code: impl Into<String>) {
        let slot = match stage {
            Stage::Filter => &mut self.filter,
            Stage::Initialize => &mut self.initialize,
            Stage::Check => &mut self.check,
            Stage::Notify => &mut self.notify,
            Stage::Success => &mut self.success,
            Stage::Fail => &mut self.fail,
        };
        *slot = code.into();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub version: i64,
    pub community: CommunityId,
    pub kind: PolicyKind,
    pub name: String,
    pub description: String,
    pub stages: StageCode,
    /// Empty on a platform or constitution policy means the base policy.
    pub action_types: BTreeSet<String>,
    pub variables: DataMap,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

impl PolicyRecord {
    pub fn is_base_policy(&self) -> bool {
        self.kind != PolicyKind::Trigger && self.action_types.is_empty()
    }

    /// Whether this policy is a candidate for an action of the given type.
    pub fn applies_to(&self, action_type: &str) -> bool {
        self.action_types.contains(action_type) || self.is_base_policy()
    }

    /// Overwrite the authored fields from a draft.
    pub fn apply_draft(&mut self, draft: PolicyDraft) {
        self.kind = draft.kind;
        self.name = draft.name;
        self.description = draft.description;
        self.stages = draft.stages;
        self.action_types = draft.action_types;
        self.variables = draft.variables;
    }
}

// ── Proposals ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Passed,
    Failed,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ProposalStatus::Proposed
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally hosted governance process a proposal delegated to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceProcessRef {
    pub location: String,
    /// Last process document the service returned.
    pub last_known: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: Option<ProposalId>,
    pub version: i64,
    pub status: ProposalStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub proposal_time: OffsetDateTime,
    pub action: ActionId,
    /// Cleared when the policy is deleted.
    pub policy: Option<PolicyId>,
    #[serde(default)]
    pub data: DataMap,
    pub governance_process: Option<GovernanceProcessRef>,
    /// Identifier of the platform post announcing the proposal.
    pub community_post: Option<String>,
}

impl ProposalRecord {
    pub fn new(action: ActionId, policy: PolicyId) -> Self {
        ProposalRecord {
            id: None,
            version: 0,
            status: ProposalStatus::Proposed,
            proposal_time: OffsetDateTime::now_utc(),
            action,
            policy: Some(policy),
            data: DataMap::new(),
            governance_process: None,
            community_post: None,
        }
    }
}

// ── Audit trail ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// One durable audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationLogRecord {
    pub community: CommunityId,
    pub proposal: Option<ProposalId>,
    pub level: LogLevel,
    pub message: String,
    pub trace: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A notable step in an action's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub action: ActionId,
    pub community: CommunityId,
    pub action_type: String,
    /// `was proposed`, `was passed` or `was failed`.
    pub verb: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(origin: bool, revert: bool) -> ActionRecord {
        let mut a = ActionRecord::new(
            ActionKind::Platform,
            "slackpostmessage",
            CommunityRef {
                community: CommunityId(1),
                platform: "slack".into(),
            },
        );
        a.community_origin = origin;
        a.community_revert = revert;
        a
    }

    #[test]
    fn executability_table() {
        assert!(platform(false, false).is_executable());
        assert!(platform(false, true).is_executable());
        assert!(!platform(true, false).is_executable());
        assert!(platform(true, true).is_executable());

        let mut trigger = platform(false, false);
        trigger.kind = ActionKind::Trigger { executed_action: None };
        assert!(!trigger.is_executable());
        assert!(!trigger.is_reversible());

        let mut constitution = platform(true, false);
        constitution.kind = ActionKind::Constitution {
            change: ConstitutionChange::RemovePolicy { policy: PolicyId(1) },
        };
        assert!(constitution.is_executable());
        assert!(!constitution.is_reversible());
    }

    #[test]
    fn reversible_only_when_platform_origin() {
        assert!(platform(true, false).is_reversible());
        assert!(!platform(false, false).is_reversible());
    }

    #[test]
    fn trigger_policies_have_no_wildcard() {
        let mut p = PolicyRecord {
            id: PolicyId(1),
            version: 0,
            community: CommunityId(1),
            kind: PolicyKind::Trigger,
            name: "t".into(),
            description: String::new(),
            stages: StageCode::default(),
            action_types: BTreeSet::new(),
            variables: DataMap::new(),
            is_active: true,
            modified_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(!p.applies_to("anything"));
        p.kind = PolicyKind::Platform;
        assert!(p.applies_to("anything"));
    }

    #[test]
    fn constitution_change_wire_shape() {
        let change = ConstitutionChange::RemovePolicy { policy: PolicyId(7) };
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            serde_json::json!({"change": "remove_policy", "policy": 7})
        );
    }
}
