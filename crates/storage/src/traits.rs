use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    ActionId, ActionRecord, ActivityRecord, CommunityId, EvaluationLogRecord, PolicyDraft, PolicyId,
    PolicyKind, PolicyRecord, ProposalId, ProposalRecord, ProposalStatus,
};

/// Which policies [`PolicyStore::list_policies`] returns.
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub community: Option<CommunityId>,
    pub kind: Option<PolicyKind>,
    pub active: Option<bool>,
}

impl PolicyFilter {
    /// Active policies of one kind in one community.
    pub fn active(community: CommunityId, kind: PolicyKind) -> Self {
        PolicyFilter {
            community: Some(community),
            kind: Some(kind),
            active: Some(true),
        }
    }

    pub fn matches(&self, p: &PolicyRecord) -> bool {
        self.community.map_or(true, |c| p.community == c)
            && self.kind.map_or(true, |k| p.kind == k)
            && self.active.map_or(true, |a| p.is_active == a)
    }
}

/// Which proposals [`PolicyStore::list_proposals`] returns.
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<ProposalStatus>,
    pub action: Option<ActionId>,
    pub policy: Option<PolicyId>,
}

impl ProposalFilter {
    pub fn status(status: ProposalStatus) -> Self {
        ProposalFilter {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, p: &ProposalRecord) -> bool {
        self.status.map_or(true, |s| p.status == s)
            && self.action.map_or(true, |a| p.action == a)
            && self.policy.map_or(true, |id| p.policy == Some(id))
    }
}

/// The record store the engine evaluates against.
///
/// ## Identity
///
/// `insert_action` and `insert_proposal` assign the record's permanent id and
/// return the stored record. An id already set on the incoming record is
/// overwritten.
///
/// ## OCC Conflict Detection
///
/// Every record carries a `version`. `update_*` succeeds only when the stored
/// version equals the version of the record passed in, and returns the
/// stored record with the version incremented. Otherwise it returns
/// `Err(StorageError::ConcurrentConflict { .. })`.
///
/// ## Ordering
///
/// `list_policies` returns the most recently modified policy first. Policies
/// modified at the same instant are ordered by descending id, so the newer
/// policy wins a tie.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so the scheduler can share
/// one store with inline evaluations.
pub trait PolicyStore: Send + Sync + 'static {
    // ── Actions ──────────────────────────────────────────────────────────────

    fn insert_action(&self, action: ActionRecord) -> Result<ActionRecord, StorageError>;

    fn get_action(&self, id: ActionId) -> Result<Option<ActionRecord>, StorageError>;

    fn update_action(&self, action: &ActionRecord) -> Result<ActionRecord, StorageError>;

    // ── Policies ─────────────────────────────────────────────────────────────

    fn insert_policy(
        &self,
        community: CommunityId,
        draft: PolicyDraft,
        modified_at: OffsetDateTime,
    ) -> Result<PolicyRecord, StorageError>;

    fn get_policy(&self, id: PolicyId) -> Result<Option<PolicyRecord>, StorageError>;

    fn update_policy(&self, policy: &PolicyRecord) -> Result<PolicyRecord, StorageError>;

    /// Remove a policy permanently. Proposals that referenced it keep
    /// existing with their policy cleared.
    fn delete_policy(&self, id: PolicyId) -> Result<(), StorageError>;

    fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PolicyRecord>, StorageError>;

    // ── Proposals ────────────────────────────────────────────────────────────

    fn insert_proposal(&self, proposal: ProposalRecord) -> Result<ProposalRecord, StorageError>;

    fn get_proposal(&self, id: ProposalId) -> Result<Option<ProposalRecord>, StorageError>;

    fn update_proposal(&self, proposal: &ProposalRecord) -> Result<ProposalRecord, StorageError>;

    /// Returns whether a proposal was removed.
    fn delete_proposal(&self, id: ProposalId) -> Result<bool, StorageError>;

    /// Matching proposals in ascending id order.
    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<ProposalRecord>, StorageError>;

    // ── Audit trail ──────────────────────────────────────────────────────────

    fn append_log(&self, entry: EvaluationLogRecord) -> Result<(), StorageError>;

    /// Log entries for a proposal, oldest first.
    fn logs_for_proposal(&self, id: ProposalId) -> Result<Vec<EvaluationLogRecord>, StorageError>;

    fn logs_for_community(
        &self,
        community: CommunityId,
    ) -> Result<Vec<EvaluationLogRecord>, StorageError>;

    fn record_activity(&self, activity: ActivityRecord) -> Result<(), StorageError>;

    fn activity_for_action(&self, id: ActionId) -> Result<Vec<ActivityRecord>, StorageError>;
}
