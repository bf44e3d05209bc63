use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    ActionId, ActionRecord, ActivityRecord, CommunityId, EvaluationLogRecord, PolicyDraft, PolicyId,
    PolicyRecord, ProposalId, ProposalRecord,
};
use crate::traits::{PolicyFilter, PolicyStore, ProposalFilter};

#[derive(Default)]
struct Tables {
    next_id: u64,
    actions: BTreeMap<ActionId, ActionRecord>,
    policies: BTreeMap<PolicyId, PolicyRecord>,
    proposals: BTreeMap<ProposalId, ProposalRecord>,
    logs: Vec<EvaluationLogRecord>,
    activity: Vec<ActivityRecord>,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A process-local store. Every call takes one lock, so each call is atomic
/// with respect to the others.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))
    }
}

/// Version-checked replace shared by the `update_*` methods.
fn replace<K: Ord + Copy, R: Clone>(
    table: &mut BTreeMap<K, R>,
    entity: &'static str,
    key: K,
    raw: u64,
    incoming: &R,
    version_of: impl Fn(&R) -> i64,
    bump: impl Fn(&mut R, i64),
) -> Result<R, StorageError> {
    let stored = table
        .get_mut(&key)
        .ok_or(StorageError::NotFound { entity, id: raw })?;
    let expected = version_of(incoming);
    if version_of(stored) != expected {
        return Err(StorageError::ConcurrentConflict {
            entity,
            id: raw,
            expected_version: expected,
        });
    }
    let mut next = incoming.clone();
    bump(&mut next, expected + 1);
    *stored = next.clone();
    Ok(next)
}

impl PolicyStore for InMemoryStore {
    fn insert_action(&self, mut action: ActionRecord) -> Result<ActionRecord, StorageError> {
        let mut t = self.lock()?;
        let id = ActionId(t.allocate());
        action.id = Some(id);
        action.version = 0;
        t.actions.insert(id, action.clone());
        Ok(action)
    }

    fn get_action(&self, id: ActionId) -> Result<Option<ActionRecord>, StorageError> {
        Ok(self.lock()?.actions.get(&id).cloned())
    }

    fn update_action(&self, action: &ActionRecord) -> Result<ActionRecord, StorageError> {
        let id = action.id.ok_or(StorageError::Unsaved { entity: "action" })?;
        let mut t = self.lock()?;
        replace(
            &mut t.actions,
            "action",
            id,
            id.0,
            action,
            |a| a.version,
            |a, v| a.version = v,
        )
    }

    fn insert_policy(
        &self,
        community: CommunityId,
        draft: PolicyDraft,
        modified_at: OffsetDateTime,
    ) -> Result<PolicyRecord, StorageError> {
        let mut t = self.lock()?;
        let id = PolicyId(t.allocate());
        let policy = PolicyRecord {
            id,
            version: 0,
            community,
            kind: draft.kind,
            name: draft.name,
            description: draft.description,
            stages: draft.stages,
            action_types: draft.action_types,
            variables: draft.variables,
            is_active: true,
            modified_at,
        };
        t.policies.insert(id, policy.clone());
        Ok(policy)
    }

    fn get_policy(&self, id: PolicyId) -> Result<Option<PolicyRecord>, StorageError> {
        Ok(self.lock()?.policies.get(&id).cloned())
    }

    fn update_policy(&self, policy: &PolicyRecord) -> Result<PolicyRecord, StorageError> {
        let mut t = self.lock()?;
        replace(
            &mut t.policies,
            "policy",
            policy.id,
            policy.id.0,
            policy,
            |p| p.version,
            |p, v| p.version = v,
        )
    }

    fn delete_policy(&self, id: PolicyId) -> Result<(), StorageError> {
        let mut t = self.lock()?;
        if t.policies.remove(&id).is_none() {
            return Err(StorageError::NotFound {
                entity: "policy",
                id: id.0,
            });
        }
        for proposal in t.proposals.values_mut().filter(|p| p.policy == Some(id)) {
            proposal.policy = None;
            proposal.version += 1;
        }
        Ok(())
    }

    fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PolicyRecord>, StorageError> {
        let t = self.lock()?;
        let mut out: Vec<PolicyRecord> = t
            .policies
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    fn insert_proposal(&self, mut proposal: ProposalRecord) -> Result<ProposalRecord, StorageError> {
        let mut t = self.lock()?;
        let id = ProposalId(t.allocate());
        proposal.id = Some(id);
        proposal.version = 0;
        t.proposals.insert(id, proposal.clone());
        Ok(proposal)
    }

    fn get_proposal(&self, id: ProposalId) -> Result<Option<ProposalRecord>, StorageError> {
        Ok(self.lock()?.proposals.get(&id).cloned())
    }

    fn update_proposal(&self, proposal: &ProposalRecord) -> Result<ProposalRecord, StorageError> {
        let id = proposal
            .id
            .ok_or(StorageError::Unsaved { entity: "proposal" })?;
        let mut t = self.lock()?;
        replace(
            &mut t.proposals,
            "proposal",
            id,
            id.0,
            proposal,
            |p| p.version,
            |p, v| p.version = v,
        )
    }

    fn delete_proposal(&self, id: ProposalId) -> Result<bool, StorageError> {
        Ok(self.lock()?.proposals.remove(&id).is_some())
    }

    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<ProposalRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.proposals
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    fn append_log(&self, entry: EvaluationLogRecord) -> Result<(), StorageError> {
        self.lock()?.logs.push(entry);
        Ok(())
    }

    fn logs_for_proposal(&self, id: ProposalId) -> Result<Vec<EvaluationLogRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.logs
            .iter()
            .filter(|l| l.proposal == Some(id))
            .cloned()
            .collect())
    }

    fn logs_for_community(
        &self,
        community: CommunityId,
    ) -> Result<Vec<EvaluationLogRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.logs
            .iter()
            .filter(|l| l.community == community)
            .cloned()
            .collect())
    }

    fn record_activity(&self, activity: ActivityRecord) -> Result<(), StorageError> {
        self.lock()?.activity.push(activity);
        Ok(())
    }

    fn activity_for_action(&self, id: ActionId) -> Result<Vec<ActivityRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.activity.iter().filter(|a| a.action == id).cloned().collect())
    }
}
