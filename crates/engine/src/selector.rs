//! Finding the policy that governs an action.
//!
//! Candidates are the active policies of the action's kind whose action
//! types name the action's type (or, for platform and constitution
//! policies, list none), most recently modified first. A trigger is
//! evaluated against every candidate whose filter passes. A governable
//! action is claimed by the first candidate whose filter passes and whose
//! first evaluation completes; a candidate whose evaluation errors is
//! dropped in favour of the next one.

use polity_core::Stage;
use polity_storage::{
    ActionId, ActionRecord, PolicyFilter, PolicyKind, PolicyRecord, ProposalRecord, StorageError,
};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::context::EvaluationContext;
use crate::engine::Engine;
use crate::error::EngineError;

impl Engine {
    /// Select and evaluate the policies governing `action`, returning the
    /// proposals that remain afterwards.
    ///
    /// The action is stored only once some policy's filter accepts it. A
    /// governable action with no candidate policy at all is an error; one
    /// whose candidates all decline or fail returns no proposals.
    pub fn propose_and_evaluate(
        &self,
        mut action: ActionRecord,
    ) -> Result<Vec<ProposalRecord>, EngineError> {
        let candidates = self.candidates(&action)?;
        if candidates.is_empty() {
            if action.is_trigger() {
                debug!(action_type = %action.action_type, "no trigger policy for action");
                return Ok(Vec::new());
            }
            return Err(EngineError::NoEligiblePolicy {
                kind: action.kind.policy_kind().to_string(),
                action_type: action.action_type.clone(),
            });
        }

        if action.is_trigger() {
            self.evaluate_trigger(&mut action, &candidates)
        } else {
            self.evaluate_governable(&mut action, &candidates)
        }
    }

    /// Delete a stale proposal and select again for its action.
    ///
    /// Trigger proposals are only deleted: every other trigger policy
    /// already has its own proposal for the action.
    pub fn delete_and_rerun(
        &self,
        proposal: &ProposalRecord,
    ) -> Result<Vec<ProposalRecord>, EngineError> {
        if let Some(id) = proposal.id {
            self.store().delete_proposal(id)?;
        }
        let action = self
            .store()
            .get_action(proposal.action)?
            .ok_or(EngineError::ActionNotFound(proposal.action))?;
        if action.is_trigger() {
            return Ok(Vec::new());
        }
        info!(action = %proposal.action, "restarting policy selection");
        self.propose_and_evaluate(action)
    }

    fn candidates(&self, action: &ActionRecord) -> Result<Vec<PolicyRecord>, EngineError> {
        let kind = action.kind.policy_kind();
        let filter = PolicyFilter::active(action.community.community, kind);
        let policies = self.store().list_policies(&filter)?;
        Ok(policies
            .into_iter()
            .filter(|p| match kind {
                PolicyKind::Trigger => p.action_types.contains(&action.action_type),
                _ => p.applies_to(&action.action_type),
            })
            .collect())
    }

    /// Whether `policy`'s filter accepts `action`. A filter that raises
    /// declines, and the error goes to the community's evaluation log.
    fn passes_filter(&self, action: &ActionRecord, policy: &PolicyRecord) -> bool {
        let result = EvaluationContext::build(&self.services, action, policy, None)
            .and_then(|ctx| self.run_stage(&ctx, policy, Stage::Filter));
        match result {
            Ok(v) => v.truthy(),
            Err(e) => {
                AuditLogger::new(self.services.store.clone(), action.community.community, None)
                    .error(
                        &format!("Exception in 'filter' of policy '{}': {}", policy.name, e),
                        None,
                    );
                false
            }
        }
    }

    fn save_action(&self, action: &mut ActionRecord) -> Result<ActionId, EngineError> {
        if let Some(id) = action.id {
            return Ok(id);
        }
        *action = self.store().insert_action(action.clone())?;
        action
            .id
            .ok_or(EngineError::Storage(StorageError::Unsaved { entity: "action" }))
    }

    fn open_proposal(
        &self,
        action: &mut ActionRecord,
        policy: &PolicyRecord,
    ) -> Result<ProposalRecord, EngineError> {
        let action_id = self.save_action(action)?;
        let proposal = self
            .store()
            .insert_proposal(ProposalRecord::new(action_id, policy.id))?;
        debug!(action = %action_id, policy = %policy.id, proposal = ?proposal.id, "opened proposal");
        Ok(proposal)
    }

    fn evaluate_trigger(
        &self,
        action: &mut ActionRecord,
        candidates: &[PolicyRecord],
    ) -> Result<Vec<ProposalRecord>, EngineError> {
        let mut out = Vec::new();
        for policy in candidates {
            if !self.passes_filter(action, policy) {
                continue;
            }
            let proposal = self.open_proposal(action, policy)?;
            let Some(id) = proposal.id else { continue };
            match self.evaluate_proposal(id, true) {
                Ok(_) => {
                    if let Some(p) = self.store().get_proposal(id)? {
                        out.push(p);
                    }
                }
                Err(e) => {
                    warn!(proposal = %id, policy = %policy.id, error = %e, "trigger evaluation failed, deleting proposal");
                    self.store().delete_proposal(id)?;
                }
            }
        }
        Ok(out)
    }

    fn evaluate_governable(
        &self,
        action: &mut ActionRecord,
        candidates: &[PolicyRecord],
    ) -> Result<Vec<ProposalRecord>, EngineError> {
        for policy in candidates {
            if !self.passes_filter(action, policy) {
                continue;
            }
            let proposal = self.open_proposal(action, policy)?;
            let Some(id) = proposal.id else { continue };
            match self.evaluate_proposal(id, true) {
                Ok(_) => {
                    return Ok(self.store().get_proposal(id)?.into_iter().collect());
                }
                Err(e) => {
                    warn!(proposal = %id, policy = %policy.id, error = %e, "evaluation failed, trying the next policy");
                    self.store().delete_proposal(id)?;
                }
            }
        }
        AuditLogger::new(self.services.store.clone(), action.community.community, None).warning(
            &format!(
                "no policy accepted {} action {}",
                action.action_type,
                action.id.map_or_else(|| "(unsaved)".to_string(), |id| id.to_string())
            ),
        );
        Ok(Vec::new())
    }
}
