//! The per-proposal state machine.
//!
//! A proposal starts `proposed` and ends `passed` or `failed`. Each call to
//! [`Engine::evaluate_proposal`] runs one pass:
//!
//! 1. resolve the policy; a deleted or inactive policy is a stale reference
//! 2. filter (must still pass), then initialize on the first pass
//! 3. check, coerced to `passed`, `failed` or `proposed`
//! 4. success and transition to `passed` (executing the action), or fail
//!    and transition to `failed`; either closes an attached governance process
//! 5. on the first pass, hold a platform-origin action by reverting it unless
//!    it passed
//! 6. on the first pass, if still `proposed`, record the proposal and notify
//!
//! Errors from steps 2 to 6, other than the filter no longer passing, are
//! written to the proposal's evaluation log and returned.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use polity_core::Stage;
use polity_sandbox::{Sandbox, Value};
use polity_storage::{
    ActionId, ActionKind, ActionRecord, ActivityRecord, PolicyRecord, PolicyStore, ProposalId,
    ProposalRecord, ProposalStatus,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::action;
use crate::config::{EngineConfig, EngineSettings};
use crate::context::EvaluationContext;
use crate::error::EngineError;
use crate::governance::{GovernanceService, ProcessClient};
use crate::host::modify_proposal;
use crate::platform::PlatformRegistry;
use crate::Services;

/// Interpret a check-stage return value. Anything other than the `passed`
/// and `failed` sentinels leaves the proposal pending.
pub fn coerce_check_result(value: &Value) -> ProposalStatus {
    match value.as_str() {
        Some("passed") => ProposalStatus::Passed,
        Some("failed") => ProposalStatus::Failed,
        _ => ProposalStatus::Proposed,
    }
}

/// One mutex per proposal being evaluated in this process.
#[derive(Default)]
pub struct ProposalLocks {
    slots: Mutex<BTreeMap<ProposalId, Arc<Mutex<()>>>>,
}

impl ProposalLocks {
    /// The mutex for `id`. Slots nobody holds are dropped on the way.
    pub fn slot(&self, id: ProposalId) -> Result<Arc<Mutex<()>>, EngineError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| EngineError::LockPoisoned("proposal table"))?;
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        Ok(Arc::clone(slots.entry(id).or_default()))
    }
}

pub struct Engine {
    pub(crate) services: Services,
    pub(crate) sandbox: Sandbox,
    pub(crate) settings: EngineSettings,
    locks: ProposalLocks,
}

impl Engine {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        platforms: PlatformRegistry,
        governance: Arc<dyn GovernanceService>,
    ) -> Self {
        Engine {
            services: Services {
                store,
                platforms: Arc::new(platforms),
                governance,
            },
            sandbox: Sandbox::default(),
            settings: EngineSettings::default(),
            locks: ProposalLocks::default(),
        }
    }

    /// An engine with the sandbox limits, settings and governance service
    /// `config` describes.
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn PolicyStore>,
        platforms: PlatformRegistry,
    ) -> Self {
        Engine::new(store, platforms, config.governance_service())
            .with_sandbox(Sandbox::new(config.sandbox))
            .with_settings(config.engine.clone())
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn store(&self) -> &dyn PolicyStore {
        self.services.store.as_ref()
    }

    /// Run one evaluation pass over a stored proposal and return its status
    /// afterwards. A proposal that is already terminal is left alone.
    pub fn evaluate_proposal(
        &self,
        id: ProposalId,
        is_first_evaluation: bool,
    ) -> Result<ProposalStatus, EngineError> {
        let slot = self.locks.slot(id)?;
        let held = slot
            .lock()
            .map_err(|_| EngineError::LockPoisoned("proposal"))?;

        let store = self.store();
        let proposal = store
            .get_proposal(id)?
            .ok_or(EngineError::ProposalNotFound(id))?;
        if proposal.status.is_terminal() {
            debug!(proposal = %id, status = %proposal.status, "proposal already decided");
            return Ok(proposal.status);
        }
        let policy_id = proposal
            .policy
            .ok_or(EngineError::PolicyDeleted { proposal: id })?;
        let policy = store
            .get_policy(policy_id)?
            .ok_or(EngineError::PolicyDeleted { proposal: id })?;
        if !policy.is_active {
            return Err(EngineError::PolicyInactive { policy: policy.id });
        }
        let action = store
            .get_action(proposal.action)?
            .ok_or(EngineError::ActionNotFound(proposal.action))?;

        let ctx = EvaluationContext::build(&self.services, &action, &policy, Some(&proposal))?;
        let outcome = self.run_pass(&ctx, id, &proposal, &policy, &action, is_first_evaluation);
        drop(held);

        if let Err(e) = &outcome {
            if !matches!(e, EngineError::DoesNotPassFilter { .. }) {
                let trace = e.stage().map(|stage| {
                    format!(
                        "{} stage of policy '{}':\n{}",
                        stage,
                        policy.name,
                        policy.stages.get(stage)
                    )
                });
                ctx.logger().error(
                    &format!(
                        "Error evaluating policy '{}' ({}) for {} action {}: {}",
                        policy.name, policy.id, action.action_type, proposal.action, e
                    ),
                    trace,
                );
            }
        }

        if self.settings.emit_executed_action_triggers {
            for executed in ctx.executed() {
                self.fire_executed_trigger(executed);
            }
        }
        outcome
    }

    fn run_pass(
        &self,
        ctx: &EvaluationContext,
        id: ProposalId,
        proposal: &ProposalRecord,
        policy: &PolicyRecord,
        action: &ActionRecord,
        first: bool,
    ) -> Result<ProposalStatus, EngineError> {
        let action_id = proposal.action;

        if !self.run_stage(ctx, policy, Stage::Filter)?.truthy() {
            return Err(EngineError::DoesNotPassFilter {
                proposal: id,
                policy: policy.id,
            });
        }
        if first {
            self.run_stage(ctx, policy, Stage::Initialize)?;
        }

        let check = coerce_check_result(&self.run_stage(ctx, policy, Stage::Check)?);
        if first || check != ProposalStatus::Proposed {
            ctx.logger().debug(&format!(
                "Evaluating Proposal {}, check returned {}",
                id,
                check.as_str().to_uppercase()
            ));
        }

        match check {
            ProposalStatus::Passed => {
                self.run_stage(ctx, policy, Stage::Success)?;
                if self.transition(id, action, ProposalStatus::Passed)? {
                    if action::execute(&self.services, action_id)? {
                        ctx.note_executed(action_id);
                    }
                    self.close_process(id, action);
                }
            }
            ProposalStatus::Failed => {
                self.run_stage(ctx, policy, Stage::Fail)?;
                if self.transition(id, action, ProposalStatus::Failed)? {
                    self.close_process(id, action);
                }
            }
            ProposalStatus::Proposed => {}
        }

        if first && check != ProposalStatus::Passed {
            let current = self
                .store()
                .get_action(action_id)?
                .ok_or(EngineError::ActionNotFound(action_id))?;
            if current.is_reversible() {
                action::revert(&self.services, action_id)?;
            }
        }

        if first && check == ProposalStatus::Proposed {
            self.record_activity(action, "was proposed")?;
            self.run_stage(ctx, policy, Stage::Notify)?;
        }

        Ok(check)
    }

    /// Run one stage body. An empty filter passes; any other empty stage
    /// returns `None`.
    pub(crate) fn run_stage(
        &self,
        ctx: &EvaluationContext,
        policy: &PolicyRecord,
        stage: Stage,
    ) -> Result<Value, EngineError> {
        let code = policy.stages.get(stage);
        if code.trim().is_empty() {
            return Ok(match stage {
                Stage::Filter => Value::Bool(true),
                _ => Value::None,
            });
        }
        Ok(self.sandbox.run(code, stage, &ctx.arguments(stage))?)
    }

    /// Move a proposal to a terminal status. Returns `false` when another
    /// evaluation got there first.
    fn transition(
        &self,
        id: ProposalId,
        action: &ActionRecord,
        status: ProposalStatus,
    ) -> Result<bool, EngineError> {
        let mut moved = false;
        modify_proposal(self.store(), id, |p| {
            moved = !p.status.is_terminal();
            if moved {
                p.status = status;
            }
            moved
        })?;
        if moved {
            info!(proposal = %id, status = %status, action_type = %action.action_type, "proposal decided");
            self.record_activity(action, &format!("was {}", status))?;
        }
        Ok(moved)
    }

    fn close_process(&self, id: ProposalId, action: &ActionRecord) {
        let client = ProcessClient {
            service: self.services.governance.clone(),
            store: self.services.store.clone(),
            proposal: id,
            community: action.community.community.to_string(),
        };
        if let Err(e) = client.close_process() {
            warn!(proposal = %id, error = %e, "failed to close governance process");
        }
    }

    fn record_activity(&self, action: &ActionRecord, verb: &str) -> Result<(), EngineError> {
        let Some(id) = action.id else {
            return Ok(());
        };
        self.store().record_activity(ActivityRecord {
            action: id,
            community: action.community.community,
            action_type: action.action_type.clone(),
            verb: verb.to_string(),
            created_at: OffsetDateTime::now_utc(),
        })?;
        Ok(())
    }

    /// Announce that `executed` was carried out, through the trigger
    /// policies that govern its type.
    fn fire_executed_trigger(&self, executed: ActionId) {
        let record = match self.store().get_action(executed) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(action = %executed, error = %e, "could not load executed action");
                return;
            }
        };
        if record.is_trigger() {
            return;
        }
        let mut trigger = ActionRecord::new(
            ActionKind::Trigger {
                executed_action: Some(executed),
            },
            record.action_type.clone(),
            record.community.clone(),
        );
        trigger.initiator = record.initiator.clone();
        if let Err(e) = self.propose_and_evaluate(trigger) {
            warn!(action = %executed, error = %e, "executed-action trigger failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_two_decisions_are_recognised() {
        assert_eq!(coerce_check_result(&Value::from("passed")), ProposalStatus::Passed);
        assert_eq!(coerce_check_result(&Value::from("failed")), ProposalStatus::Failed);
        for other in [
            Value::from("proposed"),
            Value::from("PASSED"),
            Value::Bool(true),
            Value::Int(1),
            Value::None,
            Value::list(vec![Value::from("passed")]),
        ] {
            assert_eq!(coerce_check_result(&other), ProposalStatus::Proposed, "{other:?}");
        }
    }

    #[test]
    fn lock_slots_are_shared_while_held() {
        let locks = ProposalLocks::default();
        let a = locks.slot(ProposalId(1)).unwrap();
        let b = locks.slot(ProposalId(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        let c = locks.slot(ProposalId(2)).unwrap();
        assert_eq!(locks.slots.lock().unwrap().len(), 1);
        drop(c);
    }
}
