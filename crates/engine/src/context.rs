//! The named values one evaluation exposes to policy code.

use std::cell::RefCell;
use std::rc::Rc;

use polity_core::Stage;
use polity_sandbox::json::from_json;
use polity_sandbox::{Arguments, CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{
    ActionId, ActionKind, ActionRecord, DataMap, PolicyRecord, ProposalRecord, ProposalStatus,
};
use time::OffsetDateTime;

use crate::action::ActionObject;
use crate::audit::AuditLogger;
use crate::error::EngineError;
use crate::governance::ProcessClient;
use crate::host::{DataStore, DataTarget};
use crate::platform::PlatformHandle;
use crate::Services;

/// Everything bound for the stages of one evaluation pass.
///
/// Built once per pass and reused for every stage, so host objects share
/// state (detached scratch data, the list of executed actions) across
/// stages. Values hold `Rc`s and never leave the evaluating thread.
pub struct EvaluationContext {
    bindings: Vec<(String, Value)>,
    platforms: Vec<String>,
    logger: AuditLogger,
    executed: Rc<RefCell<Vec<ActionId>>>,
}

impl EvaluationContext {
    /// Assemble the context for `action` under `policy`. `proposal` is
    /// `None` while the filter runs for an action nobody governs yet.
    ///
    /// For an executed-action trigger the wrapped action is exposed as
    /// `action`.
    pub fn build(
        services: &Services,
        action: &ActionRecord,
        policy: &PolicyRecord,
        proposal: Option<&ProposalRecord>,
    ) -> Result<Self, EngineError> {
        let store = &services.store;
        let community = action.community.community;
        let proposal_id = proposal.and_then(|p| p.id);
        let executed = Rc::new(RefCell::new(Vec::new()));

        let exposed = match action.kind {
            ActionKind::Trigger {
                executed_action: Some(id),
            } => store.get_action(id)?.ok_or(EngineError::ActionNotFound(id))?,
            _ => action.clone(),
        };

        let logger = AuditLogger::new(store.clone(), community, proposal_id);
        let metagov = match proposal_id {
            Some(id) => Value::object(ProcessClient {
                service: services.governance.clone(),
                store: store.clone(),
                proposal: id,
                community: community.to_string(),
            }),
            None => Value::None,
        };

        let mut bindings = vec![
            (
                "action".to_string(),
                Value::object(ActionObject::new(exposed, services.clone(), Rc::clone(&executed))),
            ),
            ("policy".to_string(), Value::object(PolicyObject(policy.clone()))),
            (
                "proposal".to_string(),
                Value::object(ProposalObject::new(proposal.cloned(), services)),
            ),
            ("logger".to_string(), Value::object(logger.clone())),
            (
                "variables".to_string(),
                from_json(&serde_json::Value::Object(policy.variables.clone())),
            ),
            ("metagov".to_string(), metagov),
        ];

        let mut platforms = Vec::new();
        for adapter in services.platforms.connected(community) {
            let name = adapter.name().to_string();
            bindings.push((
                name.clone(),
                Value::object(PlatformHandle {
                    adapter: adapter.clone(),
                    community,
                    proposal: proposal_id,
                    store: store.clone(),
                }),
            ));
            platforms.push(name);
        }

        Ok(EvaluationContext {
            bindings,
            platforms,
            logger,
            executed,
        })
    }

    /// The arguments bound for `stage`.
    pub fn arguments(&self, stage: Stage) -> Arguments {
        let mut args = Arguments::new();
        for name in stage.arguments(&self.platforms) {
            if let Some((_, value)) = self.bindings.iter().find(|(n, _)| *n == name) {
                args.insert(name, value.clone());
            }
        }
        args
    }

    pub fn logger(&self) -> &AuditLogger {
        &self.logger
    }

    pub fn platform_names(&self) -> &[String] {
        &self.platforms
    }

    /// Record an action executed outside policy code during this pass.
    pub fn note_executed(&self, id: ActionId) {
        self.executed.borrow_mut().push(id);
    }

    /// Actions executed during this pass, in order, without duplicates.
    pub fn executed(&self) -> Vec<ActionId> {
        let mut out = Vec::new();
        for id in self.executed.borrow().iter() {
            if !out.contains(id) {
                out.push(*id);
            }
        }
        out
    }
}

// ──────────────────────────────────────────────
// Policy and proposal objects
// ──────────────────────────────────────────────

struct PolicyObject(PolicyRecord);

impl HostObject for PolicyObject {
    fn type_name(&self) -> &str {
        "Policy"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let p = &self.0;
        Some(match name {
            "id" => Value::Int(p.id.0 as i64),
            "name" => Value::from(p.name.as_str()),
            "description" => Value::from(p.description.as_str()),
            "kind" => Value::from(p.kind.as_str()),
            "action_types" => Value::list(
                p.action_types
                    .iter()
                    .map(|t| Value::from(t.as_str()))
                    .collect(),
            ),
            "is_active" => Value::Bool(p.is_active),
            "is_base_policy" => Value::Bool(p.is_base_policy()),
            "modified_at" => Value::DateTime(p.modified_at),
            "variables" => from_json(&serde_json::Value::Object(p.variables.clone())),
            _ => return None,
        })
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(&self, name: &str, _args: CallArgs) -> Result<Value, RuntimeError> {
        Err(RuntimeError::attribute_error(format!(
            "'Policy' object has no method '{}'",
            name
        )))
    }

    fn repr(&self) -> String {
        format!("<Policy {} {}>", self.0.id, self.0.name)
    }
}

/// `proposal` in policy code. For a saved proposal every read goes to the
/// store; before the proposal exists it reads as a fresh `proposed` record
/// with in-memory scratch data.
struct ProposalObject {
    snapshot: RefCell<Option<ProposalRecord>>,
    services: Services,
    detached: Rc<RefCell<DataMap>>,
}

impl ProposalObject {
    fn new(record: Option<ProposalRecord>, services: &Services) -> Self {
        ProposalObject {
            snapshot: RefCell::new(record),
            services: services.clone(),
            detached: Rc::new(RefCell::new(DataMap::new())),
        }
    }

    fn current(&self) -> Option<ProposalRecord> {
        let id = self.snapshot.borrow().as_ref().and_then(|p| p.id);
        if let Some(Ok(Some(fresh))) = id.map(|id| self.services.store.get_proposal(id)) {
            *self.snapshot.borrow_mut() = Some(fresh);
        }
        self.snapshot.borrow().clone()
    }
}

impl HostObject for ProposalObject {
    fn type_name(&self) -> &str {
        "Proposal"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let record = self.current();
        let saved = record.as_ref().and_then(|p| p.id.map(|id| (p, id)));
        let value = match name {
            "id" => saved.map(|(_, id)| Value::Int(id.0 as i64)).unwrap_or(Value::None),
            "status" => Value::from(
                record
                    .as_ref()
                    .map_or(ProposalStatus::Proposed, |p| p.status)
                    .as_str(),
            ),
            "proposal_time" => record
                .as_ref()
                .map(|p| Value::DateTime(p.proposal_time))
                .unwrap_or(Value::None),
            "community_post" => record
                .as_ref()
                .and_then(|p| p.community_post.clone())
                .map(Value::Str)
                .unwrap_or(Value::None),
            "governance_process" => record
                .as_ref()
                .and_then(|p| p.governance_process.as_ref())
                .map(|g| from_json(&g.last_known))
                .unwrap_or(Value::None),
            "data" => {
                let target = match saved {
                    Some((_, id)) => DataTarget::Proposal(id),
                    None => DataTarget::Detached(Rc::clone(&self.detached)),
                };
                Value::object(DataStore {
                    target,
                    store: self.services.store.clone(),
                })
            }
            _ => return None,
        };
        Some(value)
    }

    fn has_method(&self, name: &str) -> bool {
        name == "get_time_elapsed"
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        match name {
            "get_time_elapsed" => {
                args.at_most(0, name)?;
                let started = self
                    .current()
                    .map(|p| p.proposal_time)
                    .unwrap_or_else(OffsetDateTime::now_utc);
                Ok(Value::Duration(OffsetDateTime::now_utc() - started))
            }
            _ => Err(RuntimeError::attribute_error(format!(
                "'Proposal' object has no method '{}'",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use polity_sandbox::Sandbox;
    use polity_storage::{CommunityId, CommunityRef, InMemoryStore, PolicyDraft, PolicyKind};
    use serde_json::json;

    use crate::governance::DisabledGovernance;
    use crate::platform::{PlatformAdapter, PlatformError, PlatformRegistry};

    struct Quiet(&'static str);

    impl PlatformAdapter for Quiet {
        fn name(&self) -> &str {
            self.0
        }

        fn make_call(
            &self,
            endpoint: &str,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value, PlatformError> {
            Ok(json!({ "ok": true, "endpoint": endpoint }))
        }

        fn execute(&self, _action: &ActionRecord) -> Result<(), PlatformError> {
            Ok(())
        }

        fn revert(&self, _action: &ActionRecord) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn services() -> Services {
        let registry = PlatformRegistry::new()
            .with(CommunityId(1), Arc::new(Quiet("slack")))
            .with(CommunityId(1), Arc::new(Quiet("github")));
        Services {
            store: Arc::new(InMemoryStore::new()),
            platforms: Arc::new(registry),
            governance: Arc::new(DisabledGovernance),
        }
    }

    fn action(kind: ActionKind, action_type: &str) -> ActionRecord {
        ActionRecord::new(
            kind,
            action_type,
            CommunityRef {
                community: CommunityId(1),
                platform: "slack".into(),
            },
        )
    }

    fn policy(services: &Services) -> PolicyRecord {
        let mut draft = PolicyDraft::new(PolicyKind::Platform, "base");
        draft.variables.insert("quorum".into(), json!(3));
        services
            .store
            .insert_policy(CommunityId(1), draft, OffsetDateTime::now_utc())
            .unwrap()
    }

    #[test]
    fn filter_stage_binds_no_governance_client() {
        let services = services();
        let policy = policy(&services);
        let ctx =
            EvaluationContext::build(&services, &action(ActionKind::Platform, "x"), &policy, None)
                .unwrap();
        assert_eq!(ctx.arguments(Stage::Filter).len(), 7);
        assert!(ctx.arguments(Stage::Filter).get("metagov").is_none());
        assert!(ctx.arguments(Stage::Check).get("metagov").is_some());
        assert!(ctx.arguments(Stage::Check).get("github").is_some());
        assert_eq!(ctx.platform_names(), ["slack", "github"]);
    }

    #[test]
    fn unsaved_proposal_reads_as_proposed() {
        let services = services();
        let policy = policy(&services);
        let ctx =
            EvaluationContext::build(&services, &action(ActionKind::Platform, "x"), &policy, None)
                .unwrap();
        let v = Sandbox::default()
            .run(
                "proposal.data.set('k', 1)\nreturn [proposal.status, proposal.id, proposal.data.get('k'), variables['quorum']]",
                Stage::Filter,
                &ctx.arguments(Stage::Filter),
            )
            .unwrap();
        assert_eq!(
            v,
            Value::list(vec![
                Value::from("proposed"),
                Value::None,
                Value::Int(1),
                Value::Int(3)
            ])
        );
    }

    #[test]
    fn executed_action_triggers_expose_the_wrapped_action() {
        let services = services();
        let policy = policy(&services);
        let wrapped = services
            .store
            .insert_action(action(ActionKind::Platform, "slackpostmessage"))
            .unwrap();
        let trigger = action(
            ActionKind::Trigger {
                executed_action: wrapped.id,
            },
            "slackpostmessage",
        );
        let ctx = EvaluationContext::build(&services, &trigger, &policy, None).unwrap();
        let v = Sandbox::default()
            .run(
                "return [action.kind, action.id]",
                Stage::Filter,
                &ctx.arguments(Stage::Filter),
            )
            .unwrap();
        assert_eq!(
            v,
            Value::list(vec![
                Value::from("platform"),
                Value::Int(wrapped.id.unwrap().0 as i64)
            ])
        );
    }

    #[test]
    fn platform_handles_answer_calls() {
        let services = services();
        let policy = policy(&services);
        let ctx =
            EvaluationContext::build(&services, &action(ActionKind::Platform, "x"), &policy, None)
                .unwrap();
        let v = Sandbox::default()
            .run(
                "r = github.make_call('issues.list', {'state': 'open'})\nreturn r['endpoint']",
                Stage::Filter,
                &ctx.arguments(Stage::Filter),
            )
            .unwrap();
        assert_eq!(v, Value::from("issues.list"));
    }
}
