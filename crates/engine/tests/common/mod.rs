//! In-memory fakes and fixtures shared by the engine integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use polity_core::Stage;
use polity_engine::{
    Engine, EngineSettings, GovernanceError, GovernanceService, PlatformAdapter, PlatformError,
    PlatformRegistry, ProcessData, ProcessStatus, StartedProcess,
};
use polity_storage::{
    ActionId, ActionKind, ActionRecord, CommunityId, CommunityRef, InMemoryStore, PolicyDraft,
    PolicyKind, PolicyRecord, PolicyStore, ProposalFilter, ProposalId, ProposalRecord,
};
use serde_json::json;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

pub const COMMUNITY: CommunityId = CommunityId(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fixed instant plus `secs` seconds.
pub fn at(secs: i64) -> OffsetDateTime {
    datetime!(2025-03-01 12:00 UTC) + Duration::seconds(secs)
}

// ── Platform ────────────────────────────────────────────────────────────────

/// Records every call made to it.
#[derive(Default)]
pub struct RecordingPlatform {
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
    pub executed: Mutex<Vec<ActionId>>,
    pub reverted: Mutex<Vec<ActionId>>,
    pub votes: Mutex<Vec<ProposalId>>,
}

impl RecordingPlatform {
    pub fn executed(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn reverted(&self) -> usize {
        self.reverted.lock().unwrap().len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(e, _)| e.clone())
            .collect()
    }
}

impl PlatformAdapter for RecordingPlatform {
    fn name(&self) -> &str {
        "slack"
    }

    fn make_call(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, PlatformError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), params.clone()));
        Ok(json!({ "ok": true }))
    }

    fn execute(&self, action: &ActionRecord) -> Result<(), PlatformError> {
        self.executed.lock().unwrap().extend(action.id);
        Ok(())
    }

    fn revert(&self, action: &ActionRecord) -> Result<(), PlatformError> {
        self.reverted.lock().unwrap().extend(action.id);
        Ok(())
    }

    fn initiate_vote(
        &self,
        proposal: ProposalId,
        params: &serde_json::Value,
    ) -> Result<Option<String>, PlatformError> {
        self.votes.lock().unwrap().push(proposal);
        self.make_call("initiate_vote", params)?;
        Ok(Some(format!("post-{}", proposal)))
    }
}

// ── Governance ──────────────────────────────────────────────────────────────

/// Answers polls from a queue; an empty queue reads as still pending.
#[derive(Default)]
pub struct ScriptedGovernance {
    pub polls: Mutex<VecDeque<Result<ProcessData, GovernanceError>>>,
    pub started: Mutex<Vec<(String, serde_json::Value)>>,
    pub closed: Mutex<u32>,
}

impl ScriptedGovernance {
    pub fn complete_with(&self, outcome: serde_json::Value) {
        self.polls.lock().unwrap().push_back(Ok(ProcessData {
            status: ProcessStatus::Completed,
            outcome,
            errors: json!({}),
        }));
    }

    pub fn closed(&self) -> u32 {
        *self.closed.lock().unwrap()
    }
}

impl GovernanceService for ScriptedGovernance {
    fn start_process(
        &self,
        community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<StartedProcess, GovernanceError> {
        let mut started = self.started.lock().unwrap();
        started.push((name.to_string(), params.clone()));
        Ok(StartedProcess {
            location: format!("/api/internal/process/{}/{}/{}", community, name, started.len()),
            data: ProcessData::default(),
        })
    }

    fn get_process(&self, _location: &str) -> Result<ProcessData, GovernanceError> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProcessData::default()))
    }

    fn close_process(&self, _location: &str) -> Result<ProcessData, GovernanceError> {
        *self.closed.lock().unwrap() += 1;
        Ok(ProcessData {
            status: ProcessStatus::Completed,
            ..ProcessData::default()
        })
    }

    fn perform_action(
        &self,
        _community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, GovernanceError> {
        Ok(json!({ "performed": name, "parameters": params }))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub slack: Arc<RecordingPlatform>,
    pub governance: Arc<ScriptedGovernance>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let slack = Arc::new(RecordingPlatform::default());
        let governance = Arc::new(ScriptedGovernance::default());
        let registry = PlatformRegistry::new().with(COMMUNITY, slack.clone());
        let engine = Engine::new(store.clone(), registry, governance.clone()).with_settings(settings);
        Harness {
            store,
            slack,
            governance,
            engine: Arc::new(engine),
        }
    }

    /// Store a policy modified at `modified_at`.
    pub fn policy(
        &self,
        kind: PolicyKind,
        name: &str,
        action_types: &[&str],
        stages: &[(Stage, &str)],
        modified_at: OffsetDateTime,
    ) -> PolicyRecord {
        let mut draft = PolicyDraft::new(kind, name);
        for t in action_types {
            draft = draft.action_type(*t);
        }
        for (stage, code) in stages {
            draft = draft.stage(*stage, *code);
        }
        self.store
            .insert_policy(COMMUNITY, draft, modified_at)
            .unwrap()
    }

    /// A platform base policy.
    pub fn base_policy(&self, name: &str, stages: &[(Stage, &str)]) -> PolicyRecord {
        self.policy(PolicyKind::Platform, name, &[], stages, at(0))
    }

    pub fn proposals_for(&self, action: ActionId) -> Vec<ProposalRecord> {
        self.store
            .list_proposals(&ProposalFilter {
                action: Some(action),
                ..ProposalFilter::default()
            })
            .unwrap()
    }

    pub fn action(&self, id: ActionId) -> ActionRecord {
        self.store.get_action(id).unwrap().unwrap()
    }

    pub fn proposal(&self, id: ProposalId) -> ProposalRecord {
        self.store.get_proposal(id).unwrap().unwrap()
    }

    /// Propose `action` and return the single proposal it produced.
    pub fn propose_one(&self, action: ActionRecord) -> ProposalRecord {
        let mut proposals = self.engine.propose_and_evaluate(action).unwrap();
        assert_eq!(proposals.len(), 1, "{proposals:?}");
        proposals.remove(0)
    }
}

pub fn platform_action(action_type: &str, community_origin: bool) -> ActionRecord {
    let mut action = ActionRecord::new(
        ActionKind::Platform,
        action_type,
        CommunityRef {
            community: COMMUNITY,
            platform: "slack".into(),
        },
    );
    action.community_origin = community_origin;
    action
}

pub fn trigger_action(action_type: &str) -> ActionRecord {
    ActionRecord::new(
        ActionKind::Trigger {
            executed_action: None,
        },
        action_type,
        CommunityRef {
            community: COMMUNITY,
            platform: "slack".into(),
        },
    )
}
