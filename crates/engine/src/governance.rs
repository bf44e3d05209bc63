//! External governance processes (votes and similar) a proposal can delegate
//! to.
//!
//! [`GovernanceService`] is the service itself. [`ProcessClient`] scopes it
//! to one proposal and keeps the process location on the proposal record;
//! it is what policy code sees as `metagov`.

use std::sync::Arc;
use std::time::Duration;

use polity_sandbox::json::from_json;
use polity_sandbox::{CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{GovernanceProcessRef, PolicyStore, ProposalId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::host::{keywords_to_json, modify_proposal};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GovernanceError {
    #[error("no governance service is configured")]
    Disabled,

    #[error("governance call timed out")]
    Timeout,

    #[error("governance request failed: {0}")]
    Http(String),

    #[error("malformed governance response: {0}")]
    Malformed(String),

    #[error("'{0}' is not of the form plugin.name")]
    BadName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Pending,
    Completed,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Completed => "completed",
        }
    }
}

/// The document a governance service returns for a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessData {
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub outcome: serde_json::Value,
    #[serde(default)]
    pub errors: serde_json::Value,
}

impl ProcessData {
    fn from_last_known(v: &serde_json::Value) -> ProcessData {
        serde_json::from_value(v.clone()).unwrap_or_default()
    }

    fn to_last_known(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedProcess {
    pub location: String,
    pub data: ProcessData,
}

/// A governance-process service. Calls are blocking and should be bounded by
/// a timeout; [`GovernanceError::Timeout`] is treated as "still pending".
pub trait GovernanceService: Send + Sync {
    /// Start `name` (`plugin.process`) for `community`.
    fn start_process(
        &self,
        community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<StartedProcess, GovernanceError>;

    fn get_process(&self, location: &str) -> Result<ProcessData, GovernanceError>;

    fn close_process(&self, location: &str) -> Result<ProcessData, GovernanceError>;

    /// Run `name` (`plugin.action`) and return its raw result.
    fn perform_action(
        &self,
        community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, GovernanceError>;
}

/// Used when no service is configured. Every call fails.
pub struct DisabledGovernance;

impl GovernanceService for DisabledGovernance {
    fn start_process(
        &self,
        _community: &str,
        _name: &str,
        _params: &serde_json::Value,
    ) -> Result<StartedProcess, GovernanceError> {
        Err(GovernanceError::Disabled)
    }

    fn get_process(&self, _location: &str) -> Result<ProcessData, GovernanceError> {
        Err(GovernanceError::Disabled)
    }

    fn close_process(&self, _location: &str) -> Result<ProcessData, GovernanceError> {
        Err(GovernanceError::Disabled)
    }

    fn perform_action(
        &self,
        _community: &str,
        _name: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, GovernanceError> {
        Err(GovernanceError::Disabled)
    }
}

// ──────────────────────────────────────────────
// HTTP service
// ──────────────────────────────────────────────

/// A Metagov-style HTTP API.
///
/// - `POST {base}/api/internal/process/{plugin}.{name}` starts a process; the
///   `Location` header (or a `location` field) names it
/// - `GET {base}{location}` reads it, `DELETE {base}{location}` closes it
/// - `POST {base}/api/internal/action/{plugin}.{name}` performs an action
///
/// Every request carries the community in `X-Metagov-Community`.
pub struct HttpGovernanceService {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpGovernanceService {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        HttpGovernanceService {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

fn classify(e: ureq::Error) -> GovernanceError {
    match e {
        ureq::Error::Timeout(_) => GovernanceError::Timeout,
        other => GovernanceError::Http(other.to_string()),
    }
}

fn read_json(resp: ureq::http::Response<ureq::Body>) -> Result<serde_json::Value, GovernanceError> {
    resp.into_body()
        .read_json()
        .map_err(|e| GovernanceError::Malformed(e.to_string()))
}

fn process_data(v: serde_json::Value) -> Result<ProcessData, GovernanceError> {
    serde_json::from_value(v).map_err(|e| GovernanceError::Malformed(e.to_string()))
}

fn check_name(name: &str) -> Result<(), GovernanceError> {
    match name.split_once('.') {
        Some((plugin, rest)) if !plugin.is_empty() && !rest.is_empty() => Ok(()),
        _ => Err(GovernanceError::BadName(name.to_string())),
    }
}

impl GovernanceService for HttpGovernanceService {
    fn start_process(
        &self,
        community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<StartedProcess, GovernanceError> {
        check_name(name)?;
        let url = self.url(&format!("api/internal/process/{}", name));
        let resp = self
            .agent
            .post(&url)
            .header("X-Metagov-Community", community)
            .send_json(params)
            .map_err(classify)?;
        let header = resp
            .headers()
            .get("location")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let body = read_json(resp)?;
        let location = header
            .or_else(|| body.get("location").and_then(|l| l.as_str()).map(str::to_string))
            .ok_or_else(|| GovernanceError::Malformed("no process location returned".into()))?;
        let data = process_data(body)?;
        Ok(StartedProcess { location, data })
    }

    fn get_process(&self, location: &str) -> Result<ProcessData, GovernanceError> {
        let resp = self.agent.get(&self.url(location)).call().map_err(classify)?;
        process_data(read_json(resp)?)
    }

    fn close_process(&self, location: &str) -> Result<ProcessData, GovernanceError> {
        let resp = self
            .agent
            .delete(&self.url(location))
            .call()
            .map_err(classify)?;
        process_data(read_json(resp)?)
    }

    fn perform_action(
        &self,
        community: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, GovernanceError> {
        check_name(name)?;
        let url = self.url(&format!("api/internal/action/{}", name));
        let resp = self
            .agent
            .post(&url)
            .header("X-Metagov-Community", community)
            .send_json(json!({ "parameters": params }))
            .map_err(classify)?;
        read_json(resp)
    }
}

// ──────────────────────────────────────────────
// Proposal-scoped client
// ──────────────────────────────────────────────

/// The governance service as seen from one proposal.
#[derive(Clone)]
pub struct ProcessClient {
    pub service: Arc<dyn GovernanceService>,
    pub store: Arc<dyn PolicyStore>,
    pub proposal: ProposalId,
    /// Community identifier sent to the service.
    pub community: String,
}

impl ProcessClient {
    fn current(&self) -> Result<Option<GovernanceProcessRef>, EngineError> {
        Ok(self
            .store
            .get_proposal(self.proposal)?
            .ok_or(EngineError::ProposalNotFound(self.proposal))?
            .governance_process)
    }

    fn remember(&self, location: &str, data: &ProcessData) -> Result<(), EngineError> {
        let last_known = data.to_last_known();
        modify_proposal(self.store.as_ref(), self.proposal, |p| {
            p.governance_process = Some(GovernanceProcessRef {
                location: location.to_string(),
                last_known: last_known.clone(),
            });
            true
        })?;
        Ok(())
    }

    /// Start a process and record it on the proposal.
    pub fn start_process(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<ProcessData, EngineError> {
        let started = self.service.start_process(&self.community, name, params)?;
        debug!(proposal = %self.proposal, process = name, location = %started.location, "started governance process");
        self.remember(&started.location, &started.data)?;
        Ok(started.data)
    }

    /// Latest process data, or `None` if no process was started. A timeout
    /// reports the last known data as still pending.
    pub fn get_process(&self) -> Result<Option<ProcessData>, EngineError> {
        let Some(process) = self.current()? else {
            return Ok(None);
        };
        match self.service.get_process(&process.location) {
            Ok(data) => {
                self.remember(&process.location, &data)?;
                Ok(Some(data))
            }
            Err(GovernanceError::Timeout) => {
                warn!(proposal = %self.proposal, location = %process.location, "governance process poll timed out");
                let mut data = ProcessData::from_last_known(&process.last_known);
                data.status = ProcessStatus::Pending;
                Ok(Some(data))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the process and record its final data. Returns `None` if no
    /// process was started; closing a completed process does nothing.
    pub fn close_process(&self) -> Result<Option<ProcessData>, EngineError> {
        let Some(process) = self.current()? else {
            return Ok(None);
        };
        let known = ProcessData::from_last_known(&process.last_known);
        if known.status == ProcessStatus::Completed {
            return Ok(Some(known));
        }
        let data = self.service.close_process(&process.location)?;
        debug!(proposal = %self.proposal, outcome = %data.outcome, "closed governance process");
        self.remember(&process.location, &data)?;
        Ok(Some(data))
    }

    pub fn perform_action(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        Ok(self.service.perform_action(&self.community, name, params)?)
    }
}

/// Process data as policy code reads it: `process.status`, `.outcome`,
/// `.errors`.
struct ProcessObject(ProcessData);

impl HostObject for ProcessObject {
    fn type_name(&self) -> &str {
        "GovernanceProcess"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "status" => Some(Value::from(self.0.status.as_str())),
            "outcome" => Some(from_json(&self.0.outcome)),
            "errors" => Some(from_json(&self.0.errors)),
            _ => None,
        }
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(&self, name: &str, _args: CallArgs) -> Result<Value, RuntimeError> {
        Err(RuntimeError::attribute_error(format!(
            "'GovernanceProcess' object has no method '{}'",
            name
        )))
    }
}

fn process_value(data: Option<ProcessData>) -> Value {
    data.map(|d| Value::object(ProcessObject(d)))
        .unwrap_or(Value::None)
}

impl HostObject for ProcessClient {
    fn type_name(&self) -> &str {
        "Metagov"
    }

    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "start_process" | "get_process" | "close_process" | "perform_action"
        )
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        match name {
            "start_process" | "perform_action" => {
                args.at_most(1, name)?;
                let target = args.require(0, "name", name)?.expect_str("name")?;
                let params = keywords_to_json(&args, &["name"])?;
                if name == "start_process" {
                    Ok(process_value(Some(self.start_process(target, &params)?)))
                } else {
                    Ok(from_json(&self.perform_action(target, &params)?))
                }
            }
            "get_process" => {
                args.at_most(0, name)?;
                Ok(process_value(self.get_process()?))
            }
            "close_process" => {
                args.at_most(0, name)?;
                Ok(process_value(self.close_process()?))
            }
            _ => Err(RuntimeError::attribute_error(format!(
                "'Metagov' object has no method '{}'",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use polity_storage::{
        ActionKind, ActionRecord, CommunityId, CommunityRef, InMemoryStore, PolicyId,
        ProposalRecord,
    };

    #[derive(Default)]
    struct Scripted {
        polls: Mutex<Vec<Result<ProcessData, GovernanceError>>>,
        closed: Mutex<u32>,
    }

    impl GovernanceService for Scripted {
        fn start_process(
            &self,
            community: &str,
            name: &str,
            params: &serde_json::Value,
        ) -> Result<StartedProcess, GovernanceError> {
            check_name(name)?;
            Ok(StartedProcess {
                location: format!("/process/{}/{}", community, name),
                data: ProcessData {
                    outcome: params.clone(),
                    ..ProcessData::default()
                },
            })
        }

        fn get_process(&self, _location: &str) -> Result<ProcessData, GovernanceError> {
            self.polls
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(GovernanceError::Timeout))
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
            Ok(json!({ "name": name, "params": params }))
        }
    }

    fn client(service: Arc<Scripted>) -> (ProcessClient, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let action = store
            .insert_action(ActionRecord::new(
                ActionKind::Platform,
                "slackpostmessage",
                CommunityRef {
                    community: CommunityId(1),
                    platform: "slack".into(),
                },
            ))
            .unwrap();
        let proposal = store
            .insert_proposal(ProposalRecord::new(action.id.unwrap(), PolicyId(2)))
            .unwrap();
        let client = ProcessClient {
            service,
            store: store.clone(),
            proposal: proposal.id.unwrap(),
            community: "1".into(),
        };
        (client, store)
    }

    #[test]
    fn nothing_started_means_none() {
        let (client, _) = client(Arc::new(Scripted::default()));
        assert_eq!(client.get_process().unwrap(), None);
        assert_eq!(client.close_process().unwrap(), None);
    }

    #[test]
    fn started_process_is_recorded_on_the_proposal() {
        let (client, store) = client(Arc::new(Scripted::default()));
        client
            .start_process("loomio.poll", &json!({ "title": "Adopt?" }))
            .unwrap();
        let p = store.get_proposal(client.proposal).unwrap().unwrap();
        let process = p.governance_process.unwrap();
        assert_eq!(process.location, "/process/1/loomio.poll");
        assert_eq!(process.last_known["status"], "pending");
    }

    #[test]
    fn poll_timeouts_read_as_pending() {
        let service = Arc::new(Scripted::default());
        service.polls.lock().unwrap().push(Ok(ProcessData {
            status: ProcessStatus::Completed,
            outcome: json!({ "yes": 3 }),
            errors: json!({}),
        }));
        let (client, _) = client(service);
        client.start_process("loomio.poll", &json!({})).unwrap();

        let done = client.get_process().unwrap().unwrap();
        assert_eq!(done.status, ProcessStatus::Completed);

        // The next poll times out; the last known outcome is kept but the
        // process is reported as pending.
        let later = client.get_process().unwrap().unwrap();
        assert_eq!(later.status, ProcessStatus::Pending);
        assert_eq!(later.outcome, json!({ "yes": 3 }));
    }

    #[test]
    fn closing_twice_calls_the_service_once() {
        let service = Arc::new(Scripted::default());
        let (client, _) = client(service.clone());
        client.start_process("loomio.poll", &json!({})).unwrap();
        client.close_process().unwrap();
        let again = client.close_process().unwrap().unwrap();
        assert_eq!(again.status, ProcessStatus::Completed);
        assert_eq!(*service.closed.lock().unwrap(), 1);
    }

    #[test]
    fn policy_code_reads_process_attributes() {
        let (client, _) = client(Arc::new(Scripted::default()));
        let process = client
            .call_method(
                "start_process",
                CallArgs {
                    positional: vec![Value::from("loomio.poll")],
                    keywords: vec![("title".into(), Value::from("Adopt?"))],
                },
            )
            .unwrap();
        let Value::Object(obj) = process else {
            panic!("expected a process object");
        };
        assert_eq!(obj.get_attr("status"), Some(Value::from("pending")));
        let polled = client
            .call_method("get_process", CallArgs::default())
            .unwrap();
        assert!(!polled.is_none());
    }

    #[test]
    fn names_need_a_plugin() {
        assert_eq!(
            check_name("poll"),
            Err(GovernanceError::BadName("poll".into()))
        );
        assert!(check_name("loomio.poll").is_ok());
    }
}
