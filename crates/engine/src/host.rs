//! Shared plumbing for the objects handed to policy code.

use std::cell::RefCell;
use std::rc::Rc;

use polity_sandbox::json::{from_json, to_json};
use polity_sandbox::{CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{
    ActionId, ActionRecord, DataMap, PolicyStore, ProposalId, ProposalRecord, StorageError,
};

use crate::error::EngineError;

/// Attempts a read-modify-write makes before giving up on a contended record.
const MAX_WRITE_ATTEMPTS: usize = 8;

impl From<EngineError> for RuntimeError {
    fn from(e: EngineError) -> Self {
        let kind = match &e {
            EngineError::Platform(_) => "PlatformError",
            EngineError::Governance(_) => "GovernanceError",
            EngineError::Storage(_) => "StorageError",
            _ => "RuntimeError",
        };
        RuntimeError::new(kind, e.to_string())
    }
}

/// Keyword arguments as a JSON object, leaving out `skip`.
pub(crate) fn keywords_to_json(
    args: &CallArgs,
    skip: &[&str],
) -> Result<serde_json::Value, RuntimeError> {
    let mut map = serde_json::Map::new();
    for (name, value) in &args.keywords {
        if !skip.contains(&name.as_str()) {
            map.insert(name.clone(), to_json(value)?);
        }
    }
    Ok(serde_json::Value::Object(map))
}

/// Re-read a proposal, apply `change`, and write it back, retrying on version
/// conflicts. `change` returns `false` to leave the record untouched.
pub(crate) fn modify_proposal(
    store: &dyn PolicyStore,
    id: ProposalId,
    mut change: impl FnMut(&mut ProposalRecord) -> bool,
) -> Result<ProposalRecord, EngineError> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let mut proposal = store
            .get_proposal(id)?
            .ok_or(EngineError::ProposalNotFound(id))?;
        if !change(&mut proposal) {
            return Ok(proposal);
        }
        match store.update_proposal(&proposal) {
            Err(StorageError::ConcurrentConflict { .. }) => continue,
            other => return Ok(other?),
        }
    }
    Err(conflict("proposal", id.0))
}

/// [`modify_proposal`] for actions.
pub(crate) fn modify_action(
    store: &dyn PolicyStore,
    id: ActionId,
    mut change: impl FnMut(&mut ActionRecord) -> bool,
) -> Result<ActionRecord, EngineError> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let mut action = store
            .get_action(id)?
            .ok_or(EngineError::ActionNotFound(id))?;
        if !change(&mut action) {
            return Ok(action);
        }
        match store.update_action(&action) {
            Err(StorageError::ConcurrentConflict { .. }) => continue,
            other => return Ok(other?),
        }
    }
    Err(conflict("action", id.0))
}

fn conflict(entity: &'static str, id: u64) -> EngineError {
    EngineError::Storage(StorageError::Backend(format!(
        "{} {} kept changing after {} attempts",
        entity, id, MAX_WRITE_ATTEMPTS
    )))
}

// ──────────────────────────────────────────────
// Scratch data stores
// ──────────────────────────────────────────────

/// Where a [`DataStore`] keeps its entries.
pub(crate) enum DataTarget {
    Proposal(ProposalId),
    Action(ActionId),
    /// A record that has not been saved yet. Writes last for this evaluation.
    Detached(Rc<RefCell<DataMap>>),
}

/// `proposal.data` and `action.data`: a persisted key/value store.
pub(crate) struct DataStore {
    pub target: DataTarget,
    pub store: std::sync::Arc<dyn PolicyStore>,
}

impl DataStore {
    fn read(&self) -> Result<DataMap, EngineError> {
        match &self.target {
            DataTarget::Proposal(id) => Ok(self
                .store
                .get_proposal(*id)?
                .ok_or(EngineError::ProposalNotFound(*id))?
                .data),
            DataTarget::Action(id) => Ok(self
                .store
                .get_action(*id)?
                .ok_or(EngineError::ActionNotFound(*id))?
                .data),
            DataTarget::Detached(map) => Ok(map.borrow().clone()),
        }
    }

    /// Apply `change` to the stored map and return its result.
    fn write<T>(&self, mut change: impl FnMut(&mut DataMap) -> T) -> Result<T, EngineError> {
        let mut out = None;
        match &self.target {
            DataTarget::Proposal(id) => {
                modify_proposal(self.store.as_ref(), *id, |p| {
                    out = Some(change(&mut p.data));
                    true
                })?;
            }
            DataTarget::Action(id) => {
                modify_action(self.store.as_ref(), *id, |a| {
                    out = Some(change(&mut a.data));
                    true
                })?;
            }
            DataTarget::Detached(map) => out = Some(change(&mut map.borrow_mut())),
        }
        out.ok_or_else(|| EngineError::Storage(StorageError::Backend("data store write skipped".into())))
    }
}

impl HostObject for DataStore {
    fn type_name(&self) -> &str {
        "DataStore"
    }

    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "get" | "set" | "remove")
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        args.no_keywords(name)?;
        match name {
            "get" => {
                args.at_most(2, "get")?;
                let key = args.require(0, "key", "get")?.expect_str("key")?;
                let map = self.read()?;
                Ok(match map.get(key) {
                    Some(v) => from_json(v),
                    None => args.get(1, "default").cloned().unwrap_or(Value::None),
                })
            }
            "set" => {
                args.at_most(2, "set")?;
                let key = args.require(0, "key", "set")?.expect_str("key")?.to_string();
                let value = to_json(args.require(1, "value", "set")?)?;
                self.write(|map| {
                    map.insert(key.clone(), value.clone());
                })?;
                Ok(Value::Bool(true))
            }
            "remove" => {
                args.at_most(1, "remove")?;
                let key = args.require(0, "key", "remove")?.expect_str("key")?;
                let found = self.write(|map| map.remove(key).is_some())?;
                Ok(Value::Bool(found))
            }
            _ => Err(RuntimeError::attribute_error(format!(
                "'DataStore' object has no method '{}'",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use polity_storage::{ActionKind, CommunityId, CommunityRef, InMemoryStore, PolicyId};

    fn saved_proposal(store: &InMemoryStore) -> ProposalId {
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
        let proposal = ProposalRecord::new(action.id.unwrap(), PolicyId(9));
        store.insert_proposal(proposal).unwrap().id.unwrap()
    }

    fn call(obj: &DataStore, method: &str, args: Vec<Value>) -> Value {
        obj.call_method(method, CallArgs::new(args)).unwrap()
    }

    #[test]
    fn proposal_data_persists_between_calls() {
        let store = Arc::new(InMemoryStore::new());
        let id = saved_proposal(&store);
        let data = DataStore {
            target: DataTarget::Proposal(id),
            store: store.clone(),
        };
        assert_eq!(call(&data, "get", vec!["votes".into()]), Value::None);
        assert_eq!(call(&data, "get", vec!["votes".into(), Value::Int(0)]), Value::Int(0));
        assert_eq!(call(&data, "set", vec!["votes".into(), Value::Int(3)]), Value::Bool(true));
        assert_eq!(call(&data, "get", vec!["votes".into()]), Value::Int(3));

        let stored = store.get_proposal(id).unwrap().unwrap();
        assert_eq!(stored.data["votes"], serde_json::json!(3));
        assert_eq!(stored.version, 1);

        assert_eq!(call(&data, "remove", vec!["votes".into()]), Value::Bool(true));
        assert_eq!(call(&data, "remove", vec!["votes".into()]), Value::Bool(false));
    }

    #[test]
    fn detached_data_stays_in_memory() {
        let map = Rc::new(RefCell::new(DataMap::new()));
        let data = DataStore {
            target: DataTarget::Detached(Rc::clone(&map)),
            store: Arc::new(InMemoryStore::new()),
        };
        call(&data, "set", vec!["seen".into(), Value::Bool(true)]);
        assert_eq!(map.borrow()["seen"], serde_json::json!(true));
    }

    #[test]
    fn modify_skips_the_write_when_unchanged() {
        let store = InMemoryStore::new();
        let id = saved_proposal(&store);
        let p = modify_proposal(&store, id, |_| false).unwrap();
        assert_eq!(p.version, 0);
        let p = modify_proposal(&store, id, |p| {
            p.community_post = Some("ts-1".into());
            true
        })
        .unwrap();
        assert_eq!(p.version, 1);
    }

    #[test]
    fn missing_records_are_reported() {
        let store = InMemoryStore::new();
        let err = modify_action(&store, ActionId(40), |_| true).unwrap_err();
        assert!(matches!(err, EngineError::ActionNotFound(ActionId(40))));
    }
}
