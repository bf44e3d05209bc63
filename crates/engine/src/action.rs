//! The execute and revert capability, and the `action` object policy code
//! sees.
//!
//! Both operations claim the record with an optimistic write before touching
//! the platform, so an action is executed (or reverted) at most once however
//! many evaluations race to do it. The executability predicate is re-checked
//! against the stored record at that moment, never against an earlier read.

use std::cell::RefCell;
use std::rc::Rc;

use polity_sandbox::json::from_json;
use polity_sandbox::{CallArgs, HostObject, RuntimeError, Value};
use polity_storage::{ActionId, ActionKind, ActionRecord, DataMap, Initiator};
use tracing::{debug, warn};

use crate::constitution;
use crate::error::EngineError;
use crate::host::{modify_action, DataStore, DataTarget};
use crate::platform::PlatformError;
use crate::Services;

/// Execute a stored action if it is executable and not yet executed.
/// Returns whether this call executed it.
pub fn execute(services: &Services, id: ActionId) -> Result<bool, EngineError> {
    let store = services.store.as_ref();
    let mut claimed = false;
    let action = modify_action(store, id, |a| {
        claimed = !a.executed && a.is_executable();
        if claimed {
            a.executed = true;
        }
        claimed
    })?;
    if !claimed {
        debug!(action = %id, executed = action.executed, "action not executable, skipping execute");
        return Ok(false);
    }

    let result = match &action.kind {
        ActionKind::Platform => services
            .platforms
            .get(action.community.community, &action.community.platform)
            .ok_or_else(|| PlatformError::NotConnected(action.community.platform.clone()))
            .and_then(|adapter| adapter.execute(&action))
            .map_err(EngineError::from),
        ActionKind::Constitution { change } => constitution::apply(
            store,
            action.community.community,
            change,
            &services.platforms.names(action.community.community),
        ),
        ActionKind::Trigger { .. } => Ok(()),
    };

    if let Err(e) = result {
        warn!(action = %id, error = %e, "execute failed, releasing claim");
        modify_action(store, id, |a| {
            a.executed = false;
            true
        })?;
        return Err(e);
    }
    debug!(action = %id, action_type = %action.action_type, "executed action");
    Ok(true)
}

/// Revert a reversible action on its platform. Returns whether this call
/// reverted it.
pub fn revert(services: &Services, id: ActionId) -> Result<bool, EngineError> {
    let store = services.store.as_ref();
    let mut claimed = false;
    let action = modify_action(store, id, |a| {
        claimed = !a.community_revert && a.is_reversible();
        if claimed {
            a.community_revert = true;
        }
        claimed
    })?;
    if !claimed {
        return Ok(false);
    }

    let result = services
        .platforms
        .get(action.community.community, &action.community.platform)
        .ok_or_else(|| PlatformError::NotConnected(action.community.platform.clone()))
        .and_then(|adapter| adapter.revert(&action));

    if let Err(e) = result {
        warn!(action = %id, error = %e, "revert failed, releasing claim");
        modify_action(store, id, |a| {
            a.community_revert = false;
            true
        })?;
        return Err(e.into());
    }
    debug!(action = %id, action_type = %action.action_type, "reverted action");
    Ok(true)
}

// ──────────────────────────────────────────────
// Policy-facing objects
// ──────────────────────────────────────────────

/// `action` in policy code. Flags are read from the store on every access
/// so they reflect executes and reverts made earlier in the same pass.
pub(crate) struct ActionObject {
    snapshot: RefCell<ActionRecord>,
    services: Services,
    /// Ids executed through this object, so the engine can fire triggers.
    executed: Rc<RefCell<Vec<ActionId>>>,
    detached: Rc<RefCell<DataMap>>,
}

impl ActionObject {
    pub fn new(
        record: ActionRecord,
        services: Services,
        executed: Rc<RefCell<Vec<ActionId>>>,
    ) -> Self {
        let detached = Rc::new(RefCell::new(record.data.clone()));
        ActionObject {
            snapshot: RefCell::new(record),
            services,
            executed,
            detached,
        }
    }

    fn current(&self) -> ActionRecord {
        let id = self.snapshot.borrow().id;
        if let Some(Ok(Some(fresh))) = id.map(|id| self.services.store.get_action(id)) {
            *self.snapshot.borrow_mut() = fresh;
        }
        self.snapshot.borrow().clone()
    }

    fn saved_id(&self, method: &str) -> Result<ActionId, RuntimeError> {
        self.snapshot.borrow().id.ok_or_else(|| {
            RuntimeError::new(
                "RuntimeError",
                format!("{}() needs a saved action", method),
            )
        })
    }
}

impl HostObject for ActionObject {
    fn type_name(&self) -> &str {
        "Action"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let a = self.current();
        let value = match name {
            "id" => a.id.map(|id| Value::Int(id.0 as i64)).unwrap_or(Value::None),
            "kind" => Value::from(a.kind.policy_kind().as_str()),
            "action_type" => Value::from(a.action_type.as_str()),
            "platform" => Value::from(a.community.platform.as_str()),
            "initiator" => match a.initiator {
                Some(user) => Value::object(UserObject(user)),
                None => Value::None,
            },
            "community_origin" => Value::Bool(a.community_origin),
            "community_revert" => Value::Bool(a.community_revert),
            "executed" => Value::Bool(a.executed),
            "is_executable" => Value::Bool(a.is_executable()),
            "is_reversible" => Value::Bool(a.is_reversible()),
            "created_at" => Value::DateTime(a.created_at),
            "data" => {
                let target = match a.id {
                    Some(id) => DataTarget::Action(id),
                    None => DataTarget::Detached(Rc::clone(&self.detached)),
                };
                Value::object(DataStore {
                    target,
                    store: self.services.store.clone(),
                })
            }
            "change" => match &a.kind {
                ActionKind::Constitution { change } => {
                    from_json(&serde_json::to_value(change).ok()?)
                }
                _ => return None,
            },
            other => return a.payload.get(other).map(from_json),
        };
        Some(value)
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "execute" | "revert")
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        args.at_most(0, name)?;
        args.no_keywords(name)?;
        match name {
            "execute" => {
                let id = self.saved_id("execute")?;
                if execute(&self.services, id)? {
                    self.executed.borrow_mut().push(id);
                }
                Ok(Value::None)
            }
            "revert" => {
                let id = self.saved_id("revert")?;
                revert(&self.services, id)?;
                Ok(Value::None)
            }
            _ => Err(RuntimeError::attribute_error(format!(
                "'Action' object has no method '{}'",
                name
            ))),
        }
    }

    fn repr(&self) -> String {
        let a = self.snapshot.borrow();
        match a.id {
            Some(id) => format!("<Action {} {}>", a.action_type, id),
            None => format!("<Action {}>", a.action_type),
        }
    }
}

/// `action.initiator`.
struct UserObject(Initiator);

impl HostObject for UserObject {
    fn type_name(&self) -> &str {
        "User"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let strings = |items: &[String]| {
            Value::list(items.iter().map(|s| Value::from(s.as_str())).collect())
        };
        match name {
            "id" => Some(Value::from(self.0.id.as_str())),
            "username" => Some(Value::from(self.0.username.as_str())),
            "roles" => Some(strings(&self.0.roles)),
            "permissions" => Some(strings(&self.0.permissions)),
            _ => None,
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "has_role" | "has_permission")
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RuntimeError> {
        args.at_most(1, name)?;
        let wanted = args.require(0, "name", name)?.expect_str("name")?;
        let held = match name {
            "has_role" => &self.0.roles,
            "has_permission" => &self.0.permissions,
            _ => {
                return Err(RuntimeError::attribute_error(format!(
                    "'User' object has no method '{}'",
                    name
                )))
            }
        };
        Ok(Value::Bool(held.iter().any(|h| h == wanted)))
    }

    fn repr(&self) -> String {
        format!("<User {}>", self.0.username)
    }
}
