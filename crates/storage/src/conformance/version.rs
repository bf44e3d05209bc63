use super::{at, make_action, make_policy, Check};
use crate::record::{ActionId, ProposalRecord, ProposalStatus};
use crate::{PolicyStore, StorageError};

pub(super) fn checks<S: PolicyStore>() -> Vec<Check<S>> {
    let mut c: Vec<Check<S>> = Vec::new();
    c.push(("version", "update_increments_version", update_increments_version::<S>));
    c.push(("version", "stale_action_update_conflicts", stale_action_update_conflicts::<S>));
    c.push(("version", "stale_proposal_update_conflicts", stale_proposal_update_conflicts::<S>));
    c.push(("version", "stale_policy_update_conflicts", stale_policy_update_conflicts::<S>));
    c.push(("version", "update_unknown_is_not_found", update_unknown_is_not_found::<S>));
    c.push(("version", "update_unsaved_is_rejected", update_unsaved_is_rejected::<S>));
    c
}

fn update_increments_version<S: PolicyStore>(store: &S) -> Result<(), String> {
    let mut action = store
        .insert_action(make_action("x"))
        .map_err(|e| e.to_string())?;
    for expected in 1..=3 {
        action.community_revert = !action.community_revert;
        action = store.update_action(&action).map_err(|e| e.to_string())?;
        if action.version != expected {
            return Err(format!("expected version {expected}, got {}", action.version));
        }
    }
    let stored = store
        .get_action(action.id.ok_or("no id")?)
        .map_err(|e| e.to_string())?
        .ok_or("action missing")?;
    if stored.version != 3 || !stored.community_revert {
        return Err(format!("stored record not updated: {stored:?}"));
    }
    Ok(())
}

fn expect_conflict<T: std::fmt::Debug>(result: Result<T, StorageError>) -> Result<(), String> {
    match result {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
}

fn stale_action_update_conflicts<S: PolicyStore>(store: &S) -> Result<(), String> {
    let action = store
        .insert_action(make_action("x"))
        .map_err(|e| e.to_string())?;
    let stale = action.clone();
    let mut fresh = action;
    fresh.executed = true;
    store.update_action(&fresh).map_err(|e| e.to_string())?;
    expect_conflict(store.update_action(&stale))?;

    let stored = store
        .get_action(stale.id.ok_or("no id")?)
        .map_err(|e| e.to_string())?
        .ok_or("action missing")?;
    if !stored.executed {
        return Err("losing writer overwrote the winner".into());
    }
    Ok(())
}

fn stale_proposal_update_conflicts<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "p", at(1))?;
    let proposal = store
        .insert_proposal(ProposalRecord::new(ActionId(1), policy.id))
        .map_err(|e| e.to_string())?;
    let mut first = proposal.clone();
    first.status = ProposalStatus::Passed;
    store.update_proposal(&first).map_err(|e| e.to_string())?;
    let mut second = proposal;
    second.status = ProposalStatus::Failed;
    expect_conflict(store.update_proposal(&second))
}

fn stale_policy_update_conflicts<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "p", at(1))?;
    let mut renamed = policy.clone();
    renamed.name = "renamed".into();
    store.update_policy(&renamed).map_err(|e| e.to_string())?;
    expect_conflict(store.update_policy(&policy))
}

fn update_unknown_is_not_found<S: PolicyStore>(store: &S) -> Result<(), String> {
    let mut ghost = make_action("x");
    ghost.id = Some(ActionId(4242));
    match store.update_action(&ghost) {
        Err(StorageError::NotFound { entity: "action", id: 4242 }) => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}

fn update_unsaved_is_rejected<S: PolicyStore>(store: &S) -> Result<(), String> {
    match store.update_action(&make_action("x")) {
        Err(StorageError::Unsaved { .. }) => Ok(()),
        other => Err(format!("expected Unsaved, got {other:?}")),
    }
}
