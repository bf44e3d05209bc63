use super::{at, make_action, make_policy, Check, COMMUNITY};
use crate::record::{
    ActionId, ActivityRecord, CommunityId, EvaluationLogRecord, LogLevel, PolicyId, PolicyKind,
    ProposalId, ProposalRecord, ProposalStatus,
};
use crate::{PolicyFilter, PolicyStore, ProposalFilter};

pub(super) fn checks<S: PolicyStore>() -> Vec<Check<S>> {
    let mut c: Vec<Check<S>> = Vec::new();
    c.push(("identity", "insert_assigns_distinct_ids", insert_assigns_distinct_ids::<S>));
    c.push(("identity", "missing_records_are_none", missing_records_are_none::<S>));
    c.push(("ordering", "policies_most_recent_first", policies_most_recent_first::<S>));
    c.push(("ordering", "timestamp_tie_prefers_higher_id", timestamp_tie_prefers_higher_id::<S>));
    c.push(("filter", "policy_filter_by_activity", policy_filter_by_activity::<S>));
    c.push(("filter", "proposal_filter_by_status", proposal_filter_by_status::<S>));
    c.push(("filter", "logs_by_proposal_and_community", logs_by_proposal_and_community::<S>));
    c.push(("filter", "activity_by_action", activity_by_action::<S>));
    c.push(("delete", "delete_policy_clears_references", delete_policy_clears_references::<S>));
    c.push(("delete", "delete_proposal_reports_removal", delete_proposal_reports_removal::<S>));
    c
}

fn insert_assigns_distinct_ids<S: PolicyStore>(store: &S) -> Result<(), String> {
    let a = store
        .insert_action(make_action("slackpostmessage"))
        .map_err(|e| format!("insert: {e}"))?;
    let b = store
        .insert_action(make_action("slackpostmessage"))
        .map_err(|e| format!("insert: {e}"))?;
    match (a.id, b.id) {
        (Some(x), Some(y)) if x != y => {}
        other => return Err(format!("expected two distinct ids, got {other:?}")),
    }
    if a.version != 0 {
        return Err(format!("expected version 0, got {}", a.version));
    }
    let read = store
        .get_action(a.id.unwrap_or(ActionId(0)))
        .map_err(|e| format!("get: {e}"))?;
    if read.as_ref() != Some(&a) {
        return Err(format!("read back {read:?}, expected {a:?}"));
    }
    Ok(())
}

fn missing_records_are_none<S: PolicyStore>(store: &S) -> Result<(), String> {
    let action = store.get_action(ActionId(999)).map_err(|e| e.to_string())?;
    let policy = store.get_policy(PolicyId(999)).map_err(|e| e.to_string())?;
    let proposal = store.get_proposal(ProposalId(999)).map_err(|e| e.to_string())?;
    if action.is_some() || policy.is_some() || proposal.is_some() {
        return Err("expected None for unknown ids".into());
    }
    Ok(())
}

fn policies_most_recent_first<S: PolicyStore>(store: &S) -> Result<(), String> {
    let old = make_policy(store, "old", at(10))?;
    let new = make_policy(store, "new", at(20))?;
    let mid = make_policy(store, "mid", at(15))?;
    let listed: Vec<PolicyId> = store
        .list_policies(&PolicyFilter::active(COMMUNITY, PolicyKind::Platform))
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|p| p.id)
        .collect();
    if listed != [new.id, mid.id, old.id] {
        return Err(format!("unexpected order {listed:?}"));
    }
    Ok(())
}

fn timestamp_tie_prefers_higher_id<S: PolicyStore>(store: &S) -> Result<(), String> {
    let first = make_policy(store, "first", at(10))?;
    let second = make_policy(store, "second", at(10))?;
    let listed = store
        .list_policies(&PolicyFilter::default())
        .map_err(|e| e.to_string())?;
    match listed.first() {
        Some(p) if p.id == second.id && second.id > first.id => Ok(()),
        other => Err(format!("expected {:?} first, got {other:?}", second.id)),
    }
}

fn policy_filter_by_activity<S: PolicyStore>(store: &S) -> Result<(), String> {
    let kept = make_policy(store, "kept", at(1))?;
    let mut removed = make_policy(store, "removed", at(2))?;
    removed.is_active = false;
    store.update_policy(&removed).map_err(|e| e.to_string())?;
    let other_community = store
        .insert_policy(
            CommunityId(2),
            crate::record::PolicyDraft::new(PolicyKind::Platform, "elsewhere"),
            at(3),
        )
        .map_err(|e| e.to_string())?;

    let active = store
        .list_policies(&PolicyFilter::active(COMMUNITY, PolicyKind::Platform))
        .map_err(|e| e.to_string())?;
    if active.len() != 1 || active[0].id != kept.id {
        return Err(format!("expected only {:?}, got {active:?}", kept.id));
    }
    let all = store
        .list_policies(&PolicyFilter::default())
        .map_err(|e| e.to_string())?;
    if !all.iter().any(|p| p.id == other_community.id) || all.len() != 3 {
        return Err(format!("unfiltered listing returned {} policies", all.len()));
    }
    Ok(())
}

fn proposal_filter_by_status<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "p", at(1))?;
    let action = store
        .insert_action(make_action("x"))
        .map_err(|e| e.to_string())?;
    let action_id = action.id.ok_or("action without id")?;
    let pending = store
        .insert_proposal(ProposalRecord::new(action_id, policy.id))
        .map_err(|e| e.to_string())?;
    let mut done = store
        .insert_proposal(ProposalRecord::new(action_id, policy.id))
        .map_err(|e| e.to_string())?;
    done.status = ProposalStatus::Passed;
    store.update_proposal(&done).map_err(|e| e.to_string())?;

    let proposed = store
        .list_proposals(&ProposalFilter::status(ProposalStatus::Proposed))
        .map_err(|e| e.to_string())?;
    if proposed.len() != 1 || proposed[0].id != pending.id {
        return Err(format!("expected only {:?}, got {proposed:?}", pending.id));
    }
    let for_action = store
        .list_proposals(&ProposalFilter {
            action: Some(action_id),
            ..ProposalFilter::default()
        })
        .map_err(|e| e.to_string())?;
    if for_action.len() != 2 || for_action[0].id >= for_action[1].id {
        return Err(format!("expected two proposals in id order, got {for_action:?}"));
    }
    Ok(())
}

fn log(community: CommunityId, proposal: Option<ProposalId>, message: &str) -> EvaluationLogRecord {
    EvaluationLogRecord {
        community,
        proposal,
        level: LogLevel::Info,
        message: message.to_string(),
        trace: None,
        created_at: at(0),
    }
}

fn logs_by_proposal_and_community<S: PolicyStore>(store: &S) -> Result<(), String> {
    store
        .append_log(log(COMMUNITY, Some(ProposalId(5)), "one"))
        .map_err(|e| e.to_string())?;
    store
        .append_log(log(COMMUNITY, None, "two"))
        .map_err(|e| e.to_string())?;
    store
        .append_log(log(CommunityId(9), Some(ProposalId(5)), "three"))
        .map_err(|e| e.to_string())?;
    let by_proposal: Vec<String> = store
        .logs_for_proposal(ProposalId(5))
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|l| l.message)
        .collect();
    if by_proposal != ["one", "three"] {
        return Err(format!("proposal logs {by_proposal:?}"));
    }
    let by_community = store
        .logs_for_community(COMMUNITY)
        .map_err(|e| e.to_string())?;
    if by_community.len() != 2 {
        return Err(format!("community logs {by_community:?}"));
    }
    Ok(())
}

fn activity_by_action<S: PolicyStore>(store: &S) -> Result<(), String> {
    for (action, verb) in [(1, "was proposed"), (2, "was proposed"), (1, "was passed")] {
        store
            .record_activity(ActivityRecord {
                action: ActionId(action),
                community: COMMUNITY,
                action_type: "x".into(),
                verb: verb.into(),
                created_at: at(0),
            })
            .map_err(|e| e.to_string())?;
    }
    let verbs: Vec<String> = store
        .activity_for_action(ActionId(1))
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|a| a.verb)
        .collect();
    if verbs != ["was proposed", "was passed"] {
        return Err(format!("activity {verbs:?}"));
    }
    Ok(())
}

fn delete_policy_clears_references<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "doomed", at(1))?;
    let action = store
        .insert_action(make_action("x"))
        .map_err(|e| e.to_string())?;
    let proposal = store
        .insert_proposal(ProposalRecord::new(action.id.ok_or("no id")?, policy.id))
        .map_err(|e| e.to_string())?;
    store.delete_policy(policy.id).map_err(|e| e.to_string())?;
    if store.get_policy(policy.id).map_err(|e| e.to_string())?.is_some() {
        return Err("policy still readable after delete".into());
    }
    let reread = store
        .get_proposal(proposal.id.ok_or("no id")?)
        .map_err(|e| e.to_string())?
        .ok_or("proposal vanished with its policy")?;
    if reread.policy.is_some() {
        return Err(format!("policy reference not cleared: {:?}", reread.policy));
    }
    Ok(())
}

fn delete_proposal_reports_removal<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "p", at(1))?;
    let proposal = store
        .insert_proposal(ProposalRecord::new(ActionId(1), policy.id))
        .map_err(|e| e.to_string())?;
    let id = proposal.id.ok_or("no id")?;
    let first = store.delete_proposal(id).map_err(|e| e.to_string())?;
    let second = store.delete_proposal(id).map_err(|e| e.to_string())?;
    if !first || second {
        return Err(format!("delete returned {first} then {second}"));
    }
    Ok(())
}
