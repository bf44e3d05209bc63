//! Guarantees that hold across policy sets: one governing policy per
//! governable action, one proposal per passing trigger policy, terminal
//! proposals are final, and untrusted code cannot break out.

mod common;

use common::{at, platform_action, trigger_action, Harness};
use polity_core::Stage;
use polity_storage::{PolicyKind, PolicyStore, ProposalFilter, ProposalStatus};

#[test]
fn governable_actions_get_exactly_one_proposal() {
    let h = Harness::new();
    for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
        h.policy(
            PolicyKind::Platform,
            name,
            &[],
            &[(Stage::Check, "return PASSED")],
            at(i as i64),
        );
    }

    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    assert_eq!(h.proposals_for(proposal.action).len(), 1);
    assert_eq!(
        h.store
            .list_proposals(&ProposalFilter::default())
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn every_passing_trigger_policy_gets_a_proposal() {
    let h = Harness::new();
    let accepts = &[(Stage::Filter, "return True")];
    let first = h.policy(PolicyKind::Trigger, "first", &["reaction"], accepts, at(1));
    let second = h.policy(PolicyKind::Trigger, "second", &["reaction"], &[], at(2));
    h.policy(
        PolicyKind::Trigger,
        "declines",
        &["reaction"],
        &[(Stage::Filter, "return False")],
        at(3),
    );
    h.policy(PolicyKind::Trigger, "elsewhere", &["join"], &[], at(4));
    // Trigger policies never act as a wildcard.
    h.policy(PolicyKind::Trigger, "wildcard", &[], &[], at(5));

    let proposals = h.engine.propose_and_evaluate(trigger_action("reaction")).unwrap();
    let mut governing: Vec<_> = proposals.iter().filter_map(|p| p.policy).collect();
    governing.sort();
    assert_eq!(governing, [first.id, second.id]);

    let action = proposals[0].action;
    assert!(proposals.iter().all(|p| p.action == action));
    assert!(proposals.iter().all(|p| p.status == ProposalStatus::Proposed));
}

#[test]
fn trigger_without_policies_is_not_an_error() {
    let h = Harness::new();
    h.base_policy("platform only", &[]);
    let proposals = h.engine.propose_and_evaluate(trigger_action("reaction")).unwrap();
    assert!(proposals.is_empty());
}

#[test]
fn decided_proposals_are_not_evaluated_again() {
    let h = Harness::new();
    h.base_policy(
        "announce",
        &[
            (Stage::Check, "return PASSED"),
            (Stage::Success, "slack.make_call('announce')\naction.execute()"),
        ],
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    let id = proposal.id.unwrap();
    assert_eq!(h.slack.endpoints(), ["announce"]);
    assert_eq!(h.slack.executed(), 1);

    for _ in 0..3 {
        assert_eq!(
            h.engine.evaluate_proposal(id, false).unwrap(),
            ProposalStatus::Passed
        );
    }
    assert_eq!(h.slack.endpoints(), ["announce"]);
    assert_eq!(h.slack.executed(), 1);
    assert_eq!(h.store.activity_for_action(proposal.action).unwrap().len(), 1);
}

#[test]
fn executing_twice_from_policy_code_runs_once() {
    let h = Harness::new();
    h.base_policy(
        "eager",
        &[
            (Stage::Check, "return PASSED"),
            (Stage::Success, "action.execute()\naction.execute()"),
        ],
    );
    h.propose_one(platform_action("slackpostmessage", false));
    assert_eq!(h.slack.executed(), 1);
}

#[test]
fn disallowed_filter_declines_the_action() {
    let h = Harness::new();
    h.base_policy("escape", &[(Stage::Filter, "import os\nreturn True")]);
    let proposals = h
        .engine
        .propose_and_evaluate(platform_action("slackpostmessage", false))
        .unwrap();
    assert!(proposals.is_empty());
    assert_eq!(h.slack.executed(), 0);
}

#[test]
fn disallowed_check_never_executes() {
    let h = Harness::new();
    h.base_policy(
        "escape",
        &[
            (Stage::Check, "import os\nreturn PASSED"),
            (Stage::Success, "action.execute()"),
        ],
    );
    let proposals = h
        .engine
        .propose_and_evaluate(platform_action("slackpostmessage", false))
        .unwrap();
    assert!(proposals.is_empty());
    assert_eq!(h.slack.executed(), 0);
    assert!(h
        .store
        .list_proposals(&ProposalFilter::default())
        .unwrap()
        .is_empty());
}

#[test]
fn dunder_access_is_rejected_before_running() {
    let h = Harness::new();
    h.base_policy(
        "escape",
        &[
            (Stage::Check, "return action.__class__"),
            (Stage::Success, "action.execute()"),
        ],
    );
    let proposals = h
        .engine
        .propose_and_evaluate(platform_action("slackpostmessage", false))
        .unwrap();
    assert!(proposals.is_empty());
    assert_eq!(h.slack.executed(), 0);
}

#[test]
fn unrecognised_check_results_leave_the_proposal_pending() {
    for body in [
        "return 42",
        "return 'PASSED'",
        "return None",
        "return [PASSED]",
        "return True",
        "pass",
    ] {
        let h = Harness::new();
        h.base_policy(
            "odd",
            &[(Stage::Check, body), (Stage::Success, "action.execute()")],
        );
        let proposal = h.propose_one(platform_action("slackpostmessage", false));
        assert_eq!(proposal.status, ProposalStatus::Proposed, "{body}");
        assert_eq!(h.slack.executed(), 0, "{body}");
    }
}

#[test]
fn modification_time_ties_go_to_the_newer_policy() {
    let h = Harness::new();
    let older = h.policy(
        PolicyKind::Platform,
        "first",
        &[],
        &[(Stage::Check, "return PASSED")],
        at(5),
    );
    let newer = h.policy(
        PolicyKind::Platform,
        "second",
        &[],
        &[(Stage::Check, "return FAILED")],
        at(5),
    );
    assert!(newer.id > older.id);

    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    assert_eq!(proposal.policy, Some(newer.id));
    assert_eq!(proposal.status, ProposalStatus::Failed);
}

#[test]
fn inactive_and_other_kinds_are_not_candidates() {
    let h = Harness::new();
    let mut retired = h.policy(
        PolicyKind::Platform,
        "retired",
        &[],
        &[(Stage::Check, "return FAILED")],
        at(50),
    );
    retired.is_active = false;
    h.store.update_policy(&retired).unwrap();
    h.policy(
        PolicyKind::Constitution,
        "constitution",
        &[],
        &[(Stage::Check, "return FAILED")],
        at(40),
    );
    let live = h.base_policy("live", &[(Stage::Check, "return PASSED")]);

    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    assert_eq!(proposal.policy, Some(live.id));
    assert_eq!(proposal.status, ProposalStatus::Passed);
}
