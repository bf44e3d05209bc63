//! Re-evaluation of pending proposals across sweeps.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{at, platform_action, Harness};
use polity_core::Stage;
use polity_engine::{Scheduler, SweepReport};
use polity_storage::{LogLevel, PolicyKind, PolicyStore, ProposalId, ProposalStatus};
use serde_json::json;
use tokio::sync::watch;

const POLL_VOTE: &str = "\
process = metagov.get_process()
if process is None or process.status != 'completed':
    return PROPOSED
if process.outcome['yes'] > process.outcome['no']:
    return PASSED
return FAILED";

fn set_data(h: &Harness, id: ProposalId, key: &str, value: serde_json::Value) {
    let mut proposal = h.proposal(id);
    proposal.data.insert(key.to_string(), value);
    h.store.update_proposal(&proposal).unwrap();
}

#[test]
fn governance_outcome_decides_on_a_later_sweep() {
    let h = Harness::new();
    h.base_policy(
        "poll",
        &[
            (
                Stage::Initialize,
                "metagov.start_process('loomio.poll', title='Rename the channel?')",
            ),
            (Stage::Check, POLL_VOTE),
            (Stage::Success, "action.execute()"),
        ],
    );
    let proposal = h.propose_one(platform_action("slackrenameconversation", false));
    let id = proposal.id.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Proposed);
    {
        let started = h.governance.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "loomio.poll");
        assert_eq!(started[0].1, json!({ "title": "Rename the channel?" }));
    }
    assert!(h.proposal(id).governance_process.is_some());

    let scheduler = Scheduler::new(Arc::clone(&h.engine));
    let report = scheduler.sweep().unwrap();
    assert_eq!(
        report,
        SweepReport {
            evaluated: 1,
            pending: 1,
            ..SweepReport::default()
        }
    );
    assert_eq!(h.slack.executed(), 0);

    h.governance.complete_with(json!({ "yes": 3, "no": 1 }));
    let report = scheduler.sweep().unwrap();
    assert_eq!(report.passed, 1);
    assert_eq!(h.proposal(id).status, ProposalStatus::Passed);
    assert_eq!(h.slack.executed(), 1);
    // The process had already completed; nothing left to close.
    assert_eq!(h.governance.closed(), 0);

    // Decided proposals drop out of later sweeps.
    assert_eq!(scheduler.sweep().unwrap(), SweepReport::default());
}

#[test]
fn deciding_before_the_process_completes_closes_it() {
    let h = Harness::new();
    h.base_policy(
        "veto",
        &[
            (Stage::Initialize, "metagov.start_process('loomio.poll')"),
            (
                Stage::Check,
                "if proposal.data.get('vetoed'):\n    return FAILED\nreturn PROPOSED",
            ),
        ],
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    let id = proposal.id.unwrap();

    let scheduler = Scheduler::new(Arc::clone(&h.engine));
    assert_eq!(scheduler.sweep().unwrap().pending, 1);
    assert_eq!(h.governance.closed(), 0);

    set_data(&h, id, "vetoed", json!(true));
    assert_eq!(scheduler.sweep().unwrap().failed, 1);
    assert_eq!(h.proposal(id).status, ProposalStatus::Failed);
    assert_eq!(h.governance.closed(), 1);
    let process = h.proposal(id).governance_process.unwrap();
    assert_eq!(process.last_known["status"], "completed");
}

#[test]
fn deactivated_policy_hands_the_action_to_the_next_one() {
    let h = Harness::new();
    let base = h.base_policy(
        "base",
        &[(Stage::Check, "return PASSED"), (Stage::Success, "action.execute()")],
    );
    let mut strict = h.policy(
        PolicyKind::Platform,
        "strict",
        &[],
        &[(Stage::Check, "return PROPOSED")],
        at(10),
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    assert_eq!(proposal.policy, Some(strict.id));

    strict.is_active = false;
    h.store.update_policy(&strict).unwrap();

    let report = Scheduler::new(Arc::clone(&h.engine)).sweep().unwrap();
    assert_eq!(report.restarted, 1);
    assert_eq!(h.store.get_proposal(proposal.id.unwrap()).unwrap(), None);

    let remaining = h.proposals_for(proposal.action);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].policy, Some(base.id));
    assert_eq!(remaining[0].status, ProposalStatus::Passed);
    assert_eq!(h.slack.executed(), 1);
}

#[test]
fn deleted_policy_hands_the_action_to_the_next_one() {
    let h = Harness::new();
    let base = h.base_policy("base", &[(Stage::Check, "return FAILED")]);
    let doomed = h.policy(
        PolicyKind::Platform,
        "doomed",
        &[],
        &[(Stage::Check, "return PROPOSED")],
        at(10),
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    h.store.delete_policy(doomed.id).unwrap();

    let report = Scheduler::new(Arc::clone(&h.engine)).sweep().unwrap();
    assert_eq!(report.restarted, 1);
    let remaining = h.proposals_for(proposal.action);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].policy, Some(base.id));
    assert_eq!(remaining[0].status, ProposalStatus::Failed);
}

#[test]
fn failing_reevaluation_leaves_the_proposal_pending() {
    let h = Harness::new();
    h.base_policy(
        "fragile",
        &[(
            Stage::Check,
            "if proposal.data.get('armed'):\n    raise Exception('tripped')\nreturn PROPOSED",
        )],
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    let id = proposal.id.unwrap();
    set_data(&h, id, "armed", json!(true));

    let report = Scheduler::new(Arc::clone(&h.engine)).sweep().unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(h.proposal(id).status, ProposalStatus::Proposed);

    let logs = h.store.logs_for_proposal(id).unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Error && l.message.contains("tripped")));
}

#[test]
fn proposal_data_persists_between_passes() {
    let h = Harness::new();
    h.base_policy(
        "third time",
        &[(
            Stage::Check,
            "n = proposal.data.get('passes', 0) + 1\nproposal.data.set('passes', n)\nif n >= 3:\n    return PASSED\nreturn PROPOSED",
        )],
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    let id = proposal.id.unwrap();
    let scheduler = Scheduler::new(Arc::clone(&h.engine));

    assert_eq!(scheduler.sweep().unwrap().pending, 1);
    assert_eq!(scheduler.sweep().unwrap().passed, 1);
    let decided = h.proposal(id);
    assert_eq!(decided.status, ProposalStatus::Passed);
    assert_eq!(decided.data["passes"], json!(3));
}

#[tokio::test]
async fn run_sweeps_until_shut_down() {
    let h = Harness::new();
    h.base_policy(
        "poll",
        &[
            (Stage::Initialize, "metagov.start_process('loomio.poll')"),
            (Stage::Check, POLL_VOTE),
        ],
    );
    let proposal = h.propose_one(platform_action("slackpostmessage", false));
    let id = proposal.id.unwrap();
    h.governance.complete_with(json!({ "yes": 0, "no": 2 }));

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&h.engine)));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run(Duration::from_millis(10), rx).await }
    });

    let mut status = ProposalStatus::Proposed;
    for _ in 0..200 {
        status = h.proposal(id).status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, ProposalStatus::Failed);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}
