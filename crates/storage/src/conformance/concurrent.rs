use std::thread;

use super::{at, make_action, make_policy, Check};
use crate::record::{ProposalRecord, ProposalStatus};
use crate::{PolicyStore, StorageError};

/// Number of threads racing in each test.
const N: usize = 8;

pub(super) fn checks<S: PolicyStore>() -> Vec<Check<S>> {
    let mut c: Vec<Check<S>> = Vec::new();
    c.push(("concurrent", "racing_updates_exactly_one_wins", racing_updates_exactly_one_wins::<S>));
    c.push(("concurrent", "concurrent_inserts_get_unique_ids", concurrent_inserts_get_unique_ids::<S>));
    c
}

/// N threads read the same proposal at version 0 and each tries to move it
/// to a terminal status. Exactly one update succeeds; the rest must get
/// ConcurrentConflict.
fn racing_updates_exactly_one_wins<S: PolicyStore>(store: &S) -> Result<(), String> {
    let policy = make_policy(store, "p", at(1))?;
    let action = store
        .insert_action(make_action("x"))
        .map_err(|e| e.to_string())?;
    let proposal = store
        .insert_proposal(ProposalRecord::new(action.id.ok_or("no id")?, policy.id))
        .map_err(|e| e.to_string())?;

    let outcomes: Vec<Result<(), StorageError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let mut mine = proposal.clone();
                mine.status = if i % 2 == 0 {
                    ProposalStatus::Passed
                } else {
                    ProposalStatus::Failed
                };
                s.spawn(move || store.update_proposal(&mine).map(|_| ()))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(StorageError::Backend("thread panicked".into())))
            })
            .collect()
    });

    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(StorageError::ConcurrentConflict { .. })))
        .count();
    if wins != 1 || conflicts != N - 1 {
        return Err(format!("{wins} wins and {conflicts} conflicts: {outcomes:?}"));
    }
    Ok(())
}

fn concurrent_inserts_get_unique_ids<S: PolicyStore>(store: &S) -> Result<(), String> {
    let ids: Vec<Option<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|_| s.spawn(|| store.insert_action(make_action("x")).ok().and_then(|a| a.id)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().ok().flatten().map(|id| id.0))
            .collect()
    });
    let mut unique: Vec<u64> = ids.iter().flatten().copied().collect();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != N {
        return Err(format!("expected {N} unique ids, got {ids:?}"));
    }
    Ok(())
}
