//! Periodic re-evaluation of pending proposals.

use std::sync::Arc;
use std::time::Duration;

use polity_storage::{ProposalFilter, ProposalStatus};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::EngineError;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    /// Stale proposals deleted and sent back through selection.
    pub restarted: usize,
    /// Proposals whose evaluation errored; they stay pending.
    pub errors: usize,
}

pub struct Scheduler {
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Scheduler { engine }
    }

    /// Re-evaluate every proposal that is still `proposed`.
    pub fn sweep(&self) -> Result<SweepReport, EngineError> {
        sweep(&self.engine)
    }

    /// Sweep every `interval` on the blocking pool until `shutdown` becomes
    /// `true` or its sender is dropped.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "re-evaluation scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = Arc::clone(&self.engine);
                    match tokio::task::spawn_blocking(move || sweep(&engine)).await {
                        Ok(Ok(report)) => debug!(?report, "sweep finished"),
                        Ok(Err(e)) => warn!(error = %e, "sweep failed"),
                        Err(e) => warn!(error = %e, "sweep task join error"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("re-evaluation scheduler stopped");
    }
}

fn sweep(engine: &Engine) -> Result<SweepReport, EngineError> {
    let mut report = SweepReport::default();
    let pending = engine
        .store()
        .list_proposals(&ProposalFilter::status(ProposalStatus::Proposed))?;
    for proposal in pending {
        let Some(id) = proposal.id else { continue };
        report.evaluated += 1;
        match engine.evaluate_proposal(id, false) {
            Ok(ProposalStatus::Passed) => report.passed += 1,
            Ok(ProposalStatus::Failed) => report.failed += 1,
            Ok(ProposalStatus::Proposed) => report.pending += 1,
            Err(e) if e.is_stale() => {
                info!(proposal = %id, reason = %e, "stale proposal, restarting selection");
                match engine.delete_and_rerun(&proposal) {
                    Ok(_) => report.restarted += 1,
                    Err(e) => {
                        warn!(proposal = %id, error = %e, "restarting selection failed");
                        report.errors += 1;
                    }
                }
            }
            // Deleted by a concurrent evaluation since the listing.
            Err(EngineError::ProposalNotFound(_)) => report.evaluated -= 1,
            Err(e) => {
                warn!(proposal = %id, error = %e, "re-evaluation failed, leaving proposal pending");
                report.errors += 1;
            }
        }
    }
    Ok(report)
}
