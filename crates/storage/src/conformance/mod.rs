//! Conformance test suite for `PolicyStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `PolicyStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Identity**: ids are assigned on insert, misses return `None`
//! - **Version validation / OCC**: optimistic concurrency conflict detection
//! - **Ordering**: most recently modified policy first, id breaks ties
//! - **Filtering**: policy and proposal filters, audit trail queries
//! - **Deletion**: deleting a policy clears proposal references
//! - **Concurrency**: racing updates from several threads, exactly one wins
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty store for each test:
//!
//! ```ignore
//! use polity_storage::conformance::run_conformance_suite;
//!
//! #[test]
//! fn sqlite_conformance() {
//!     let report = run_conformance_suite(create_test_store);
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod records;
mod version;

use std::fmt;

use time::OffsetDateTime;

use crate::record::{
    ActionKind, ActionRecord, CommunityId, CommunityRef, PolicyDraft, PolicyKind, PolicyRecord,
};
use crate::PolicyStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "identity", "version", "ordering").
    pub category: String,
    /// Test name (e.g. "insert_assigns_distinct_ids").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// A named check run against a fresh store.
type Check<S> = (&'static str, &'static str, fn(&S) -> Result<(), String>);

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// store, ensuring test isolation.
pub fn run_conformance_suite<S, F>(factory: F) -> ConformanceReport
where
    S: PolicyStore,
    F: Fn() -> S,
{
    let mut checks: Vec<Check<S>> = Vec::new();
    checks.extend(records::checks::<S>());
    checks.extend(version::checks::<S>());
    checks.extend(concurrent::checks::<S>());

    let results: Vec<TestResult> = checks
        .into_iter()
        .map(|(category, name, check)| {
            let store = factory();
            TestResult::from_result(category, name, check(&store))
        })
        .collect();

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

const COMMUNITY: CommunityId = CommunityId(1);

fn make_action(action_type: &str) -> ActionRecord {
    ActionRecord::new(
        ActionKind::Platform,
        action_type,
        CommunityRef {
            community: COMMUNITY,
            platform: "slack".to_string(),
        },
    )
}

fn make_policy<S: PolicyStore>(
    store: &S,
    name: &str,
    modified_at: OffsetDateTime,
) -> Result<PolicyRecord, String> {
    store
        .insert_policy(
            COMMUNITY,
            PolicyDraft::new(PolicyKind::Platform, name),
            modified_at,
        )
        .map_err(|e| format!("insert policy: {e}"))
}

fn at(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(seconds)
}
