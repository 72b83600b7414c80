//! Backend-agnostic checks for [`Storage`] implementations.
//!
//! Sections:
//!
//! - `state`: GUID and logic id uniqueness, lookups, filtered listing
//! - `content`: content, serial and output rows written together; serial rules
//! - `lock`: one holder at a time, holder returned on conflict, unlock by id
//! - `outputs`: schema placeholders and validation bookkeeping
//! - `edges`: idempotent insert, endpoint listings, update, delete
//! - `concurrent`: racing lockers and racing edge inserts
//!
//! Each check gets its own store from the factory, so checks never observe
//! each other's rows:
//!
//! ```ignore
//! #[tokio::test]
//! async fn sqlite_passes_conformance() {
//!     let report = stategraph_storage::conformance::run_conformance_suite(|| async {
//!         SqliteStore::open_in_memory().expect("in-memory store")
//!     })
//!     .await;
//!     assert_eq!(report.failed, 0, "{report}");
//! }
//! ```

mod concurrent;
mod content;
mod edges;
mod lock;
mod outputs;
mod state;

use std::fmt;
use std::future::Future;

use crate::record::{ContentUpdate, EdgeStatus, Labels, LockInfo, NewEdge, NewState, OutputDigest};
use crate::Storage;

/// Outcome of one check.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Section, e.g. `lock`.
    pub category: String,
    pub name: String,
    pub passed: bool,
    /// Failure description; `None` when the check passed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, outcome: Result<(), String>) -> Self {
        let message = outcome.err();
        Self {
            category: category.to_owned(),
            name: name.to_owned(),
            passed: message.is_none(),
            message,
        }
    }
}

/// Every check outcome plus pass/fail counts.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ConformanceReport {
    fn from_results(results: Vec<TestResult>) -> Self {
        let failed = results.iter().filter(|r| !r.passed).count();
        Self {
            total: results.len(),
            passed: results.len() - failed,
            failed,
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} storage checks passed", self.passed, self.total)?;
        for r in self.failures() {
            let message = r.message.as_deref().unwrap_or("no detail");
            write!(f, "\n  {}::{} failed: {message}", r.category, r.name)?;
        }
        Ok(())
    }
}

/// Run every section against fresh stores produced by `factory`.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: Storage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = state::run_state_tests(&factory).await;
    results.extend(content::run_content_tests(&factory).await);
    results.extend(lock::run_lock_tests(&factory).await);
    results.extend(outputs::run_output_tests(&factory).await);
    results.extend(edges::run_edge_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);
    ConformanceReport::from_results(results)
}

// ── Record builders ──────────────────────────────────────────────────────────

const T0: &str = "2025-01-01T00:00:00Z";
const T1: &str = "2025-01-01T00:01:00Z";

fn make_state(guid: &str, logic_id: &str) -> NewState {
    NewState {
        guid: guid.to_string(),
        logic_id: logic_id.to_string(),
        labels: Labels::new(),
        created_at: T0.to_string(),
    }
}

fn make_lock(id: &str, who: &str) -> LockInfo {
    LockInfo {
        id: id.to_string(),
        operation: "OperationTypeApply".to_string(),
        info: String::new(),
        who: who.to_string(),
        version: "1.7.0".to_string(),
        created: T0.to_string(),
        path: String::new(),
    }
}

fn make_content(serial: i64, outputs: &[(&str, &str)]) -> ContentUpdate {
    let body = format!("{{\"serial\":{serial}}}");
    ContentUpdate {
        content: body.into_bytes(),
        serial,
        lineage: Some("lineage-1".to_string()),
        terraform_version: Some("1.7.0".to_string()),
        outputs: outputs
            .iter()
            .map(|(k, d)| OutputDigest {
                key: k.to_string(),
                digest: d.to_string(),
                sensitive: false,
            })
            .collect(),
        lock_id: None,
        expected_serial: None,
        updated_at: T1.to_string(),
    }
}

fn make_edge(from: &str, output: &str, to: &str) -> NewEdge {
    NewEdge {
        from_guid: from.to_string(),
        from_output: output.to_string(),
        to_guid: to.to_string(),
        to_input_name: output.to_string(),
        mock_value_json: None,
        status: EdgeStatus::Pending,
        out_digest: None,
        created_at: T0.to_string(),
    }
}

/// Create the named states on a fresh store, failing with a readable message.
async fn seed_states<S: Storage>(s: &S, states: &[(&str, &str)]) -> Result<(), String> {
    for (guid, logic_id) in states {
        s.create_state(make_state(guid, logic_id))
            .await
            .map_err(|e| format!("seed {logic_id}: {e}"))?;
    }
    Ok(())
}
