//! Result Aggregator
//!
//! Reduces the results streamed by all supervisors (and the in-process path)
//! to exactly one terminal outcome per planned item. The first result for an
//! item wins; anything arriving later is counted and dropped.

use crate::supervisor::{EventSink, GroupOutcome, SupervisorEvent};
use fxhash::FxHashMap;
use isocell_core::TestItem;
use isocell_ipc::{ErrorKind, PhaseStatus, TestResult};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Final status of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    /// Every phase passed
    Passed,
    /// The body failed, or the supervisor gave up on the test
    Failed,
    /// Setup or teardown failed
    Errored,
    /// The test skipped itself
    Skipped,
    /// Failed as expected
    XFailed,
    /// Passed although a failure was expected
    XPassed,
}

impl OutcomeStatus {
    /// Whether this status fails the run
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            OutcomeStatus::Failed | OutcomeStatus::Errored | OutcomeStatus::XPassed
        )
    }
}

/// Outward record of one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Test identifier
    pub id: String,
    /// Final status
    pub status: OutcomeStatus,
    /// Wall time
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Captured standard output (empty for passed tests unless requested)
    pub stdout: String,
    /// Captured standard error (empty for passed tests unless requested)
    pub stderr: String,
    /// Failure message
    pub failure_message: Option<String>,
    /// Panic location and backtrace
    pub traceback: Option<String>,
    /// Error category
    pub error_kind: Option<ErrorKind>,
    /// Reason given when the test skipped
    pub skip_reason: Option<String>,
    /// Execution group, `None` for in-process tests
    pub group: Option<String>,
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, Default)]
pub struct RunOutcomes {
    /// One outcome per planned item, in collection order
    pub outcomes: Vec<TestOutcome>,
    /// One entry per supervised group, in completion order
    pub groups: Vec<GroupOutcome>,
    /// Results dropped because the item was already resolved
    pub discarded: usize,
}

impl RunOutcomes {
    /// Number of outcomes with the given status
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Whether any outcome fails the run
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.status.is_failure())
    }
}

struct Table {
    slots: Vec<Option<TestOutcome>>,
    groups: Vec<GroupOutcome>,
    discarded: usize,
    failed: usize,
}

/// Thread-safe outcome table
pub struct Aggregator {
    items: Vec<TestItem>,
    index: FxHashMap<String, usize>,
    capture_passed_output: bool,
    table: Mutex<Table>,
}

impl Aggregator {
    /// Table for the given planned items
    pub fn new(items: &[TestItem], capture_passed_output: bool) -> Self {
        let mut items = items.to_vec();
        items.sort_by_key(|item| item.index);
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.clone(), i))
            .collect();
        let slots = vec![None; items.len()];
        Self {
            items,
            index,
            capture_passed_output,
            table: Mutex::new(Table {
                slots,
                groups: Vec::new(),
                discarded: 0,
                failed: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a result; returns the stored outcome, or `None` if the item is
    /// unknown or was already resolved
    pub fn record(&self, group: Option<&str>, result: TestResult) -> Option<TestOutcome> {
        let Some(&slot) = self.index.get(&result.item_id) else {
            tracing::warn!(item = %result.item_id, "result for an item that was never planned");
            self.lock().discarded += 1;
            return None;
        };

        let mut table = self.lock();
        if table.slots[slot].is_some() {
            tracing::debug!(item = %result.item_id, "discarding late result");
            table.discarded += 1;
            return None;
        }

        let outcome = self.outcome(&self.items[slot], group, result);
        if outcome.status.is_failure() {
            table.failed += 1;
        }
        table.slots[slot] = Some(outcome.clone());
        Some(outcome)
    }

    /// Record a finished group
    pub fn record_group(&self, outcome: GroupOutcome) {
        self.lock().groups.push(outcome);
    }

    /// Number of failing outcomes so far
    pub fn failed(&self) -> usize {
        self.lock().failed
    }

    /// Number of resolved items so far
    pub fn resolved(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    /// Close the table. Items that never received a result are reported as
    /// cancelled.
    pub fn finish(self) -> RunOutcomes {
        let table = self.table.into_inner().unwrap_or_else(PoisonError::into_inner);
        let outcomes = table
            .slots
            .into_iter()
            .zip(&self.items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| TestOutcome {
                    id: item.id.clone(),
                    status: if item.xfail {
                        OutcomeStatus::XFailed
                    } else {
                        OutcomeStatus::Failed
                    },
                    duration: Duration::ZERO,
                    stdout: String::new(),
                    stderr: String::new(),
                    failure_message: Some("test was never run".to_string()),
                    traceback: None,
                    error_kind: Some(ErrorKind::Cancelled),
                    skip_reason: None,
                    group: None,
                })
            })
            .collect();

        RunOutcomes {
            outcomes,
            groups: table.groups,
            discarded: table.discarded,
        }
    }

    fn outcome(&self, item: &TestItem, group: Option<&str>, result: TestResult) -> TestOutcome {
        let status = derive_status(&result, item.xfail);
        let keep_output = self.capture_passed_output
            || !matches!(status, OutcomeStatus::Passed | OutcomeStatus::Skipped);
        let (failure_message, traceback, error_kind) = match result.failure {
            Some(f) => (Some(f.message), f.traceback, Some(f.kind)),
            None if status == OutcomeStatus::XPassed => {
                (Some("test passed but was expected to fail".to_string()), None, None)
            }
            None => (None, None, None),
        };

        TestOutcome {
            id: result.item_id,
            status,
            duration: Duration::from_nanos(result.duration_nanos),
            stdout: if keep_output { result.stdout } else { String::new() },
            stderr: if keep_output { result.stderr } else { String::new() },
            failure_message,
            traceback,
            error_kind,
            skip_reason: result.skip_reason,
            group: group.map(str::to_string),
        }
    }
}

impl EventSink for Aggregator {
    fn deliver(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Result { group, result } => {
                self.record(Some(&group), result);
            }
            SupervisorEvent::Outcome(outcome) => self.record_group(outcome),
        }
    }
}

/// Map per-phase results to a final status
pub fn derive_status(result: &TestResult, xfail: bool) -> OutcomeStatus {
    let base = match &result.failure {
        Some(failure) => match failure.kind {
            ErrorKind::SetupFailure | ErrorKind::TeardownFailure => OutcomeStatus::Errored,
            _ => OutcomeStatus::Failed,
        },
        None if result.setup.is_failure() || result.teardown.is_failure() => OutcomeStatus::Errored,
        None if result.call.is_failure() => OutcomeStatus::Failed,
        None if result.skipped() => OutcomeStatus::Skipped,
        None if result.call == PhaseStatus::NotRun => OutcomeStatus::Skipped,
        None => OutcomeStatus::Passed,
    };

    if !xfail {
        return base;
    }
    match base {
        OutcomeStatus::Failed | OutcomeStatus::Errored => OutcomeStatus::XFailed,
        OutcomeStatus::Passed => OutcomeStatus::XPassed,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ExitSignal;

    fn items() -> Vec<TestItem> {
        vec![
            TestItem::new("m::a", "m", 0),
            TestItem::new("m::b", "m", 1),
            TestItem::new("m::c", "m", 2).xfail(),
        ]
    }

    fn passed(id: &str) -> TestResult {
        TestResult {
            item_id: id.to_string(),
            setup: PhaseStatus::Passed,
            call: PhaseStatus::Passed,
            teardown: PhaseStatus::Passed,
            duration_nanos: 10,
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            failure: None,
            skip_reason: None,
        }
    }

    fn failed(id: &str, kind: ErrorKind) -> TestResult {
        TestResult::synthetic(id, kind, "it broke")
    }

    #[test]
    fn test_first_result_wins() {
        let agg = Aggregator::new(&items(), false);
        assert!(agg.record(Some("g"), failed("m::a", ErrorKind::Timeout)).is_some());
        assert!(agg.record(Some("g"), passed("m::a")).is_none());
        assert!(agg.record(Some("g"), passed("m::a")).is_none());

        let run = agg.finish();
        assert_eq!(run.outcomes[0].status, OutcomeStatus::Failed);
        assert_eq!(run.outcomes[0].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(run.discarded, 2);
    }

    #[test]
    fn test_finish_orders_by_collection_and_fills_gaps() {
        let agg = Aggregator::new(&items(), false);
        agg.record(None, passed("m::b"));

        let run = agg.finish();
        let ids: Vec<_> = run.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["m::a", "m::b", "m::c"]);
        assert_eq!(run.outcomes[0].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(run.outcomes[1].status, OutcomeStatus::Passed);
        assert_eq!(run.outcomes[1].group, None);
    }

    #[test]
    fn test_passed_output_hidden_unless_requested() {
        let agg = Aggregator::new(&items(), false);
        let hidden = agg.record(None, passed("m::a")).unwrap();
        assert!(hidden.stdout.is_empty());

        let agg = Aggregator::new(&items(), true);
        let shown = agg.record(None, passed("m::a")).unwrap();
        assert_eq!(shown.stdout, "hello\n");
    }

    #[test]
    fn test_failed_output_always_kept() {
        let agg = Aggregator::new(&items(), false);
        let mut result = failed("m::a", ErrorKind::CallFailure);
        result.stderr = "panicked".to_string();
        let outcome = agg.record(Some("g"), result).unwrap();
        assert_eq!(outcome.stderr, "panicked");
        assert_eq!(agg.failed(), 1);
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(derive_status(&passed("x"), false), OutcomeStatus::Passed);
        assert_eq!(
            derive_status(&failed("x", ErrorKind::CallFailure), false),
            OutcomeStatus::Failed
        );
        assert_eq!(
            derive_status(&failed("x", ErrorKind::Crash), false),
            OutcomeStatus::Failed
        );

        let mut setup = failed("x", ErrorKind::SetupFailure);
        setup.setup = PhaseStatus::Errored;
        assert_eq!(derive_status(&setup, false), OutcomeStatus::Errored);

        let skipped = TestResult {
            call: PhaseStatus::Skipped,
            ..passed("x")
        };
        assert_eq!(derive_status(&skipped, false), OutcomeStatus::Skipped);
    }

    #[test]
    fn test_xfail_mapping() {
        let agg = Aggregator::new(&items(), false);
        let crash = agg.record(Some("g"), failed("m::c", ErrorKind::Crash)).unwrap();
        assert_eq!(crash.status, OutcomeStatus::XFailed);
        assert_eq!(agg.failed(), 0);

        assert_eq!(derive_status(&passed("m::c"), true), OutcomeStatus::XPassed);
        assert!(OutcomeStatus::XPassed.is_failure());
    }

    #[test]
    fn test_sink_records_groups() {
        let agg = Aggregator::new(&items(), false);
        agg.deliver(SupervisorEvent::Result {
            group: "g".to_string(),
            result: passed("m::a"),
        });
        agg.deliver(SupervisorEvent::Outcome(GroupOutcome {
            key: "g".to_string(),
            signal: ExitSignal::Normal,
            exit_code: Some(0),
            signal_number: None,
            pid: Some(1),
            duration: Duration::from_millis(5),
        }));
        assert_eq!(agg.resolved(), 1);

        let run = agg.finish();
        assert_eq!(run.groups.len(), 1);
        assert_eq!(run.outcomes[0].group.as_deref(), Some("g"));
    }

    #[test]
    fn test_concurrent_delivery() {
        let many: Vec<TestItem> = (0..64)
            .map(|i| TestItem::new(format!("m::t{i}"), "m", i))
            .collect();
        let agg = Aggregator::new(&many, false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..64 {
                        agg.record(Some("g"), passed(&format!("m::t{i}")));
                    }
                });
            }
        });
        let run = agg.finish();
        assert_eq!(run.count(OutcomeStatus::Passed), 64);
        assert_eq!(run.discarded, 64 * 3);
    }
}
