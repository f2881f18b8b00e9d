//! Test Execution
//!
//! `TestExecutor` is the only thing the worker needs from the test framework:
//! run one item by id and report what each phase did. `RegistryExecutor`
//! implements it over the `inventory` registry with panic catching per phase.

use crate::capture::{CaptureGuard, CapturePaths, CapturedOutput, MAX_CAPTURE_BYTES};
use crate::context::GroupContext;
use crate::{TestBody, TestDef, registered_tests};
use fxhash::FxHashMap;
use isocell_ipc::{ErrorKind, FailureDetail, Phase, PhaseStatus, TestResult};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Once;
use std::time::Instant;

/// What each phase of one test did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcomes {
    /// Setup status
    pub setup: PhaseStatus,
    /// Body status
    pub call: PhaseStatus,
    /// Teardown status
    pub teardown: PhaseStatus,
    /// First failure, if any phase failed
    pub failure: Option<FailureDetail>,
    /// Reason given to `skip`
    pub skip_reason: Option<String>,
}

impl PhaseOutcomes {
    /// Every phase passed
    pub fn passed() -> Self {
        Self {
            setup: PhaseStatus::Passed,
            call: PhaseStatus::Passed,
            teardown: PhaseStatus::Passed,
            failure: None,
            skip_reason: None,
        }
    }

    /// Combine with timing and captured output into a wire result
    pub fn into_result(
        self,
        item_id: &str,
        duration_nanos: u64,
        captured: CapturedOutput,
    ) -> TestResult {
        TestResult {
            item_id: item_id.to_string(),
            setup: self.setup,
            call: self.call,
            teardown: self.teardown,
            duration_nanos,
            stdout: captured.stdout,
            stderr: captured.stderr,
            failure: self.failure,
            skip_reason: self.skip_reason,
        }
    }
}

/// Runs single test items
pub trait TestExecutor {
    /// Execute the item with the given id, or `None` if it is unknown
    fn execute(&mut self, item_id: &str, ctx: &mut GroupContext) -> Option<PhaseOutcomes>;
}

/// Panic payload used by `skip`
#[derive(Debug, Clone)]
pub struct SkipSignal {
    /// Why the test skipped
    pub reason: String,
}

/// Skip the current test
///
/// Called from setup the whole test is skipped; called from the body the
/// teardown still runs.
pub fn skip(reason: impl Into<String>) -> ! {
    std::panic::panic_any(SkipSignal {
        reason: reason.into(),
    })
}

/// Executor over the tests registered with the attribute macros
pub struct RegistryExecutor {
    defs: FxHashMap<String, &'static TestDef>,
}

impl RegistryExecutor {
    /// Index every registered test
    pub fn new() -> Self {
        Self::from_defs(registered_tests())
    }

    /// Index the given definitions
    pub fn from_defs(defs: impl IntoIterator<Item = &'static TestDef>) -> Self {
        Self {
            defs: defs.into_iter().map(|d| (d.id(), d)).collect(),
        }
    }

    /// Number of known tests
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether no tests are known
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl Default for RegistryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TestExecutor for RegistryExecutor {
    fn execute(&mut self, item_id: &str, ctx: &mut GroupContext) -> Option<PhaseOutcomes> {
        let def = self.defs.get(item_id)?;
        ctx.set_current_item(item_id);
        Some(run_def(def, ctx))
    }
}

/// Run one item end to end: capture, execute, time, build the result.
///
/// Each captured stream is cut to its last `MAX_CAPTURE_BYTES`. An id the
/// executor does not know yields a `ProtocolError` result so the item still
/// gets exactly one report.
pub fn run_item<E>(
    executor: &mut E,
    ctx: &mut GroupContext,
    item_id: &str,
    capture: Option<&CapturePaths>,
) -> TestResult
where
    E: TestExecutor + ?Sized,
{
    let start = Instant::now();

    let guard = capture.and_then(|paths| match CaptureGuard::begin(paths) {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(item = item_id, error = %e, "output capture unavailable");
            None
        }
    });

    let outcome = executor.execute(item_id, ctx);
    let captured = guard
        .map(CaptureGuard::finish)
        .unwrap_or_default()
        .truncated(MAX_CAPTURE_BYTES);
    let duration_nanos = start.elapsed().as_nanos() as u64;

    match outcome {
        Some(outcome) => outcome.into_result(item_id, duration_nanos, captured),
        None => {
            let mut result = TestResult::synthetic(
                item_id,
                ErrorKind::ProtocolError,
                format!("unknown test item '{item_id}'"),
            );
            result.stdout = captured.stdout;
            result.stderr = captured.stderr;
            result
        }
    }
}

enum PhaseError {
    Skipped(String),
    Panicked(FailureDetail),
}

fn run_def(def: &TestDef, ctx: &mut GroupContext) -> PhaseOutcomes {
    let mut outcomes = PhaseOutcomes::passed();

    if let Some(setup) = def.setup {
        match run_phase(Phase::Setup, setup) {
            Ok(()) => {}
            Err(err) => {
                outcomes.setup = record(&mut outcomes, err, PhaseStatus::Errored);
                outcomes.call = PhaseStatus::NotRun;
                outcomes.teardown = PhaseStatus::NotRun;
                return outcomes;
            }
        }
    }

    let call = match def.body {
        TestBody::Plain(body) => run_phase(Phase::Call, body),
        TestBody::WithContext(body) => run_phase(Phase::Call, || body(ctx)),
    };
    if let Err(err) = call {
        outcomes.call = record(&mut outcomes, err, PhaseStatus::Failed);
    }

    if let Some(teardown) = def.teardown {
        if let Err(err) = run_phase(Phase::Teardown, teardown) {
            outcomes.teardown = record(&mut outcomes, err, PhaseStatus::Errored);
        }
    }

    outcomes
}

/// Store a phase error and return the phase status it maps to.
/// The first failure wins the detail slot.
fn record(outcomes: &mut PhaseOutcomes, err: PhaseError, failed: PhaseStatus) -> PhaseStatus {
    match err {
        PhaseError::Skipped(reason) => {
            outcomes.skip_reason.get_or_insert(reason);
            PhaseStatus::Skipped
        }
        PhaseError::Panicked(detail) => {
            outcomes.failure.get_or_insert(detail);
            failed
        }
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install a hook that keeps skip signals quiet and remembers where the
/// last real panic happened. Everything else goes to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<SkipSignal>() {
                return;
            }

            let mut traceback = match info.location() {
                Some(loc) => format!("at {}:{}:{}", loc.file(), loc.line(), loc.column()),
                None => String::from("at <unknown location>"),
            };
            let backtrace = std::backtrace::Backtrace::capture();
            if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                traceback.push('\n');
                traceback.push_str(&backtrace.to_string());
            }
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(traceback));

            previous(info);
        }));
    });
}

fn run_phase<F: FnOnce()>(phase: Phase, f: F) -> Result<(), PhaseError> {
    install_panic_hook();
    LAST_PANIC.with(|slot| slot.borrow_mut().take());

    let payload = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => return Ok(()),
        Err(payload) => payload,
    };

    if let Some(skip) = payload.downcast_ref::<SkipSignal>() {
        return Err(PhaseError::Skipped(skip.reason.clone()));
    }

    Err(PhaseError::Panicked(FailureDetail {
        kind: ErrorKind::for_phase(phase),
        message: panic_message(payload.as_ref()),
        traceback: LAST_PANIC.with(|slot| slot.borrow_mut().take()),
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
