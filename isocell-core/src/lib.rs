#![warn(missing_docs)]
//! isocell Core - Test Registry and Worker Runtime
//!
//! This crate provides the execution environment for isolated tests:
//! - `TestDef` registration through `inventory` (emitted by the attribute macros)
//! - `TestItem`, the immutable collected form the planner works with
//! - `TestExecutor`, the single "run one test" capability the worker depends on
//! - fd-level stdout/stderr capture reset at every test boundary
//! - `GroupContext`, per-worker state shared by the tests of one group
//! - `WorkerMain`, the worker side of the supervisor-worker protocol

mod capture;
mod context;
mod executor;
mod item;
mod worker;

pub use capture::{CaptureGuard, CapturePaths, CapturedOutput, MAX_CAPTURE_BYTES, capture_paths};
pub use context::GroupContext;
pub use executor::{PhaseOutcomes, RegistryExecutor, SkipSignal, TestExecutor, run_item, skip};
pub use item::TestItem;
pub use worker::{WorkerError, WorkerMain, shutdown_requested};

/// Environment variable set to `1` inside every isolated worker process
pub const WORKER_ENV: &str = "ISOCELL_WORKER";

/// Hidden CLI flag that turns a test binary into a worker
pub const WORKER_FLAG: &str = "--isocell-worker";

/// Whether the current process is an isolated worker
pub fn in_worker() -> bool {
    std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
}

/// Where an isolation marker was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerScope {
    /// Directly on the test function
    Function,
    /// On an enclosing `#[suite]` module
    Suite,
}

/// Isolation metadata attached to a test by the macros
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Run in a worker process
    pub isolated: bool,
    /// Explicit group name
    pub group: Option<&'static str>,
    /// Per-group timeout override in seconds
    pub timeout_secs: Option<u64>,
    /// Where the marker came from
    pub scope: MarkerScope,
}

impl Marker {
    /// Marker of a plain, non-isolated test
    pub const NONE: Marker = Marker {
        isolated: false,
        group: None,
        timeout_secs: None,
        scope: MarkerScope::Function,
    };
}

/// Test body signature
#[derive(Debug, Clone, Copy)]
pub enum TestBody {
    /// `fn()`
    Plain(fn()),
    /// `fn(&mut GroupContext)`
    WithContext(fn(&mut GroupContext)),
}

/// Test definition registered via `#[isocell::test]`, `#[isocell::isolated]`
/// or `#[isocell::suite]`
#[derive(Debug, Clone)]
pub struct TestDef {
    /// Function name
    pub name: &'static str,
    /// Module path of the function
    pub module_path: &'static str,
    /// Source file path
    pub file: &'static str,
    /// Source line number
    pub line: u32,
    /// Isolation marker
    pub marker: Marker,
    /// Failure is expected
    pub xfail: bool,
    /// The test body
    pub body: TestBody,
    /// Runs before the body
    pub setup: Option<fn()>,
    /// Runs after the body, even when it failed
    pub teardown: Option<fn()>,
}

impl TestDef {
    /// Stable identifier: `module::path::name`
    pub fn id(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }
}

inventory::collect!(TestDef);

/// All registered tests in collection order (source file, then line, then name)
pub fn registered_tests() -> Vec<&'static TestDef> {
    let mut defs: Vec<&'static TestDef> = inventory::iter::<TestDef>.into_iter().collect();
    defs.sort_by(|a, b| {
        (a.file, a.line, a.module_path, a.name).cmp(&(b.file, b.line, b.module_path, b.name))
    });
    defs
}

/// Collect every registered test as a `TestItem`
pub fn collect_items() -> Vec<TestItem> {
    registered_tests()
        .into_iter()
        .enumerate()
        .map(|(index, def)| TestItem::from_def(def, index))
        .collect()
}
