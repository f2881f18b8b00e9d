#![warn(missing_docs)]
//! # isocell
//!
//! Process isolation for Rust tests: crashes, hangs and global-state
//! mutation in one group of tests cannot affect any other group or the
//! runner itself.
//!
//! - **Groups**: tests marked `#[isolated]` run in worker processes; tests
//!   naming the same group share one worker, in source order
//! - **Supervision**: per-group deadlines, heartbeats, SIGTERM then SIGKILL
//! - **Crash attribution**: a dead worker's unreported tests get synthetic
//!   results naming the test that was executing, with its partial output
//! - **Framed IPC**: length-prefixed rkyv frames over dedicated pipes, so
//!   test output never corrupts the protocol
//!
//! ## Quick Start
//!
//! ```ignore
//! use isocell::prelude::*;
//!
//! #[isolated]
//! fn sets_process_locale() {
//!     unsafe { std::env::set_var("LANG", "C") };
//! }
//!
//! #[isolated("db")]
//! fn opens_pool(ctx: &mut GroupContext) {
//!     *ctx.state::<u32>() += 1;
//! }
//!
//! fn main() {
//!     isocell::run().unwrap();
//! }
//! ```
//!
//! Add the binary as a test target with `harness = false`.

// Re-export core types
pub use isocell_core::{
    GroupContext, Marker, MarkerScope, RegistryExecutor, TestBody, TestDef, TestExecutor, TestItem,
    collect_items, in_worker, skip,
};

// Re-export wire types surfaced in outcomes
pub use isocell_ipc::ErrorKind;

// Re-export macros
pub use isocell_macros::{isolated, suite, test};

// Re-export the runner
pub use isocell_cli::{
    CancelToken, Cli, DefaultGrouping, IsocellConfig, NoopObserver, OutcomeStatus, RunConfig,
    RunObserver, RunOutcomes, Runner, TestOutcome, WorkerCommand, is_worker_invocation,
    run_with_cli, run_worker, select,
};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{GroupContext, isolated, skip, suite};
}

/// Run the isocell CLI harness.
///
/// Call this from your test binary's `main()`:
/// ```ignore
/// fn main() {
///     isocell::run().unwrap();
/// }
/// ```
pub use isocell_cli::run;
