//! Run orchestration
//!
//! Plans the selected items, runs the isolated groups through the supervisor
//! pool and the remaining items in-process, and closes the outcome table.

use crate::aggregator::{Aggregator, RunOutcomes, TestOutcome};
use crate::config::RunConfig;
use crate::planner::{Plan, PlanOptions, plan};
use crate::supervisor::{
    CancelToken, EventSink, GroupOutcome, Supervisor, SupervisorConfig, SupervisorError,
    SupervisorEvent, WorkerCommand,
};
use isocell_core::{GroupContext, TestExecutor, TestItem, capture_paths, run_item};
use isocell_ipc::{ErrorKind, TestResult};

/// Group key used for the shared context of in-process tests
pub const IN_PROCESS_GROUP: &str = "<in-process>";

/// Progress callbacks; every method has an empty default
pub trait RunObserver: Sync {
    /// The plan is known, nothing has run yet
    fn plan_ready(&self, _plan: &Plan) {}
    /// One test has its final outcome
    fn test_finished(&self, _outcome: &TestOutcome) {}
    /// One worker finished
    fn group_finished(&self, _outcome: &GroupOutcome) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

struct RunSink<'a> {
    aggregator: &'a Aggregator,
    observer: &'a dyn RunObserver,
}

impl RunSink<'_> {
    fn record(&self, group: Option<&str>, result: TestResult) {
        if let Some(outcome) = self.aggregator.record(group, result) {
            self.observer.test_finished(&outcome);
        }
    }
}

impl EventSink for RunSink<'_> {
    fn deliver(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Result { group, result } => self.record(Some(&group), result),
            SupervisorEvent::Outcome(outcome) => {
                self.observer.group_finished(&outcome);
                self.aggregator.record_group(outcome);
            }
        }
    }
}

/// Executes a set of test items under a run configuration
pub struct Runner {
    config: RunConfig,
    command: WorkerCommand,
}

impl Runner {
    /// Runner starting workers with `command`
    pub fn new(config: RunConfig, command: WorkerCommand) -> Self {
        Self { config, command }
    }

    /// Settings in use
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Plan without running anything
    pub fn plan(&self, items: &[TestItem]) -> Plan {
        plan(items.iter().cloned(), &PlanOptions::from(&self.config))
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            command: self.command.clone(),
            grace_period: self.config.grace_period,
            heartbeat_interval: self.config.heartbeat_interval,
            hang_timeout: self.config.hang_timeout,
            working_dir: self.config.working_dir.clone(),
            env: self.config.env.clone(),
            jobs: self.config.jobs,
        }
    }

    /// Run every item and return one outcome per item in collection order
    pub fn run(
        &self,
        items: &[TestItem],
        executor: &mut dyn TestExecutor,
        cancel: &CancelToken,
        observer: &dyn RunObserver,
    ) -> Result<RunOutcomes, SupervisorError> {
        let plan = self.plan(items);
        observer.plan_ready(&plan);

        tracing::info!(
            groups = plan.groups.len(),
            in_process = plan.in_process.len(),
            jobs = self.config.jobs,
            "starting run"
        );

        let aggregator = Aggregator::new(items, self.config.capture_passed_output);
        let sink = RunSink {
            aggregator: &aggregator,
            observer,
        };
        let max_fail = self.config.max_fail;
        let admit = || match max_fail {
            Some(limit) if aggregator.failed() >= limit => {
                Err("not run: max-fail reached".to_string())
            }
            _ => Ok(()),
        };

        if !plan.groups.is_empty() {
            let supervisor = Supervisor::new(self.supervisor_config());
            supervisor.run_all(&plan.groups, &sink, cancel, &admit)?;
        }

        self.run_in_process(&plan.in_process, executor, &sink, cancel, &admit);

        let outcomes = aggregator.finish();
        if outcomes.discarded > 0 {
            tracing::debug!(discarded = outcomes.discarded, "late results discarded");
        }
        Ok(outcomes)
    }

    /// Run items through the executor in this process, one capture per item
    fn run_in_process(
        &self,
        items: &[TestItem],
        executor: &mut dyn TestExecutor,
        sink: &RunSink<'_>,
        cancel: &CancelToken,
        admit: &dyn Fn() -> Result<(), String>,
    ) {
        if items.is_empty() {
            return;
        }

        let capture = match tempfile::Builder::new().prefix("isocell-").tempdir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                tracing::warn!(error = %e, "running in-process tests without output capture");
                None
            }
        };
        let mut ctx = GroupContext::new(IN_PROCESS_GROUP);

        for (position, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                sink.record(
                    None,
                    TestResult::synthetic(&item.id, ErrorKind::Cancelled, "not run: run cancelled"),
                );
                continue;
            }
            if let Err(reason) = admit() {
                sink.record(
                    None,
                    TestResult::synthetic(&item.id, ErrorKind::Cancelled, reason),
                );
                continue;
            }

            let paths = capture
                .as_ref()
                .map(|dir| capture_paths(dir.path(), position as u32));
            let result = run_item(executor, &mut ctx, &item.id, paths.as_ref());
            sink.record(None, result);
        }
    }
}
