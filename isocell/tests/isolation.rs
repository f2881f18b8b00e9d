//! End-to-end tests for isocell
//!
//! The fixtures below are registered with the isocell macros. Each trial
//! selects a slice of them and runs it through the real supervisor, which
//! re-executes this binary as the worker.

use isocell::{
    CancelToken, ErrorKind, GroupContext, NoopObserver, OutcomeStatus, RegistryExecutor, RunConfig,
    RunOutcomes, Runner, TestItem, TestOutcome, WorkerCommand, collect_items, select,
};
use libtest_mimic::{Arguments, Failed, Trial};
use std::time::{Duration, Instant};

mod fixtures {
    use super::GroupContext;
    use std::sync::atomic::{AtomicBool, Ordering};

    static LEAKED: AtomicBool = AtomicBool::new(false);

    fn report_pid() {
        println!("pid={}", std::process::id());
    }

    #[isocell::isolated("colo")]
    fn colo_first() {
        report_pid();
    }

    #[isocell::isolated("colo")]
    fn colo_second() {
        report_pid();
    }

    #[isocell::isolated]
    fn colo_alone() {
        report_pid();
    }

    #[isocell::isolated("counter")]
    fn counter_first(ctx: &mut GroupContext) {
        assert!(isocell::in_worker());
        *ctx.state::<u32>() += 1;
        assert_eq!(*ctx.state::<u32>(), 1);
    }

    #[isocell::isolated("counter")]
    fn counter_second(ctx: &mut GroupContext) {
        *ctx.state::<u32>() += 1;
        assert_eq!(*ctx.state::<u32>(), 2, "state did not survive between tests");
    }

    #[isocell::isolated("leak_a")]
    fn leak_sets_global() {
        LEAKED.store(true, Ordering::SeqCst);
    }

    #[isocell::isolated("leak_b")]
    fn leak_sees_clean_global() {
        assert!(!LEAKED.load(Ordering::SeqCst), "global state leaked across groups");
    }

    #[isocell::isolated("crash")]
    fn crash_runs_first() {}

    #[isocell::isolated("crash")]
    fn crash_aborts() {
        println!("partial output before abort");
        std::process::abort();
    }

    #[isocell::isolated("crash")]
    fn crash_never_runs() {}

    #[isocell::isolated("survivor")]
    fn survivor_passes() {}

    #[isocell::isolated(group = "hang", timeout = 1)]
    fn hang_sleeps() {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }

    #[isocell::isolated(xfail)]
    fn outcome_expected_failure() {
        panic!("known bug");
    }

    #[isocell::isolated]
    fn outcome_skips() {
        isocell::skip("not on this platform");
    }

    fn broken_setup() {
        panic!("no database");
    }

    #[isocell::isolated(setup = broken_setup)]
    fn outcome_setup_fails() {}

    #[isocell::isolated]
    fn outcome_fails() {
        eprintln!("about to fail");
        assert_eq!(1 + 1, 3);
    }

    #[isocell::suite(group = "suite", timeout = 30)]
    mod suite_members {
        #[test]
        fn first() {
            super::report_pid();
        }

        #[test]
        fn second() {
            super::report_pid();
        }
    }
}

fn select_fixtures(pattern: &str) -> Vec<TestItem> {
    let re = regex::Regex::new(pattern).expect("valid fixture pattern");
    select(collect_items(), Some(&re), &[])
}

fn config() -> RunConfig {
    RunConfig {
        capture_passed_output: true,
        grace_period: Duration::from_millis(200),
        ..RunConfig::default()
    }
}

fn run(pattern: &str, config: RunConfig) -> Result<RunOutcomes, Failed> {
    let items = select_fixtures(pattern);
    if items.is_empty() {
        return Err(format!("no fixtures match {pattern}").into());
    }
    let command = WorkerCommand::current_exe()?;
    let mut executor = RegistryExecutor::new();
    let outcomes = Runner::new(config, command).run(
        &items,
        &mut executor,
        &CancelToken::new(),
        &NoopObserver,
    )?;
    if outcomes.outcomes.len() != items.len() {
        return Err(format!(
            "{} outcomes for {} items",
            outcomes.outcomes.len(),
            items.len()
        )
        .into());
    }
    Ok(outcomes)
}

fn outcome<'a>(run: &'a RunOutcomes, name: &str) -> Result<&'a TestOutcome, Failed> {
    let suffix = format!("::{name}");
    run.outcomes
        .iter()
        .find(|o| o.id.ends_with(&suffix))
        .ok_or_else(|| format!("no outcome for {name}").into())
}

fn pid_of(outcome: &TestOutcome) -> Result<u32, Failed> {
    outcome
        .stdout
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
        .ok_or_else(|| format!("{} printed no pid: {:?}", outcome.id, outcome.stdout).into())
}

fn expect_status(outcome: &TestOutcome, status: OutcomeStatus) -> Result<(), Failed> {
    if outcome.status == status {
        Ok(())
    } else {
        Err(format!(
            "{}: expected {status:?}, got {:?} ({:?})",
            outcome.id, outcome.status, outcome.failure_message
        )
        .into())
    }
}

fn check(condition: bool, message: impl Into<String>) -> Result<(), Failed> {
    if condition {
        Ok(())
    } else {
        let message: String = message.into();
        Err(message.into())
    }
}

fn test_group_members_share_one_worker() -> Result<(), Failed> {
    let run = run("fixtures::colo_", config())?;
    let first = pid_of(outcome(&run, "colo_first")?)?;
    let second = pid_of(outcome(&run, "colo_second")?)?;
    let alone = pid_of(outcome(&run, "colo_alone")?)?;

    check(first == second, "grouped tests ran in different processes")?;
    check(first != alone, "ungrouped test shared the group's worker")?;
    check(first != std::process::id(), "isolated test ran in the runner")?;
    check(run.groups.len() == 2, format!("expected 2 workers, got {}", run.groups.len()))
}

fn test_group_state_persists_between_tests() -> Result<(), Failed> {
    let run = run("fixtures::counter_", config())?;
    expect_status(outcome(&run, "counter_first")?, OutcomeStatus::Passed)?;
    expect_status(outcome(&run, "counter_second")?, OutcomeStatus::Passed)
}

fn test_global_state_does_not_leak_across_groups() -> Result<(), Failed> {
    let run = run("fixtures::leak_", config())?;
    expect_status(outcome(&run, "leak_sets_global")?, OutcomeStatus::Passed)?;
    expect_status(outcome(&run, "leak_sees_clean_global")?, OutcomeStatus::Passed)
}

fn test_crash_is_attributed_to_the_running_test() -> Result<(), Failed> {
    let run = run("fixtures::(crash|survivor)_", RunConfig { jobs: 2, ..config() })?;

    expect_status(outcome(&run, "crash_runs_first")?, OutcomeStatus::Passed)?;
    expect_status(outcome(&run, "survivor_passes")?, OutcomeStatus::Passed)?;

    let aborted = outcome(&run, "crash_aborts")?;
    expect_status(aborted, OutcomeStatus::Failed)?;
    check(aborted.error_kind == Some(ErrorKind::Crash), "abort was not a crash")?;
    let message = aborted.failure_message.as_deref().unwrap_or_default();
    check(
        message.contains("during test execution"),
        format!("unexpected crash message: {message}"),
    )?;
    check(
        aborted.stdout.contains("partial output before abort"),
        "partial capture was not attached",
    )?;

    let skipped = outcome(&run, "crash_never_runs")?;
    expect_status(skipped, OutcomeStatus::Failed)?;
    check(
        skipped
            .failure_message
            .as_deref()
            .is_some_and(|m| m.contains("did not run")),
        "follow-up test not reported as never run",
    )
}

fn test_hanging_group_times_out() -> Result<(), Failed> {
    let start = Instant::now();
    let run = run("fixtures::hang_", config())?;
    let hung = outcome(&run, "hang_sleeps")?;

    check(hung.error_kind == Some(ErrorKind::Timeout), "hang was not reported as a timeout")?;
    check(
        hung.failure_message
            .as_deref()
            .is_some_and(|m| m.contains("timed out after 1s")),
        format!("unexpected timeout message: {:?}", hung.failure_message),
    )?;
    check(
        start.elapsed() < Duration::from_secs(20),
        "timeout was not enforced",
    )?;

    let pid = run.groups[0].pid.ok_or("hung group has no worker pid")?;
    check(
        !cfg!(target_os = "linux") || !std::path::Path::new(&format!("/proc/{pid}")).exists(),
        format!("worker {pid} is still alive"),
    )
}

fn test_disable_isolation_runs_in_process() -> Result<(), Failed> {
    let run = run(
        "fixtures::colo_",
        RunConfig {
            disable_isolation: true,
            ..config()
        },
    )?;

    check(run.groups.is_empty(), "a worker was spawned")?;
    for outcome in &run.outcomes {
        check(
            pid_of(outcome)? == std::process::id(),
            format!("{} did not run in-process", outcome.id),
        )?;
        check(outcome.group.is_none(), "in-process outcome carries a group")?;
    }
    Ok(())
}

fn test_outcome_statuses() -> Result<(), Failed> {
    let run = run("fixtures::outcome_", config())?;

    expect_status(outcome(&run, "outcome_expected_failure")?, OutcomeStatus::XFailed)?;

    let skipped = outcome(&run, "outcome_skips")?;
    expect_status(skipped, OutcomeStatus::Skipped)?;
    check(
        skipped.skip_reason.as_deref() == Some("not on this platform"),
        "skip reason lost",
    )?;

    let setup = outcome(&run, "outcome_setup_fails")?;
    expect_status(setup, OutcomeStatus::Errored)?;
    check(setup.error_kind == Some(ErrorKind::SetupFailure), "setup failure kind")?;

    let failed = outcome(&run, "outcome_fails")?;
    expect_status(failed, OutcomeStatus::Failed)?;
    check(failed.stderr.contains("about to fail"), "stderr of a failed test was not kept")?;
    check(failed.traceback.is_some(), "failure has no location")
}

fn test_suite_members_share_the_suite_group() -> Result<(), Failed> {
    let run = run("fixtures::suite_members::", config())?;
    let first = outcome(&run, "first")?;
    let second = outcome(&run, "second")?;

    check(first.group.as_deref() == Some("suite"), "suite group not applied")?;
    check(pid_of(first)? == pid_of(second)?, "suite members ran in different workers")
}

fn test_max_fail_stops_scheduling() -> Result<(), Failed> {
    let run = run(
        "fixtures::(outcome_fails|suite_members::)",
        RunConfig {
            max_fail: Some(1),
            ..config()
        },
    )?;

    let not_run: Vec<&TestOutcome> = run
        .outcomes
        .iter()
        .filter(|o| o.failure_message.as_deref() == Some("not run: max-fail reached"))
        .collect();
    expect_status(outcome(&run, "outcome_fails")?, OutcomeStatus::Failed)?;
    check(
        not_run.len() == 2,
        format!("expected both suite members cancelled, got {}", not_run.len()),
    )
}

fn main() {
    // Worker processes re-execute this binary
    if isocell::is_worker_invocation() {
        isocell::run_worker();
    }

    let mut args = Arguments::from_args();
    // In-process runs redirect this process's stdout and stderr
    args.test_threads = Some(1);

    let trials = vec![
        Trial::test("group_members_share_one_worker", test_group_members_share_one_worker),
        Trial::test("group_state_persists_between_tests", test_group_state_persists_between_tests),
        Trial::test(
            "global_state_does_not_leak_across_groups",
            test_global_state_does_not_leak_across_groups,
        ),
        Trial::test(
            "crash_is_attributed_to_the_running_test",
            test_crash_is_attributed_to_the_running_test,
        ),
        Trial::test("hanging_group_times_out", test_hanging_group_times_out),
        Trial::test("disable_isolation_runs_in_process", test_disable_isolation_runs_in_process),
        Trial::test("outcome_statuses", test_outcome_statuses),
        Trial::test(
            "suite_members_share_the_suite_group",
            test_suite_members_share_the_suite_group,
        ),
        Trial::test("max_fail_stops_scheduling", test_max_fail_stops_scheduling),
    ];

    libtest_mimic::run(&args, trials).exit();
}
