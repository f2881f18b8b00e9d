//! Supervisor Process
//!
//! Runs each execution group in its own worker process and turns whatever
//! the worker does (reports, exits, hangs, garbles its channel) into exactly
//! one result per item plus a `GroupOutcome`.

use crate::planner::ExecutionGroup;
use fxhash::FxHashMap;
use isocell_core::{CapturePaths, WORKER_ENV, WORKER_FLAG, capture_paths};
use isocell_ipc::{
    EnvVar, ErrorKind, Frame, FrameError, FrameKind, FrameReader, FrameWriter, GroupComplete,
    GroupRequest, IPC_FD_ENV, ItemRequest, Message, PROTOCOL_VERSION, ProtocolViolation,
    SupervisorMessage, TestResult, WorkerMessage,
};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::ffi::OsString;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// File in the capture directory receiving the worker's own stdout/stderr
pub const WORKER_LOG: &str = "worker.log";

/// Longest single wait on the worker channel
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Lines of `worker.log` quoted in crash reports
const LOG_TAIL_LINES: usize = 20;

/// `start + limit`, or `None` when the limit lies beyond what an `Instant`
/// can represent (no deadline)
fn deadline_after(start: Instant, limit: Duration) -> Option<Instant> {
    start.checked_add(limit)
}

fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}

/// Errors from starting workers or the supervisor pool
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker process could not be started
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// The per-group capture directory could not be created
    #[error("Cannot create capture directory: {0}")]
    CaptureDir(std::io::Error),

    /// Framing failed on the worker channel
    #[error("IPC error: {0}")]
    Ipc(#[from] FrameError),

    /// The rayon pool for parallel groups could not be built
    #[error("Failed to build worker pool: {0}")]
    Pool(String),
}

/// How a group's worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// Worker reported the group complete
    Normal,
    /// Deadline or hang limit exceeded
    TimedOut,
    /// Worker died or broke the protocol
    Crashed,
    /// Run-wide cancellation
    Cancelled,
    /// Worker could not be started
    SpawnFailed,
}

/// Summary of one group's execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    /// Group key
    pub key: String,
    /// How the worker ended
    pub signal: ExitSignal,
    /// Worker exit code, when it exited normally
    pub exit_code: Option<i32>,
    /// Signal that terminated the worker
    pub signal_number: Option<i32>,
    /// Worker pid, when one was started
    pub pid: Option<u32>,
    /// Wall time from spawn to reap
    pub duration: Duration,
}

/// Something a supervisor reports
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Terminal result for one item
    Result {
        /// Group the item belongs to
        group: String,
        /// The result
        result: TestResult,
    },
    /// A group finished
    Outcome(GroupOutcome),
}

/// Receiver of supervisor events, shared by all concurrent supervisors
pub trait EventSink: Sync {
    /// Accept one event
    fn deliver(&self, event: SupervisorEvent);
}

/// Run-wide cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl CancelToken {
    /// Token cancelled only through `cancel`
    pub fn new() -> Self {
        Self::default()
    }

    /// Token also cancelled by SIGINT/SIGTERM once the handlers are installed
    pub fn with_signals() -> Self {
        Self {
            flag: Arc::default(),
            follow_signals: true,
        }
    }

    /// Cancel the run
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire) || (self.follow_signals && crate::signal::interrupted())
    }
}

/// Lifecycle of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, handshake pending
    Starting,
    /// Executing the group
    Running,
    /// Reported the group complete
    Completed,
    /// Deadline or hang limit exceeded
    TimedOut,
    /// Died or broke the protocol
    Crashed,
}

/// Program and arguments that start a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Re-execute the current binary in worker mode
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(WORKER_FLAG))
    }

    /// Arbitrary program without arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Supervision settings shared by all groups
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How to start a worker
    pub command: WorkerCommand,
    /// SIGTERM to SIGKILL delay
    pub grace_period: Duration,
    /// Worker heartbeat interval (zero disables)
    pub heartbeat_interval: Duration,
    /// Silence limit before a worker counts as hung
    pub hang_timeout: Option<Duration>,
    /// Worker working directory
    pub working_dir: Option<PathBuf>,
    /// Extra worker environment
    pub env: Vec<(String, String)>,
    /// Groups run at the same time
    pub jobs: usize,
}

impl SupervisorConfig {
    /// Settings with defaults for everything but the command
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            grace_period: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(isocell_ipc::HEARTBEAT_INTERVAL_MS),
            hang_timeout: None,
            working_dir: None,
            env: Vec::new(),
            jobs: 1,
        }
    }
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: i32, timeout_ms: i32) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(std::io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else {
        // Check if data is available (even if pipe is closing, there might be data)
        if pollfd.revents & libc::POLLIN != 0 {
            PollResult::DataAvailable
        } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            PollResult::PipeClosed
        } else {
            PollResult::Timeout
        }
    }
}

/// Create a pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Close-on-exec on both ends; the child clears it for the fds it keeps.
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send a signal to every process in the worker's process group.
fn signal_group(pgid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Worker process handle
pub struct WorkerHandle {
    child: Child,
    reader: FrameReader<std::fs::File>,
    writer: FrameWriter<std::fs::File>,
    msg_read_fd: RawFd,
    pid: u32,
    state: WorkerState,
    status: Option<ExitStatus>,
}

impl WorkerHandle {
    /// Spawn a worker in its own process group, fd 3/4 for IPC and its
    /// stdout/stderr appended to `log`.
    pub fn spawn(command: &WorkerCommand, log: &Path) -> Result<Self, SupervisorError> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)?;
        let log_err = log_file.try_clone()?;

        // cmd_pipe: supervisor writes the request → worker reads from fd 3
        let (cmd_read, cmd_write) = create_pipe()?;
        // msg_pipe: worker writes messages from fd 4 → supervisor reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env(WORKER_ENV, "1")
            .env(IPC_FD_ENV, "3,4")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        // In the child: dup cmd_read→3, msg_write→4, close originals.
        unsafe {
            cmd.pre_exec(move || {
                if cmd_read != 3 {
                    libc::dup2(cmd_read, 3);
                    libc::close(cmd_read);
                }
                let flags = libc::fcntl(3, libc::F_GETFD);
                libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                if msg_write != 4 {
                    libc::dup2(msg_write, 4);
                    libc::close(msg_write);
                }
                let flags = libc::fcntl(4, libc::F_GETFD);
                libc::fcntl(4, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                // Close the parent-side ends that leaked into the child
                libc::close(cmd_write);
                libc::close(msg_read);

                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        // Close the child-side ends in the parent
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };
        let pid = child.id();

        tracing::debug!(pid, program = %command.program.display(), "spawned worker");

        Ok(Self {
            child,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
            msg_read_fd: msg_read,
            pid,
            state: WorkerState::Starting,
            status: None,
        })
    }

    /// Worker process id (also its process group id)
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Exit status, once the worker has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Check if worker process is still running
    pub fn is_alive(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn poll(&mut self, timeout: Duration) -> PollResult {
        if self.reader.has_buffered_data() {
            return PollResult::DataAvailable;
        }
        let ms = timeout.as_millis().clamp(1, POLL_SLICE.as_millis()) as i32;
        wait_for_data(self.msg_read_fd, ms)
    }

    fn read_frame(&mut self) -> Result<Frame, FrameError> {
        self.reader.read_frame()
    }

    /// Send a message to the worker
    pub fn send(&mut self, message: &SupervisorMessage) -> Result<(), FrameError> {
        self.writer.send(message)
    }

    /// Ask every process of the worker's group to stop
    pub fn terminate(&mut self) {
        if self.is_alive() {
            let _ = signal_group(self.pid, libc::SIGTERM);
        }
    }

    /// Kill the whole process group and reap the worker
    pub fn kill(&mut self) {
        if self.status.is_some() {
            return;
        }
        let _ = signal_group(self.pid, libc::SIGKILL);
        let _ = self.child.kill();
        if let Ok(status) = self.child.wait() {
            self.status = Some(status);
        }
    }

    /// Wait up to `grace` for the worker to exit on its own, then kill it
    pub fn reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        let limit = deadline_after(Instant::now(), grace);
        while self.is_alive() {
            if expired(limit, Instant::now()) {
                tracing::debug!(pid = self.pid, "worker did not exit in time, killing");
                self.kill();
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.status
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            // Graceful: SIGTERM first, brief wait, then SIGKILL
            let _ = signal_group(self.pid, libc::SIGTERM);
            std::thread::sleep(Duration::from_millis(50));
            self.kill();
        }
    }
}

/// Why the event loop stopped
enum Stop {
    Completed(GroupComplete),
    Deadline,
    Hung(Duration),
    Cancelled,
    Closed,
    Desync(FrameError),
    Handshake(String),
}

/// Per-group bookkeeping: which items have been reported
struct GroupRun<'a> {
    group: &'a ExecutionGroup,
    sink: &'a dyn EventSink,
    positions: FxHashMap<&'a str, usize>,
    reported: Vec<bool>,
    violation: Option<String>,
}

impl<'a> GroupRun<'a> {
    fn new(group: &'a ExecutionGroup, sink: &'a dyn EventSink) -> Self {
        Self {
            group,
            sink,
            positions: group
                .items
                .iter()
                .enumerate()
                .map(|(i, item)| (item.id.as_str(), i))
                .collect(),
            reported: vec![false; group.items.len()],
            violation: None,
        }
    }

    fn any_reported(&self) -> bool {
        self.reported.iter().any(|&r| r)
    }

    fn next_unreported(&self) -> Option<usize> {
        self.reported.iter().position(|&r| !r)
    }

    fn deliver(&mut self, position: usize, result: TestResult) {
        self.reported[position] = true;
        self.sink.deliver(SupervisorEvent::Result {
            group: self.group.key.clone(),
            result,
        });
    }

    fn record(&mut self, result: TestResult) {
        match self.positions.get(result.item_id.as_str()).copied() {
            None => {
                tracing::warn!(
                    group = %self.group.key,
                    item = %result.item_id,
                    "dropping result for unknown item"
                );
            }
            Some(position) if self.reported[position] => {
                tracing::warn!(
                    group = %self.group.key,
                    item = %result.item_id,
                    "dropping duplicate result"
                );
            }
            Some(position) => {
                if self.reported[..position].iter().any(|&r| !r) {
                    tracing::warn!(
                        group = %self.group.key,
                        item = %result.item_id,
                        "result arrived ahead of earlier items"
                    );
                }
                self.deliver(position, result);
            }
        }
    }

    /// An in-sync but undecodable result belongs to the next item in order
    fn undecodable_result(&mut self, message: &str) {
        match self.next_unreported() {
            Some(position) => {
                let id = self.group.items[position].id.clone();
                let result = TestResult::synthetic(
                    &id,
                    ErrorKind::ProtocolError,
                    format!("worker sent an undecodable result: {message}"),
                );
                self.deliver(position, result);
            }
            None => {
                tracing::warn!(
                    group = %self.group.key,
                    "undecodable result after every item reported"
                );
            }
        }
    }

    fn protocol_violation(&mut self, violation: ProtocolViolation) {
        tracing::warn!(
            group = %self.group.key,
            message = %violation.message,
            "worker reported a protocol error"
        );
        let target = violation
            .item_id
            .as_deref()
            .and_then(|id| self.positions.get(id).copied())
            .filter(|&position| !self.reported[position]);
        match target {
            Some(position) => {
                let id = self.group.items[position].id.clone();
                let result =
                    TestResult::synthetic(&id, ErrorKind::ProtocolError, violation.message);
                self.deliver(position, result);
            }
            None => self.violation = Some(violation.message),
        }
    }

    /// Resolve every unreported item with a synthetic result
    fn fail_unreported(&mut self, mut make: impl FnMut(usize, &str) -> TestResult) {
        for position in 0..self.reported.len() {
            if !self.reported[position] {
                let id = self.group.items[position].id.clone();
                let result = make(position, &id);
                self.deliver(position, result);
            }
        }
    }
}

/// Supervisor that runs execution groups in worker processes
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a new supervisor
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run every group, at most `jobs` at a time. Groups for which
    /// `admit` returns false when their turn comes are cancelled unstarted
    /// with `reason`.
    pub fn run_all<F>(
        &self,
        groups: &[ExecutionGroup],
        sink: &dyn EventSink,
        cancel: &CancelToken,
        admit: F,
    ) -> Result<Vec<GroupOutcome>, SupervisorError>
    where
        F: Fn() -> Result<(), String> + Sync,
    {
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let run_one = |group: &ExecutionGroup| {
            if cancel.is_cancelled() {
                return cancel_group(group, sink, "not run: run cancelled");
            }
            match admit() {
                Ok(()) => self.run(group, sink, cancel),
                Err(reason) => cancel_group(group, sink, &reason),
            }
        };

        let jobs = self.config.jobs.max(1);
        if jobs == 1 || groups.len() == 1 {
            return Ok(groups.iter().map(run_one).collect());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(jobs.min(groups.len()))
            .thread_name(|i| format!("isocell-supervisor-{i}"))
            .build()
            .map_err(|e| SupervisorError::Pool(e.to_string()))?;

        Ok(pool.install(|| groups.par_iter().map(run_one).collect()))
    }

    /// Run one group to completion and report its outcome to `sink`
    pub fn run(
        &self,
        group: &ExecutionGroup,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> GroupOutcome {
        let start = Instant::now();
        let mut run = GroupRun::new(group, sink);
        let outcome = self.supervise(&mut run, cancel, start);
        tracing::debug!(
            group = %group.key,
            signal = ?outcome.signal,
            exit_code = ?outcome.exit_code,
            signal_number = ?outcome.signal_number,
            "group finished"
        );
        sink.deliver(SupervisorEvent::Outcome(outcome.clone()));
        outcome
    }

    fn supervise(
        &self,
        run: &mut GroupRun<'_>,
        cancel: &CancelToken,
        start: Instant,
    ) -> GroupOutcome {
        let group = run.group;

        let capture = match tempfile::Builder::new().prefix("isocell-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return spawn_failed(run, &SupervisorError::CaptureDir(e), start),
        };
        let log_path = capture.path().join(WORKER_LOG);

        let mut worker = match WorkerHandle::spawn(&self.config.command, &log_path) {
            Ok(worker) => worker,
            Err(e) => return spawn_failed(run, &e, start),
        };

        let request = SupervisorMessage::GroupRequest(self.request(group, capture.path()));
        let deadline = deadline_after(start, group.timeout);
        let stop = self.pump(&mut worker, run, &request, deadline, cancel);

        let signal = match stop {
            Stop::Completed(done) => {
                worker.state = WorkerState::Completed;
                worker.reap(self.config.grace_period);
                tracing::debug!(group = %group.key, executed = done.executed, "group complete");
                run.fail_unreported(|_, id| {
                    TestResult::synthetic(
                        id,
                        ErrorKind::ProtocolError,
                        "worker reported the group complete without a result for this test",
                    )
                });
                ExitSignal::Normal
            }
            Stop::Deadline => {
                let message = format!(
                    "group '{}' timed out after {} (elapsed {:.2}s). Increase the timeout with \
                     --timeout, default_timeout in isocell.toml, or #[isolated(timeout = N)].",
                    group.key,
                    format_limit(group.timeout),
                    start.elapsed().as_secs_f64(),
                );
                self.timed_out(&mut worker, run, cancel, message)
            }
            Stop::Hung(silence) => {
                let message = format!(
                    "group '{}' stopped sending heartbeats for {} (elapsed {:.2}s)",
                    group.key,
                    format_limit(silence),
                    start.elapsed().as_secs_f64(),
                );
                self.timed_out(&mut worker, run, cancel, message)
            }
            Stop::Cancelled => {
                worker.kill();
                run.fail_unreported(|_, id| {
                    TestResult::synthetic(id, ErrorKind::Cancelled, "run cancelled")
                });
                ExitSignal::Cancelled
            }
            Stop::Closed => {
                worker.state = WorkerState::Crashed;
                let status = worker.reap(self.config.grace_period);
                crashed(run, status, None, capture.path());
                ExitSignal::Crashed
            }
            Stop::Desync(err) => {
                worker.state = WorkerState::Crashed;
                worker.kill();
                let detail = format!("after a corrupt frame ({err})");
                crashed(run, worker.exit_status(), Some(detail), capture.path());
                ExitSignal::Crashed
            }
            Stop::Handshake(message) => {
                worker.state = WorkerState::Crashed;
                worker.kill();
                run.fail_unreported(|_, id| {
                    TestResult::synthetic(id, ErrorKind::ProtocolError, message.clone())
                });
                ExitSignal::Crashed
            }
        };

        let status = worker.exit_status();
        GroupOutcome {
            key: group.key.clone(),
            signal,
            exit_code: status.and_then(|s| s.code()),
            signal_number: status.and_then(|s| s.signal()),
            pid: Some(worker.pid()),
            duration: start.elapsed(),
        }
    }

    fn request(&self, group: &ExecutionGroup, capture_dir: &Path) -> GroupRequest {
        GroupRequest {
            group_key: group.key.clone(),
            items: group
                .items
                .iter()
                .enumerate()
                .map(|(position, item)| ItemRequest {
                    id: item.id.clone(),
                    position: position as u32,
                })
                .collect(),
            working_dir: self
                .config
                .working_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            env: self
                .config
                .env
                .iter()
                .map(|(key, value)| EnvVar {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            capture_dir: capture_dir.to_string_lossy().into_owned(),
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
        }
    }

    /// Read frames until something ends the group
    fn pump(
        &self,
        worker: &mut WorkerHandle,
        run: &mut GroupRun<'_>,
        request: &SupervisorMessage,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Stop {
        let mut last_activity = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Stop::Cancelled;
            }

            let now = Instant::now();
            if expired(deadline, now) {
                return Stop::Deadline;
            }
            if let Some(limit) = self.config.hang_timeout {
                let silence = now.duration_since(last_activity);
                if worker.state == WorkerState::Running && silence >= limit {
                    return Stop::Hung(silence);
                }
            }

            let wait = deadline.map_or(POLL_SLICE, |d| d - now);
            match worker.poll(wait) {
                PollResult::DataAvailable => {}
                PollResult::Timeout => {
                    if !worker.is_alive() {
                        // Exited but something else still holds the pipe open
                        return self.drain_exited(worker, run, request);
                    }
                    continue;
                }
                PollResult::PipeClosed => return Stop::Closed,
                PollResult::Error(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                PollResult::Error(e) => return Stop::Desync(FrameError::Io(e)),
            }

            if let Some(stop) = self.step(worker, run, request) {
                return stop;
            }
            last_activity = Instant::now();
        }
    }

    /// Consume what an exited worker left in the pipe.
    ///
    /// The worker may have written its last frames between a poll timeout
    /// and the exit check, so the group only counts as closed once the pipe
    /// holds nothing more.
    fn drain_exited(
        &self,
        worker: &mut WorkerHandle,
        run: &mut GroupRun<'_>,
        request: &SupervisorMessage,
    ) -> Stop {
        loop {
            match worker.poll(Duration::ZERO) {
                PollResult::DataAvailable => {}
                PollResult::Error(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                PollResult::Timeout | PollResult::PipeClosed | PollResult::Error(_) => {
                    return Stop::Closed;
                }
            }
            if let Some(stop) = self.step(worker, run, request) {
                return stop;
            }
        }
    }

    /// Read and act on one frame; `Some` when it ends the group
    fn step(
        &self,
        worker: &mut WorkerHandle,
        run: &mut GroupRun<'_>,
        request: &SupervisorMessage,
    ) -> Option<Stop> {
        let frame = match worker.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::EndOfStream) => return Some(Stop::Closed),
            Err(e) if e.is_desync() => return Some(Stop::Desync(e)),
            Err(e) => {
                tracing::warn!(group = %run.group.key, error = %e, "ignoring frame");
                return None;
            }
        };

        if worker.state == WorkerState::Starting && frame.kind != FrameKind::Hello {
            return Some(Stop::Handshake(format!(
                "worker sent {} before its handshake",
                frame.kind
            )));
        }

        match WorkerMessage::decode(&frame) {
            Ok(WorkerMessage::Hello(hello)) => {
                if worker.state != WorkerState::Starting {
                    tracing::warn!(group = %run.group.key, "ignoring repeated handshake");
                    return None;
                }
                if hello.protocol_version != PROTOCOL_VERSION {
                    return Some(Stop::Handshake(format!(
                        "worker speaks protocol version {}, expected {}",
                        hello.protocol_version, PROTOCOL_VERSION
                    )));
                }
                worker.state = WorkerState::Running;
                if let Err(e) = worker.send(request) {
                    // The exit is picked up on the next poll
                    tracing::debug!(
                        group = %run.group.key,
                        error = %e,
                        "cannot send group request"
                    );
                }
            }
            Ok(WorkerMessage::TestResult(result)) => run.record(result),
            Ok(WorkerMessage::GroupComplete(done)) => return Some(Stop::Completed(done)),
            Ok(WorkerMessage::Heartbeat(beat)) => {
                tracing::trace!(group = %run.group.key, sequence = beat.sequence, "heartbeat");
            }
            Ok(WorkerMessage::ProtocolError(violation)) => run.protocol_violation(violation),
            Err(FrameError::Deserialization {
                kind: FrameKind::TestResult,
                message,
            }) => run.undecodable_result(&message),
            Err(e) => {
                tracing::warn!(group = %run.group.key, error = %e, "ignoring undecodable frame");
            }
        }
        None
    }

    /// SIGTERM, keep forwarding results for the grace period, SIGKILL
    fn timed_out(
        &self,
        worker: &mut WorkerHandle,
        run: &mut GroupRun<'_>,
        cancel: &CancelToken,
        message: String,
    ) -> ExitSignal {
        worker.state = WorkerState::TimedOut;
        worker.terminate();

        let drain_deadline = deadline_after(Instant::now(), self.config.grace_period);
        let mut exited = false;
        while !cancel.is_cancelled() {
            let remaining =
                drain_deadline.map_or(POLL_SLICE, |d| d.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                break;
            }
            let wait = if exited { Duration::ZERO } else { remaining };
            match worker.poll(wait) {
                PollResult::DataAvailable => match worker.read_frame() {
                    Ok(frame) => match WorkerMessage::decode(&frame) {
                        Ok(WorkerMessage::TestResult(result)) => run.record(result),
                        Ok(WorkerMessage::GroupComplete(_)) => break,
                        _ => {}
                    },
                    Err(e) if e.is_desync() || matches!(e, FrameError::EndOfStream) => break,
                    Err(_) => {}
                },
                PollResult::Timeout => {
                    // One more look at the pipe after the exit
                    if exited {
                        break;
                    }
                    exited = !worker.is_alive();
                }
                PollResult::PipeClosed | PollResult::Error(_) => break,
            }
        }

        worker.kill();
        tracing::warn!(group = %run.group.key, "{message}");
        run.fail_unreported(|_, id| TestResult::synthetic(id, ErrorKind::Timeout, message.clone()));
        ExitSignal::TimedOut
    }
}

/// Resolve a group that never got a worker
fn spawn_failed(run: &mut GroupRun<'_>, err: &SupervisorError, start: Instant) -> GroupOutcome {
    let message = format!("failed to start worker for group '{}': {err}", run.group.key);
    tracing::error!("{message}");
    run.fail_unreported(|_, id| {
        TestResult::synthetic(id, ErrorKind::ProcessSpawnFailure, message.clone())
    });
    GroupOutcome {
        key: run.group.key.clone(),
        signal: ExitSignal::SpawnFailed,
        exit_code: None,
        signal_number: None,
        pid: None,
        duration: start.elapsed(),
    }
}

/// Resolve a group without starting it, reporting the outcome to `sink`
pub fn cancel_group(group: &ExecutionGroup, sink: &dyn EventSink, reason: &str) -> GroupOutcome {
    let mut run = GroupRun::new(group, sink);
    run.fail_unreported(|_, id| TestResult::synthetic(id, ErrorKind::Cancelled, reason));
    let outcome = GroupOutcome {
        key: group.key.clone(),
        signal: ExitSignal::Cancelled,
        exit_code: None,
        signal_number: None,
        pid: None,
        duration: Duration::ZERO,
    };
    sink.deliver(SupervisorEvent::Outcome(outcome.clone()));
    outcome
}

/// Attribute a worker death to the unreported items
fn crashed(
    run: &mut GroupRun<'_>,
    status: Option<ExitStatus>,
    detail: Option<String>,
    capture_dir: &Path,
) {
    let mut reason = describe_exit(status);
    if let Some(detail) = detail {
        reason.push(' ');
        reason.push_str(&detail);
    }

    let mut diagnostics = String::new();
    if let Some(violation) = &run.violation {
        diagnostics.push_str(&format!("\n\nWorker reported: {violation}"));
    }
    let tail = log_tail(&capture_dir.join(WORKER_LOG), LOG_TAIL_LINES);
    if !tail.is_empty() {
        diagnostics.push_str(&format!("\n\nWorker log:\n{tail}"));
    }

    // The test that was executing is the first unreported one that got as
    // far as opening its capture files.
    let positions = |i: usize| capture_paths(capture_dir, i as u32);
    let executing = run.next_unreported().filter(|&i| positions(i).exists());

    tracing::warn!(group = %run.group.key, reason = %reason, "worker crashed");

    if executing.is_none() && !run.any_reported() {
        let message = format!(
            "worker for group '{}' {reason} and produced no per-test report. \
             It may have failed before running any test.{diagnostics}",
            run.group.key
        );
        run.fail_unreported(|_, id| TestResult::synthetic(id, ErrorKind::Crash, message.clone()));
        return;
    }

    run.fail_unreported(|position, id| {
        if Some(position) == executing {
            let mut result = TestResult::synthetic(
                id,
                ErrorKind::Crash,
                format!("worker {reason} during test execution.{diagnostics}"),
            );
            attach_partial_capture(&mut result, &positions(position));
            result
        } else if executing.is_some() {
            TestResult::synthetic(
                id,
                ErrorKind::Crash,
                format!("test did not run - worker {reason} during earlier test execution."),
            )
        } else {
            TestResult::synthetic(
                id,
                ErrorKind::Crash,
                format!("test did not run - worker {reason} between tests.{diagnostics}"),
            )
        }
    });
}

fn attach_partial_capture(result: &mut TestResult, paths: &CapturePaths) {
    let captured = paths.read();
    result.stdout = captured.stdout;
    result.stderr = captured.stderr;
}

/// Human-readable reason for a worker exit
pub fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => match (status.signal(), status.code()) {
            (Some(signal), _) => format!("crashed with signal {signal}"),
            (None, Some(code)) => format!("crashed with exit code {code}"),
            (None, None) => "crashed".to_string(),
        },
        None => "crashed".to_string(),
    }
}

/// Last `lines` lines of a log file, empty if unreadable
fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn format_limit(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isocell_core::TestItem;
    use isocell_ipc::Hello;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SupervisorEvent>>);

    impl EventSink for Collect {
        fn deliver(&self, event: SupervisorEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Collect {
        fn results(&self) -> Vec<TestResult> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SupervisorEvent::Result { result, .. } => Some(result.clone()),
                    SupervisorEvent::Outcome(_) => None,
                })
                .collect()
        }

        fn outcomes(&self) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, SupervisorEvent::Outcome(_)))
                .count()
        }
    }

    fn group(ids: &[&str], timeout: Duration) -> ExecutionGroup {
        ExecutionGroup {
            key: "g".to_string(),
            items: ids
                .iter()
                .enumerate()
                .map(|(i, id)| TestItem::new(*id, "m", i).in_group("g"))
                .collect(),
            timeout,
        }
    }

    fn shell(script: &str) -> Supervisor {
        let command = WorkerCommand::new("/bin/sh").arg("-c").arg(script);
        let mut config = SupervisorConfig::new(command);
        config.grace_period = Duration::from_millis(100);
        Supervisor::new(config)
    }

    fn passed(id: &str) -> TestResult {
        TestResult {
            failure: None,
            call: isocell_ipc::PhaseStatus::Passed,
            ..TestResult::synthetic(id, ErrorKind::CallFailure, "")
        }
    }

    fn complete(executed: u32) -> WorkerMessage {
        WorkerMessage::GroupComplete(GroupComplete {
            executed,
            duration_nanos: 0,
        })
    }

    /// A shell worker that writes `messages` to fd 4, then runs `then`
    fn scripted(dir: &tempfile::TempDir, messages: &[WorkerMessage], then: &str) -> Supervisor {
        let path = dir.path().join("frames");
        let mut bytes = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut bytes);
            for message in messages {
                writer.send(message).unwrap();
            }
        }
        std::fs::write(&path, bytes).unwrap();
        shell(&format!("cat '{}' >&4; {then}", path.display()))
    }

    fn kinds(results: &[TestResult]) -> Vec<ErrorKind> {
        results
            .iter()
            .map(|r| r.failure.as_ref().map(|f| f.kind).unwrap())
            .collect()
    }

    #[test]
    fn test_exit_before_handshake_is_crash() {
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(10));
        let outcome =
            shell("echo 'linker exploded' >&2; exit 3").run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::Crashed);
        assert_eq!(outcome.exit_code, Some(3));
        let results = sink.results();
        assert_eq!(kinds(&results), vec![ErrorKind::Crash, ErrorKind::Crash]);
        let message = &results[0].failure.as_ref().unwrap().message;
        assert!(message.contains("produced no per-test report"), "{message}");
        assert!(message.contains("crashed with exit code 3"), "{message}");
        assert!(message.contains("linker exploded"), "{message}");
        assert_eq!(sink.outcomes(), 1);
    }

    #[test]
    fn test_silent_worker_times_out_and_is_killed() {
        let sink = Collect::default();
        let group = group(&["m::slow"], Duration::from_millis(300));
        let start = Instant::now();
        let outcome = shell("sleep 30").run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        let pid = outcome.pid.unwrap() as libc::pid_t;
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1, "worker must be gone");

        let results = sink.results();
        assert_eq!(kinds(&results), vec![ErrorKind::Timeout]);
        let message = &results[0].failure.as_ref().unwrap().message;
        assert!(message.contains("group 'g' timed out after 0.30s"), "{message}");
    }

    #[test]
    fn test_cancelled_run_marks_items_cancelled() {
        let sink = Collect::default();
        let group = group(&["m::a"], Duration::from_secs(30));
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = shell("sleep 30").run(&group, &sink, &cancel);

        assert_eq!(outcome.signal, ExitSignal::Cancelled);
        assert_eq!(kinds(&sink.results()), vec![ErrorKind::Cancelled]);
    }

    #[test]
    fn test_missing_program_is_spawn_failure() {
        let command = WorkerCommand::new("/nonexistent/isocell-worker");
        let supervisor = Supervisor::new(SupervisorConfig::new(command));
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(1));
        let outcome = supervisor.run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::SpawnFailed);
        assert_eq!(outcome.pid, None);
        assert_eq!(
            kinds(&sink.results()),
            vec![ErrorKind::ProcessSpawnFailure, ErrorKind::ProcessSpawnFailure]
        );
    }

    #[test]
    fn test_garbage_before_handshake_is_crash() {
        let sink = Collect::default();
        let group = group(&["m::a"], Duration::from_secs(10));
        // A zero length prefix desynchronises the channel
        let outcome = shell("printf '\\000\\000\\000\\000' >&4; sleep 30").run(
            &group,
            &sink,
            &CancelToken::new(),
        );
        assert_eq!(outcome.signal, ExitSignal::Crashed);
        let results = sink.results();
        assert_eq!(kinds(&results), vec![ErrorKind::Crash]);
        assert!(results[0].failure.as_ref().unwrap().message.contains("corrupt frame"));
    }

    #[test]
    fn test_protocol_version_mismatch_fails_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            ..Hello::current()
        };
        let supervisor = scripted(&dir, &[WorkerMessage::Hello(hello)], "sleep 30");
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(10));
        let start = Instant::now();
        let outcome = supervisor.run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::Crashed);
        assert!(start.elapsed() < Duration::from_secs(5));
        let results = sink.results();
        assert_eq!(kinds(&results), vec![ErrorKind::ProtocolError, ErrorKind::ProtocolError]);
        let message = &results[0].failure.as_ref().unwrap().message;
        let expected = format!(
            "protocol version {}, expected {}",
            PROTOCOL_VERSION + 1,
            PROTOCOL_VERSION
        );
        assert!(message.contains(&expected), "{message}");
    }

    #[test]
    fn test_early_group_complete_fills_missing_items() {
        let dir = tempfile::tempdir().unwrap();
        let messages = [
            WorkerMessage::Hello(Hello::current()),
            WorkerMessage::TestResult(passed("m::a")),
            complete(1),
        ];
        let supervisor = scripted(&dir, &messages, "exit 0");
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(10));
        let outcome = supervisor.run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::Normal);
        let results = sink.results();
        assert_eq!(results.len(), 2);
        assert!(results[0].passed());
        assert_eq!(results[1].item_id, "m::b");
        let failure = results[1].failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::ProtocolError);
        assert!(failure.message.contains("without a result"), "{}", failure.message);
    }

    #[test]
    fn test_silent_running_worker_is_hung() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = scripted(
            &dir,
            &[WorkerMessage::Hello(Hello::current())],
            "kill -STOP $$",
        );
        supervisor.config.hang_timeout = Some(Duration::from_millis(300));
        let sink = Collect::default();
        let group = group(&["m::a"], Duration::from_secs(30));
        let start = Instant::now();
        let outcome = supervisor.run(&group, &sink, &CancelToken::new());

        assert_eq!(outcome.signal, ExitSignal::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        let pid = outcome.pid.unwrap() as libc::pid_t;
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1, "stopped worker must be gone");

        let results = sink.results();
        assert_eq!(kinds(&results), vec![ErrorKind::Timeout]);
        let message = &results[0].failure.as_ref().unwrap().message;
        assert!(message.contains("stopped sending heartbeats"), "{message}");
    }

    #[test]
    fn test_frames_left_by_an_exited_worker_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let messages = [
            WorkerMessage::Hello(Hello::current()),
            WorkerMessage::TestResult(passed("m::a")),
            complete(1),
        ];
        let supervisor = scripted(&dir, &messages, "exit 0");
        let sink = Collect::default();
        let group = group(&["m::a"], Duration::from_secs(10));
        let mut run = GroupRun::new(&group, &sink);

        let log = dir.path().join(WORKER_LOG);
        let mut worker = WorkerHandle::spawn(&supervisor.config.command, &log).unwrap();
        while worker.is_alive() {
            std::thread::sleep(Duration::from_millis(10));
        }

        let request = SupervisorMessage::GroupRequest(supervisor.request(&group, dir.path()));
        let stop = supervisor.drain_exited(&mut worker, &mut run, &request);

        assert!(matches!(stop, Stop::Completed(GroupComplete { executed: 1, .. })));
        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed());
    }

    #[test]
    fn test_unrepresentable_timeout_means_no_deadline() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), None);
        assert!(!expired(None, now));
        assert!(expired(deadline_after(now, Duration::ZERO), now));

        let sink = Collect::default();
        let group = group(&["m::a"], Duration::MAX);
        let outcome = shell("exit 4").run(&group, &sink, &CancelToken::new());
        assert_eq!(outcome.signal, ExitSignal::Crashed);
        assert_eq!(outcome.exit_code, Some(4));
    }

    #[test]
    fn test_cancel_group_resolves_every_item() {
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(1));
        let outcome = cancel_group(&group, &sink, "not run: max-fail reached");
        assert_eq!(outcome.signal, ExitSignal::Cancelled);
        let results = sink.results();
        assert_eq!(results.len(), 2);
        assert!(
            results
                .iter()
                .all(|r| r.failure.as_ref().unwrap().message == "not run: max-fail reached")
        );
    }

    #[test]
    fn test_record_drops_unknown_and_duplicate_results() {
        let sink = Collect::default();
        let group = group(&["m::a", "m::b"], Duration::from_secs(1));
        let mut run = GroupRun::new(&group, &sink);

        let ok = |id: &str| TestResult {
            failure: None,
            call: isocell_ipc::PhaseStatus::Passed,
            ..TestResult::synthetic(id, ErrorKind::CallFailure, "")
        };
        run.record(ok("m::a"));
        run.record(ok("m::a"));
        run.record(ok("m::zzz"));
        run.undecodable_result("bad bytes");

        let results = sink.results();
        assert_eq!(results.len(), 2);
        assert!(results[0].passed());
        assert_eq!(results[1].item_id, "m::b");
        assert_eq!(results[1].failure.as_ref().unwrap().kind, ErrorKind::ProtocolError);
        assert_eq!(run.next_unreported(), None);
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(describe_exit(Some(ExitStatus::from_raw(6))), "crashed with signal 6");
        assert_eq!(
            describe_exit(Some(ExitStatus::from_raw(3 << 8))),
            "crashed with exit code 3"
        );
        assert_eq!(describe_exit(None), "crashed");
    }

    #[test]
    fn test_log_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WORKER_LOG);
        let body: String = (0..30).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, body).unwrap();
        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 27\nline 28\nline 29");
        assert_eq!(log_tail(&dir.path().join("missing"), 3), "");
    }
}
