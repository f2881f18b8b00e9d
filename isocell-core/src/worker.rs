//! Worker Process Entry Point
//!
//! Handles the worker side of the supervisor-worker architecture.
//!
//! On Unix, uses fd 3/4 for IPC (set via `ISOCELL_IPC_FD`) and installs a
//! SIGTERM handler that stops the group between tests. On non-Unix, falls
//! back to stdin/stdout and skips signal handling.

use crate::capture::capture_paths;
use crate::context::GroupContext;
use crate::executor::{RegistryExecutor, TestExecutor, run_item};
use isocell_ipc::{
    ErrorKind, FrameError, FrameReader, FrameWriter, GroupComplete, GroupRequest, Heartbeat,
    Hello, IPC_FD_ENV, ProtocolViolation, SupervisorMessage, TestResult, WorkerMessage,
};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Global flag set by SIGTERM handler to request graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if a graceful shutdown has been requested via SIGTERM.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

/// Errors that end a worker
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The supervisor channel failed
    #[error("IPC error: {0}")]
    Ipc(#[from] FrameError),

    /// The requested working directory could not be entered
    #[error("cannot enter working directory {path}: {source}")]
    WorkingDir {
        /// Requested directory
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The heartbeat thread could not be spawned
    #[error("cannot start heartbeat thread: {0}")]
    Heartbeat(std::io::Error),
}

type SharedWriter = Arc<Mutex<FrameWriter<Box<dyn Write + Send>>>>;

/// IPC transport: either inherited fd pair or stdin/stdout fallback.
enum IpcTransport {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> IpcTransport {
    #[cfg(unix)]
    if let Ok(val) = std::env::var(IPC_FD_ENV) {
        if let Some((r, w)) = val.split_once(',') {
            if let (Ok(read_fd), Ok(write_fd)) = (r.trim().parse(), w.trim().parse()) {
                return IpcTransport::Fds { read_fd, write_fd };
            }
        }
        tracing::warn!(
            value = %val,
            "invalid {} (expected format: <read_fd>,<write_fd>), falling back to stdio",
            IPC_FD_ENV
        );
    }
    IpcTransport::Stdio
}

fn open_transport() -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
    match detect_transport() {
        #[cfg(unix)]
        IpcTransport::Fds { read_fd, write_fd } => {
            // SAFETY: the supervisor hands these descriptors to exactly this
            // process and nothing else in it owns them.
            let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
            let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
            (Box::new(read_file), Box::new(write_file))
        }
        IpcTransport::Stdio => stdio_transport(),
    }
}

/// Output capture redirects fd 1, so on Unix the protocol writes to a
/// private duplicate of the original stdout.
#[cfg(unix)]
fn stdio_transport() -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return (Box::new(std::io::stdin()), Box::new(std::io::stdout()));
    }
    // SAFETY: `fd` was just created by dup and is owned by nobody else.
    let out = unsafe { std::fs::File::from_raw_fd(fd) };
    (Box::new(std::io::stdin()), Box::new(out))
}

#[cfg(not(unix))]
fn stdio_transport() -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
    (Box::new(std::io::stdin()), Box::new(std::io::stdout()))
}

/// Worker main loop
pub struct WorkerMain<E = RegistryExecutor> {
    reader: FrameReader<Box<dyn Read + Send>>,
    writer: SharedWriter,
    executor: E,
    apply_environment: bool,
}

impl WorkerMain<RegistryExecutor> {
    /// Create a worker over the registered tests, using fd 3/4 if
    /// `ISOCELL_IPC_FD` is set, otherwise stdin/stdout.
    pub fn new() -> Self {
        let (reader, writer) = open_transport();
        Self {
            reader: FrameReader::new(reader),
            writer: Arc::new(Mutex::new(FrameWriter::new(writer))),
            executor: RegistryExecutor::new(),
            apply_environment: true,
        }
    }
}

impl Default for WorkerMain<RegistryExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TestExecutor> WorkerMain<E> {
    /// Create a worker over arbitrary streams.
    ///
    /// The working directory and environment of the request are not applied
    /// to the process, so several of these can run in one test binary.
    pub fn from_io(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        executor: E,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: Arc::new(Mutex::new(FrameWriter::new(writer))),
            executor,
            apply_environment: false,
        }
    }

    /// Run the handshake and one group.
    ///
    /// On error a `ProtocolError` frame is attempted before returning; the
    /// caller should exit with status 2.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        install_sigterm_handler();

        let result = self.dispatch();
        if let Err(err) = &result {
            tracing::error!(error = %err, "worker failed");
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writer.send(&WorkerMessage::ProtocolError(ProtocolViolation {
                item_id: None,
                message: err.to_string(),
            }));
            let _ = writer.flush();
        }
        result
    }

    fn send(&self, message: &WorkerMessage) -> Result<(), FrameError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message)
    }

    /// Send one item's result. A result too big for a frame is replaced by a
    /// protocol error for that item; nothing was written, so the stream stays
    /// in sync and the group goes on.
    fn send_result(&self, result: TestResult) -> Result<(), FrameError> {
        let item_id = result.item_id.clone();
        match self.send(&WorkerMessage::TestResult(result)) {
            Err(err @ FrameError::FrameTooLarge { .. }) => {
                tracing::warn!(item = %item_id, error = %err, "result does not fit in a frame");
                let fallback = TestResult::synthetic(
                    &item_id,
                    ErrorKind::ProtocolError,
                    format!("result could not be sent: {err}"),
                );
                self.send(&WorkerMessage::TestResult(fallback))
            }
            other => other,
        }
    }

    fn dispatch(&mut self) -> Result<(), WorkerError> {
        self.send(&WorkerMessage::Hello(Hello::current()))?;

        let SupervisorMessage::GroupRequest(request) = self.reader.recv()?;
        tracing::debug!(
            group = %request.group_key,
            items = request.items.len(),
            "received group request"
        );

        if self.apply_environment {
            apply_environment(&request)?;
        }

        let heartbeat = match request.heartbeat_interval_ms {
            0 => None,
            ms => Some(
                HeartbeatThread::spawn(Arc::clone(&self.writer), Duration::from_millis(ms))
                    .map_err(WorkerError::Heartbeat)?,
            ),
        };

        let outcome = self.run_group(&request);

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }

        let (executed, duration) = outcome?;
        if shutdown_requested() {
            tracing::debug!(executed, "shutdown requested, leaving group early");
            return Ok(());
        }

        self.send(&WorkerMessage::GroupComplete(GroupComplete {
            executed,
            duration_nanos: duration.as_nanos() as u64,
        }))?;
        Ok(())
    }

    fn run_group(&mut self, request: &GroupRequest) -> Result<(u32, Duration), WorkerError> {
        let start = Instant::now();
        let capture_dir =
            (!request.capture_dir.is_empty()).then(|| Path::new(&request.capture_dir));
        let mut ctx = GroupContext::new(request.group_key.clone());
        let mut executed = 0u32;

        for item in &request.items {
            if shutdown_requested() {
                break;
            }

            let paths = capture_dir.map(|dir| capture_paths(dir, item.position));
            let result = run_item(&mut self.executor, &mut ctx, &item.id, paths.as_ref());
            tracing::debug!(item = %item.id, passed = result.passed(), "item finished");

            self.send_result(result)?;
            executed += 1;
        }

        Ok((executed, start.elapsed()))
    }
}

fn apply_environment(request: &GroupRequest) -> Result<(), WorkerError> {
    if !request.working_dir.is_empty() {
        std::env::set_current_dir(&request.working_dir).map_err(|source| {
            WorkerError::WorkingDir {
                path: request.working_dir.clone(),
                source,
            }
        })?;
    }
    for var in &request.env {
        // SAFETY: called from the worker's main thread before the heartbeat
        // thread or any test has started.
        unsafe { std::env::set_var(&var.key, &var.value) };
    }
    Ok(())
}

struct HeartbeatThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HeartbeatThread {
    fn spawn(writer: SharedWriter, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("isocell-heartbeat".to_string())
            .spawn(move || {
                let mut sequence = 0u64;
                loop {
                    thread::park_timeout(interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    sequence += 1;
                    let sent = writer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .send(&WorkerMessage::Heartbeat(Heartbeat { sequence }));
                    if sent.is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PhaseOutcomes;
    use isocell_ipc::{ItemRequest, MAX_FRAME_SIZE, PhaseStatus};
    use std::io::Cursor;

    /// Passes every id starting with `ok`, fails the rest with a panic-like detail
    struct ScriptedExecutor {
        seen: Vec<String>,
    }

    impl TestExecutor for ScriptedExecutor {
        fn execute(&mut self, item_id: &str, _ctx: &mut GroupContext) -> Option<PhaseOutcomes> {
            self.seen.push(item_id.to_string());
            match item_id {
                id if id.starts_with("ok") => Some(PhaseOutcomes::passed()),
                id if id.starts_with("bad") => Some(PhaseOutcomes {
                    call: PhaseStatus::Failed,
                    failure: Some(isocell_ipc::FailureDetail::new(
                        ErrorKind::CallFailure,
                        "assertion failed",
                    )),
                    ..PhaseOutcomes::passed()
                }),
                id if id.starts_with("huge") => Some(PhaseOutcomes {
                    call: PhaseStatus::Failed,
                    failure: Some(isocell_ipc::FailureDetail::new(
                        ErrorKind::CallFailure,
                        "x".repeat(MAX_FRAME_SIZE + 1),
                    )),
                    ..PhaseOutcomes::passed()
                }),
                _ => None,
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn request(ids: &[&str], heartbeat_interval_ms: u64) -> Vec<u8> {
        let request = SupervisorMessage::GroupRequest(GroupRequest {
            group_key: "g".to_string(),
            items: ids
                .iter()
                .enumerate()
                .map(|(i, id)| ItemRequest {
                    id: id.to_string(),
                    position: i as u32,
                })
                .collect(),
            working_dir: String::new(),
            env: Vec::new(),
            capture_dir: String::new(),
            heartbeat_interval_ms,
        });
        let mut buffer = Vec::new();
        FrameWriter::new(&mut buffer).send(&request).unwrap();
        buffer
    }

    fn drive(input: Vec<u8>) -> (Result<(), WorkerError>, Vec<WorkerMessage>, Vec<String>) {
        let out = SharedBuf::default();
        let executor = ScriptedExecutor { seen: Vec::new() };
        let mut worker = WorkerMain::from_io(
            Box::new(Cursor::new(input)),
            Box::new(out.clone()),
            executor,
        );
        let result = worker.run();
        let seen = worker.executor.seen.clone();
        drop(worker);

        let bytes = out.0.lock().unwrap().clone();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut messages = Vec::new();
        while let Ok(msg) = reader.recv::<WorkerMessage>() {
            messages.push(msg);
        }
        (result, messages, seen)
    }

    fn results(messages: &[WorkerMessage]) -> Vec<&isocell_ipc::TestResult> {
        messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::TestResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_runs_group_in_order() {
        let (result, messages, seen) = drive(request(&["ok_a", "bad_b", "ok_c"], 0));
        assert!(result.is_ok());
        assert_eq!(seen, vec!["ok_a", "bad_b", "ok_c"]);

        assert!(matches!(messages.first(), Some(WorkerMessage::Hello(_))));
        let ids: Vec<_> = results(&messages).iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["ok_a", "bad_b", "ok_c"]);
        assert!(results(&messages)[0].passed());
        assert_eq!(results(&messages)[1].call, PhaseStatus::Failed);

        match messages.last() {
            Some(WorkerMessage::GroupComplete(done)) => assert_eq!(done.executed, 3),
            other => panic!("expected GroupComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_item_does_not_stop_group() {
        let (result, messages, _) = drive(request(&["ghost", "ok_after"], 0));
        assert!(result.is_ok());
        let results = results(&messages);
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].failure.as_ref().map(|f| f.kind),
            Some(ErrorKind::ProtocolError)
        );
        assert!(results[1].passed());
    }

    #[test]
    fn test_oversized_result_stays_local_to_its_item() {
        let (result, messages, seen) = drive(request(&["huge_report", "ok_after"], 0));
        assert!(result.is_ok());
        assert_eq!(seen, vec!["huge_report", "ok_after"]);

        let results = results(&messages);
        assert_eq!(results.len(), 2);
        let failure = results[0].failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::ProtocolError);
        assert!(failure.message.contains("Frame too large"));
        assert!(results[1].passed());

        match messages.last() {
            Some(WorkerMessage::GroupComplete(done)) => assert_eq!(done.executed, 2),
            other => panic!("expected GroupComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_request_reports_protocol_error() {
        let (result, messages, seen) = drive(Vec::new());
        assert!(matches!(result, Err(WorkerError::Ipc(FrameError::EndOfStream))));
        assert!(seen.is_empty());
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::ProtocolError(ProtocolViolation { item_id: None, .. }))
        ));
    }

    #[test]
    fn test_heartbeats_share_the_channel() {
        let (result, messages, _) = drive(request(&["ok_a"], 1));
        assert!(result.is_ok());
        // Heartbeats may or may not have fired, but every frame must decode
        // and the group must still finish cleanly.
        assert!(matches!(messages.last(), Some(WorkerMessage::GroupComplete(_))));
        assert_eq!(results(&messages).len(), 1);
    }
}
