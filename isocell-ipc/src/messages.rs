//! IPC Message Types
//!
//! All payloads are serialized with rkyv and validated on receipt.

use crate::framing::{Frame, FrameError, FrameKind, Message, decode_payload, encode_payload};
use rkyv::{AlignedVec, Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use std::fmt;

/// Status of a single test phase
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    /// Phase ran and succeeded
    Passed,
    /// Assertion failure in the test body
    Failed,
    /// Setup or teardown machinery failed
    Errored,
    /// Phase asked to be skipped
    Skipped,
    /// Phase never ran
    NotRun,
}

impl PhaseStatus {
    /// Whether this phase counts against the test
    pub fn is_failure(self) -> bool {
        matches!(self, PhaseStatus::Failed | PhaseStatus::Errored)
    }
}

/// Phases of one test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Runs before the body
    Setup,
    /// The test body
    Call,
    /// Runs after the body
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Setup => "setup",
            Phase::Call => "call",
            Phase::Teardown => "teardown",
        })
    }
}

/// Categories of test failures
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Setup phase failed
    SetupFailure,
    /// Test body failed
    CallFailure,
    /// Teardown phase failed
    TeardownFailure,
    /// Group deadline exceeded
    Timeout,
    /// Worker died before reporting
    Crash,
    /// Run aborted before the item finished
    Cancelled,
    /// Malformed or out-of-order IPC traffic
    ProtocolError,
    /// Worker could not be started
    ProcessSpawnFailure,
}

impl ErrorKind {
    /// Failure kind produced by a failing phase
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Setup => ErrorKind::SetupFailure,
            Phase::Call => ErrorKind::CallFailure,
            Phase::Teardown => ErrorKind::TeardownFailure,
        }
    }

    /// Whether the supervisor, not the test, produced this kind
    pub fn is_supervisor_detected(self) -> bool {
        !matches!(
            self,
            ErrorKind::SetupFailure | ErrorKind::CallFailure | ErrorKind::TeardownFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::SetupFailure => "setup failure",
            ErrorKind::CallFailure => "failure",
            ErrorKind::TeardownFailure => "teardown failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Crash => "crash",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::ProcessSpawnFailure => "spawn failure",
        })
    }
}

/// Why a test did not pass
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct FailureDetail {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Panic location and backtrace, when captured
    pub traceback: Option<String>,
}

impl FailureDetail {
    /// Create a failure without traceback
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }
}

/// Result of one test item, streamed as soon as the item finishes
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct TestResult {
    /// Item identifier
    pub item_id: String,
    /// Setup phase status
    pub setup: PhaseStatus,
    /// Body status
    pub call: PhaseStatus,
    /// Teardown phase status
    pub teardown: PhaseStatus,
    /// Wall time spent on all phases
    pub duration_nanos: u64,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Set whenever a phase did not pass or skip
    pub failure: Option<FailureDetail>,
    /// Reason given to `skip`, when a phase skipped
    pub skip_reason: Option<String>,
}

impl TestResult {
    /// Build a result for an item the test never got to report on.
    ///
    /// Setup and teardown are reported as passed so the item reads as a
    /// failure of its call rather than an error of its fixtures.
    pub fn synthetic(
        item_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let call = if kind == ErrorKind::ProcessSpawnFailure {
            PhaseStatus::Errored
        } else {
            PhaseStatus::Failed
        };
        Self {
            item_id: item_id.into(),
            setup: PhaseStatus::Passed,
            call,
            teardown: PhaseStatus::Passed,
            duration_nanos: 0,
            stdout: String::new(),
            stderr: String::new(),
            failure: Some(FailureDetail::new(kind, message)),
            skip_reason: None,
        }
    }

    /// Whether every phase passed
    pub fn passed(&self) -> bool {
        self.failure.is_none()
            && self.setup == PhaseStatus::Passed
            && self.call == PhaseStatus::Passed
            && self.teardown == PhaseStatus::Passed
    }

    /// Whether the item was skipped in setup or call without failing
    pub fn skipped(&self) -> bool {
        self.failure.is_none()
            && (self.setup == PhaseStatus::Skipped || self.call == PhaseStatus::Skipped)
            && !self.teardown.is_failure()
    }
}

/// One key/value pair of the worker environment
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct EnvVar {
    /// Variable name
    pub key: String,
    /// Variable value
    pub value: String,
}

/// One item the worker should execute
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ItemRequest {
    /// Item identifier
    pub id: String,
    /// Position inside the group, also used to name capture files
    pub position: u32,
}

/// Everything the worker needs to run one group
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct GroupRequest {
    /// Group key, for diagnostics
    pub group_key: String,
    /// Items in execution order
    pub items: Vec<ItemRequest>,
    /// Directory the worker should run in (empty = inherit)
    pub working_dir: String,
    /// Extra environment for the worker
    pub env: Vec<EnvVar>,
    /// Directory for per-item capture files (empty = capture disabled)
    pub capture_dir: String,
    /// Heartbeat interval in milliseconds (0 = no heartbeats)
    pub heartbeat_interval_ms: u64,
}

/// Handshake from a freshly started worker
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Hello {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Worker process id
    pub pid: u32,
}

impl Hello {
    /// Handshake for the current process
    pub fn current() -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id(),
        }
    }
}

/// Sent after the last item of a group
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct GroupComplete {
    /// Number of items executed
    pub executed: u32,
    /// Total time spent executing items
    pub duration_nanos: u64,
}

/// Liveness ping
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Heartbeat {
    /// Monotonic counter
    pub sequence: u64,
}

/// A peer could not make sense of something it received
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ProtocolViolation {
    /// Item the problem concerns, if known
    pub item_id: Option<String>,
    /// What went wrong
    pub message: String,
}

/// Messages sent from Worker to Supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Initial handshake
    Hello(Hello),
    /// One item finished
    TestResult(TestResult),
    /// All items finished
    GroupComplete(GroupComplete),
    /// Still alive
    Heartbeat(Heartbeat),
    /// Worker-side protocol failure
    ProtocolError(ProtocolViolation),
}

impl Message for WorkerMessage {
    fn kind(&self) -> FrameKind {
        match self {
            WorkerMessage::Hello(_) => FrameKind::Hello,
            WorkerMessage::TestResult(_) => FrameKind::TestResult,
            WorkerMessage::GroupComplete(_) => FrameKind::GroupComplete,
            WorkerMessage::Heartbeat(_) => FrameKind::Heartbeat,
            WorkerMessage::ProtocolError(_) => FrameKind::ProtocolError,
        }
    }

    fn encode(&self) -> Result<AlignedVec, FrameError> {
        match self {
            WorkerMessage::Hello(m) => encode_payload(m),
            WorkerMessage::TestResult(m) => encode_payload(m),
            WorkerMessage::GroupComplete(m) => encode_payload(m),
            WorkerMessage::Heartbeat(m) => encode_payload(m),
            WorkerMessage::ProtocolError(m) => encode_payload(m),
        }
    }

    fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let bytes = &frame.payload[..];
        Ok(match frame.kind {
            FrameKind::Hello => WorkerMessage::Hello(decode_payload(frame.kind, bytes)?),
            FrameKind::TestResult => WorkerMessage::TestResult(decode_payload(frame.kind, bytes)?),
            FrameKind::GroupComplete => {
                WorkerMessage::GroupComplete(decode_payload(frame.kind, bytes)?)
            }
            FrameKind::Heartbeat => WorkerMessage::Heartbeat(decode_payload(frame.kind, bytes)?),
            FrameKind::ProtocolError => {
                WorkerMessage::ProtocolError(decode_payload(frame.kind, bytes)?)
            }
            got @ FrameKind::GroupRequest => return Err(FrameError::UnexpectedKind { got }),
        })
    }
}

/// Messages sent from Supervisor to Worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorMessage {
    /// Run a group
    GroupRequest(GroupRequest),
}

impl Message for SupervisorMessage {
    fn kind(&self) -> FrameKind {
        match self {
            SupervisorMessage::GroupRequest(_) => FrameKind::GroupRequest,
        }
    }

    fn encode(&self) -> Result<AlignedVec, FrameError> {
        match self {
            SupervisorMessage::GroupRequest(m) => encode_payload(m),
        }
    }

    fn decode(frame: &Frame) -> Result<Self, FrameError> {
        match frame.kind {
            FrameKind::GroupRequest => Ok(SupervisorMessage::GroupRequest(decode_payload(
                frame.kind,
                &frame.payload,
            )?)),
            got => Err(FrameError::UnexpectedKind { got }),
        }
    }
}
