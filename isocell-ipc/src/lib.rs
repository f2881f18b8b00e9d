#![warn(missing_docs)]
//! isocell IPC Protocol
//!
//! Framed, self-describing protocol for supervisor-worker communication.
//! Every frame carries a length prefix, a kind tag and an rkyv payload that is
//! validated before use, so it works over any byte channel: inherited pipes on
//! Unix, stdin/stdout elsewhere.

mod framing;
mod messages;

pub use framing::{
    Frame, FrameError, FrameKind, FrameReader, FrameWriter, MAX_FRAME_SIZE, Message,
    decode_payload, encode_payload, read_frame, write_frame,
};
pub use messages::{
    EnvVar, ErrorKind, FailureDetail, GroupComplete, GroupRequest, Heartbeat, Hello, ItemRequest,
    Phase, PhaseStatus, ProtocolViolation, SupervisorMessage, TestResult, WorkerMessage,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default heartbeat interval in milliseconds
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Environment variable carrying the inherited IPC fds (`<read>,<write>`)
pub const IPC_FD_ENV: &str = "ISOCELL_IPC_FD";
