//! Length-Prefixed Frame Encoding
//!
//! Provides reliable message boundaries over stream-based IPC (pipes, stdio).
//!
//! Frame format:
//! ```text
//! +----------------+-----------+------------------+
//! | length (4 LE)  | kind (1)  | rkyv payload     |
//! +----------------+-----------+------------------+
//! ```
//!
//! `length` covers the kind byte and the payload. The whole frame is read
//! before the kind is validated, so a frame with an unknown kind or a payload
//! that fails validation leaves the stream positioned on the next frame.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::fmt;
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Write};
use thiserror::Error;

/// Maximum frame size (16 MB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Tag identifying the payload type of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Worker handshake
    Hello = 1,
    /// Supervisor asks the worker to run a group
    GroupRequest = 2,
    /// Result of one test item
    TestResult = 3,
    /// Every item of the group has been executed
    GroupComplete = 4,
    /// Periodic liveness ping
    Heartbeat = 5,
    /// A peer received something it could not handle
    ProtocolError = 6,
}

impl FrameKind {
    /// All kinds, in tag order
    pub const ALL: [FrameKind; 6] = [
        FrameKind::Hello,
        FrameKind::GroupRequest,
        FrameKind::TestResult,
        FrameKind::GroupComplete,
        FrameKind::Heartbeat,
        FrameKind::ProtocolError,
    ];

    /// Wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a kind by its wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Hello => "Hello",
            FrameKind::GroupRequest => "GroupRequest",
            FrameKind::TestResult => "TestResult",
            FrameKind::GroupComplete => "GroupComplete",
            FrameKind::Heartbeat => "Heartbeat",
            FrameKind::ProtocolError => "ProtocolError",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    /// Reading or writing the channel failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A payload failed validation for its kind
    #[error("Cannot decode {kind} payload: {message}")]
    Deserialization {
        /// Kind of the frame
        kind: FrameKind,
        /// Validator message
        message: String,
    },

    /// A frame exceeds `MAX_FRAME_SIZE`
    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Frame length
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// A length prefix that cannot start a frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A kind tag this protocol version does not know
    #[error("Unknown frame kind tag {0}")]
    UnknownKind(u8),

    /// A known kind that does not travel in this direction
    #[error("Unexpected {got} frame on this channel")]
    UnexpectedKind {
        /// Kind that arrived
        got: FrameKind,
    },

    /// The peer closed the channel between frames
    #[error("End of stream")]
    EndOfStream,
}

impl FrameError {
    /// Whether the reader lost track of frame boundaries.
    ///
    /// After a desynchronising error no further frame can be trusted; any
    /// other error concerns a single frame and the stream stays usable.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            FrameError::Io(_) | FrameError::FrameTooLarge { .. } | FrameError::InvalidFrame(_)
        )
    }
}

/// A frame read off the wire, payload not yet decoded
#[derive(Debug)]
pub struct Frame {
    /// Payload type
    pub kind: FrameKind,
    /// Aligned rkyv bytes
    pub payload: AlignedVec,
}

impl Frame {
    /// Decode the payload as `T`
    pub fn decode<T>(&self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        decode_payload(self.kind, &self.payload)
    }
}

/// Serialize a payload value with rkyv
pub fn encode_payload<T>(value: &T) -> Result<AlignedVec, FrameError>
where
    T: Serialize<AllocSerializer<256>>,
{
    rkyv::to_bytes::<_, 256>(value).map_err(|e| FrameError::Serialization(e.to_string()))
}

/// Validate and deserialize a payload
pub fn decode_payload<T>(kind: FrameKind, bytes: &[u8]) -> Result<T, FrameError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let archived = rkyv::check_archived_root::<T>(bytes).map_err(|e| {
        FrameError::Deserialization {
            kind,
            message: e.to_string(),
        }
    })?;

    match archived.deserialize(&mut Infallible) {
        Ok(value) => Ok(value),
        Err(never) => match never {},
    }
}

/// Write one frame to a writer and flush it
pub fn write_frame<W: Write>(
    writer: &mut BufWriter<W>,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = payload.len() + 1;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_le_bytes())?;
    writer.write_all(&[kind.tag()])?;
    writer.write_all(payload)?;

    // Streamed results must be visible to the supervisor even if the
    // worker dies right after this call.
    writer.flush()?;

    Ok(())
}

/// Read one frame from a reader
pub fn read_frame<R: Read>(reader: &mut BufReader<R>) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }

    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;

    // Payload goes into an aligned buffer so rkyv can validate it in place
    let mut payload = AlignedVec::with_capacity(len - 1);
    payload.resize(len - 1, 0);
    reader.read_exact(&mut payload)?;

    let kind = FrameKind::from_tag(tag[0]).ok_or(FrameError::UnknownKind(tag[0]))?;

    Ok(Frame { kind, payload })
}

/// A message type that travels as a single frame
pub trait Message: Sized {
    /// Frame kind for this message
    fn kind(&self) -> FrameKind;

    /// Serialize the payload
    fn encode(&self) -> Result<AlignedVec, FrameError>;

    /// Rebuild the message from a frame
    fn decode(frame: &Frame) -> Result<Self, FrameError>;
}

/// Frame writer wrapper for convenient message sending
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Create a new frame writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(64 * 1024, writer), // 64KB buffer
        }
    }

    /// Encode and write a message
    pub fn send<M: Message>(&mut self, message: &M) -> Result<(), FrameError> {
        let payload = message.encode()?;
        write_frame(&mut self.writer, message.kind(), &payload)
    }

    /// Write an already-encoded payload
    pub fn write_raw(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.writer, kind, payload)
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Get mutable reference to the inner writer
    pub fn inner_mut(&mut self) -> &mut BufWriter<W> {
        &mut self.writer
    }
}

/// Frame reader wrapper for convenient message receiving
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Create a new frame reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader), // 64KB buffer
        }
    }

    /// Read the next raw frame
    pub fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.reader)
    }

    /// Read and decode the next message
    pub fn recv<M: Message>(&mut self) -> Result<M, FrameError> {
        let frame = self.read_frame()?;
        M::decode(&frame)
    }

    /// Check if the buffer has any data available
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
    #[archive(check_bytes)]
    struct Sample {
        value: u64,
        text: String,
    }

    fn framed(kind: FrameKind, sample: &Sample) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            let payload = encode_payload(sample).unwrap();
            writer.write_raw(kind, &payload).unwrap();
        }
        buffer
    }

    #[test]
    fn test_frame_carries_kind_and_payload() {
        let sample = Sample {
            value: 42,
            text: "hello world".to_string(),
        };
        let buffer = framed(FrameKind::Heartbeat, &sample);

        let len = u32::from_le_bytes(buffer[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buffer.len() - 4);
        assert_eq!(buffer[4], FrameKind::Heartbeat.tag());

        let mut reader = FrameReader::new(Cursor::new(buffer));
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Heartbeat);
        assert_eq!(frame.decode::<Sample>().unwrap(), sample);
    }

    #[test]
    fn test_end_of_stream() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.read_frame(), Err(FrameError::EndOfStream)));
    }

    #[test]
    fn test_zero_length_frame_is_desync() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0, 0]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame(_)));
        assert!(err.is_desync());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        let mut reader = FrameReader::new(Cursor::new(len.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(err.is_desync());
    }

    #[test]
    fn test_unknown_kind_keeps_stream_in_sync() {
        let sample = Sample {
            value: 7,
            text: "next".to_string(),
        };
        let mut buffer = framed(FrameKind::Heartbeat, &sample);
        buffer[4] = 0xEE;
        buffer.extend(framed(FrameKind::Hello, &sample));

        let mut reader = FrameReader::new(Cursor::new(buffer));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(0xEE)));
        assert!(!err.is_desync());

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Hello);
        assert_eq!(frame.decode::<Sample>().unwrap(), sample);
    }

    #[test]
    fn test_corrupt_payload_reports_kind() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer.write_raw(FrameKind::TestResult, &[0xFF; 3]).unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(buffer));
        let frame = reader.read_frame().unwrap();
        let err = frame.decode::<Sample>().unwrap_err();
        match err {
            FrameError::Deserialization { kind, .. } => assert_eq!(kind, FrameKind::TestResult),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let sample = Sample {
            value: 1,
            text: "cut".to_string(),
        };
        let mut buffer = framed(FrameKind::TestResult, &sample);
        buffer.truncate(buffer.len() - 2);
        let mut reader = FrameReader::new(Cursor::new(buffer));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(err.is_desync());
    }

    #[test]
    fn test_kind_tags_are_stable() {
        for kind in FrameKind::ALL {
            assert_eq!(FrameKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(FrameKind::TestResult.tag(), 3);
        assert_eq!(FrameKind::from_tag(0), None);
    }
}
