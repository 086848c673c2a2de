//! Supervisor/worker wire protocol.
//!
//! Every frame is one JSON object on one line:
//!
//! ```text
//! {"seq":1,"kind":"request","payload":{"type":"execute","code":"x = 1","timeout_ms":5000}}
//! {"seq":1,"kind":"response","payload":{"type":"result","stdout":"","stderr":"","exception":null,"duration_ms":3}}
//! {"seq":7,"kind":"heartbeat","payload":{"type":"beat"}}
//! ```
//!
//! Request and response frames share the execution sequence number.
//! Heartbeat frames carry their own counter.
//!
//! Both ends share a frame limit. Workers cut captured output down with
//! [`Frame::fit_within`] so a result always fits; a line that still
//! exceeds the limit is replaced by a local [`Payload::Discarded`] marker
//! instead of vanishing.

use quarry_core::{ExecutionRequest, ExecutionResult, SequenceId};
use serde::{Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

/// Maximum encoded frame length, excluding the newline
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Appended to a captured stream that was cut to fit the frame limit
pub const TRUNCATION_NOTE: &str = "\n[output truncated to fit the frame limit]\n";

/// Frame category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Supervisor to worker, numbered by execution sequence
    Request,
    /// Worker to supervisor, echoing the request's sequence
    Response,
    /// Liveness traffic in either direction
    Heartbeat,
}

/// Frame body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Worker handshake, sent once after connecting
    Ready {
        /// Worker process id, informational
        pid: u32,
        /// Interpreter description, e.g. `python 3.12.1`
        runtime: String,
        /// Launch token the worker was started with
        #[serde(default)]
        token: String,
    },
    /// Heartbeat request or echo
    Beat,
    /// Run code in the persistent namespace
    Execute {
        /// Source to execute
        code: String,
        /// Advisory time budget
        timeout_ms: u64,
    },
    /// Ask the worker to exit
    Shutdown,
    /// Captured output of one execution
    #[serde(rename = "result")]
    Outcome {
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
        /// Formatted exception trace, if the code raised
        #[serde(default)]
        exception: Option<String>,
        /// Wall time spent executing
        duration_ms: u64,
    },
    /// Acknowledges a shutdown request
    Ack,
    /// Stands in for a line longer than the frame limit; never on the wire
    #[serde(skip)]
    Discarded {
        /// Limit the line exceeded
        max: usize,
    },
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Sequence number (execution sequence or heartbeat counter)
    pub seq: u64,
    /// Frame category
    pub kind: FrameKind,
    /// Frame body
    pub payload: Payload,
}

impl Frame {
    /// Worker handshake
    #[must_use]
    pub fn ready(pid: u32, runtime: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            seq: 0,
            kind: FrameKind::Heartbeat,
            payload: Payload::Ready {
                pid,
                runtime: runtime.into(),
                token: token.into(),
            },
        }
    }

    /// Heartbeat with its own counter
    #[must_use]
    pub fn beat(counter: u64) -> Self {
        Self {
            seq: counter,
            kind: FrameKind::Heartbeat,
            payload: Payload::Beat,
        }
    }

    /// Execute request
    #[must_use]
    pub fn execute(request: &ExecutionRequest) -> Self {
        Self {
            seq: request.sequence_id.as_u64(),
            kind: FrameKind::Request,
            payload: Payload::Execute {
                code: request.code.clone(),
                timeout_ms: request.timeout_ms,
            },
        }
    }

    /// Shutdown request
    #[must_use]
    pub fn shutdown(seq: u64) -> Self {
        Self {
            seq,
            kind: FrameKind::Request,
            payload: Payload::Shutdown,
        }
    }

    /// Execution response
    #[must_use]
    pub fn outcome(
        seq: u64,
        stdout: String,
        stderr: String,
        exception: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            seq,
            kind: FrameKind::Response,
            payload: Payload::Outcome {
                stdout,
                stderr,
                exception,
                duration_ms,
            },
        }
    }

    /// Shutdown acknowledgement
    #[must_use]
    pub fn ack(seq: u64) -> Self {
        Self {
            seq,
            kind: FrameKind::Response,
            payload: Payload::Ack,
        }
    }

    /// Marker for a received line that exceeded `max`
    #[must_use]
    pub fn discarded(max: usize) -> Self {
        Self {
            seq: 0,
            kind: FrameKind::Response,
            payload: Payload::Discarded { max },
        }
    }

    /// Encoded length without the trailing newline
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_string(self).map_or(usize::MAX, |line| line.len())
    }

    /// Shrink an execution response until it encodes within `max` bytes
    ///
    /// The longest of stdout, stderr and the exception trace is halved
    /// and marked with [`TRUNCATION_NOTE`] until the frame fits or all
    /// three are empty. Other frames are returned unchanged.
    #[must_use]
    pub fn fit_within(mut self, max: usize) -> Self {
        while self.encoded_len() > max {
            let Payload::Outcome {
                stdout,
                stderr,
                exception,
                ..
            } = &mut self.payload
            else {
                break;
            };
            let mut fields: Vec<&mut String> = vec![stdout, stderr];
            if let Some(trace) = exception.as_mut() {
                fields.push(trace);
            }
            let Some(longest) = fields.into_iter().max_by_key(|f| f.len()) else {
                break;
            };
            if longest.is_empty() {
                break;
            }
            halve(longest);
        }
        self
    }

    /// Convert an execution response into a result; `None` for other frames
    #[must_use]
    pub fn into_result(self) -> Option<ExecutionResult> {
        match self.payload {
            Payload::Outcome {
                stdout,
                stderr,
                exception,
                duration_ms,
            } => Some(ExecutionResult::completed(
                SequenceId::from_raw(self.seq),
                stdout,
                stderr,
                exception,
                duration_ms,
            )),
            _ => None,
        }
    }

    /// Whether the payload is allowed for this frame kind
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        matches!(
            (self.kind, &self.payload),
            (FrameKind::Heartbeat, Payload::Ready { .. } | Payload::Beat)
                | (FrameKind::Request, Payload::Execute { .. } | Payload::Shutdown)
                | (FrameKind::Response, Payload::Outcome { .. } | Payload::Ack)
        )
    }
}

fn halve(text: &mut String) {
    let keep = text.len() / 2;
    if keep <= TRUNCATION_NOTE.len() {
        text.clear();
        return;
    }
    let mut cut = keep - TRUNCATION_NOTE.len();
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_NOTE);
}

/// How the supervisor should treat an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Response to the outstanding request
    Accept,
    /// Response for a request nobody is waiting on
    Stale,
    /// Shutdown acknowledgement
    Ack,
    /// Liveness traffic
    Heartbeat,
    /// A line over the frame limit was dropped in its place
    Oversized,
    /// Frame a worker must never send
    Unexpected,
}

/// Classify a frame received by the supervisor
#[must_use]
pub fn classify(frame: &Frame, outstanding: Option<SequenceId>) -> Disposition {
    match (frame.kind, &frame.payload) {
        (FrameKind::Heartbeat, Payload::Beat) => Disposition::Heartbeat,
        (FrameKind::Response, Payload::Outcome { .. }) => {
            if outstanding.map(|s| s.as_u64()) == Some(frame.seq) {
                Disposition::Accept
            } else {
                Disposition::Stale
            }
        }
        (FrameKind::Response, Payload::Ack) => Disposition::Ack,
        (_, Payload::Discarded { .. }) => Disposition::Oversized,
        _ => Disposition::Unexpected,
    }
}

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),
    /// Outgoing frame exceeds the limit
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong {
        /// Encoded length
        len: usize,
        /// Limit
        max: usize,
    },
}

/// Newline-delimited JSON frame codec
///
/// Lines that are not valid frames are skipped with a warning instead of
/// failing the stream. An over-long line decodes as a
/// [`Payload::Discarded`] marker and the rest of it is dropped.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default frame limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LEN)
    }

    /// Codec with a custom frame limit
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max),
        }
    }

    /// Frame limit in bytes
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.lines.max_length()
    }

    fn parse(line: &str) -> Option<Frame> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<Frame>(line) {
            Ok(frame) if frame.is_well_formed() => Some(frame),
            Ok(frame) => {
                warn!(seq = frame.seq, kind = ?frame.kind, "Discarding frame with mismatched payload");
                None
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed frame");
                None
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    let max = self.lines.max_length();
                    warn!(max, "Discarding over-long frame");
                    return Ok(Some(Frame::discarded(max)));
                }
                Err(LinesCodecError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    let max = self.lines.max_length();
                    warn!(max, "Discarding over-long frame");
                    return Ok(Some(Frame::discarded(max)));
                }
                Err(LinesCodecError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = serde_json::to_string(&frame).map_err(|e| CodecError::Encode(e.to_string()))?;
        let max = self.lines.max_length();
        if line.len() > max {
            return Err(CodecError::FrameTooLong {
                len: line.len(),
                max,
            });
        }
        self.lines.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => CodecError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLong {
                len: 0,
                max,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_shape() {
        let buf = encode(Frame::beat(7));
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            "{\"seq\":7,\"kind\":\"heartbeat\",\"payload\":{\"type\":\"beat\"}}\n"
        );

        let buf = encode(Frame::outcome(3, "hi\n".into(), String::new(), None, 4));
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.contains("\"kind\":\"response\""));
        assert!(text.contains("\"type\":\"result\""));
    }

    #[test]
    fn test_decode_splits_lines() {
        let request = ExecutionRequest::new(SequenceId::FIRST, "x = 1", 100);
        let mut buf = encode(Frame::execute(&request));
        buf.extend_from_slice(&encode(Frame::beat(1)));

        let mut codec = FrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Request);
        assert_eq!(first.seq, 1);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload, Payload::Beat);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_line_waits() {
        let full = encode(Frame::beat(2));
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        let mut codec = FrameCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::beat(2)));
    }

    #[test]
    fn test_decode_skips_malformed_lines() {
        let mut buf = BytesMut::from("not json\n\n{\"seq\":1,\"kind\":\"request\",\"payload\":{\"type\":\"beat\"}}\n");
        buf.extend_from_slice(&encode(Frame::ack(4)));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::ack(4)));
    }

    #[test]
    fn test_decode_marks_over_long_lines() {
        let mut codec = FrameCodec::with_max_length(64);
        let mut buf = BytesMut::from(format!("{}\n", "x".repeat(200)).as_str());
        buf.extend_from_slice(&encode(Frame::beat(9)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::discarded(64)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::beat(9)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_over_long_line_split_across_reads() {
        let mut codec = FrameCodec::with_max_length(64);
        let mut buf = BytesMut::from("x".repeat(100).as_str());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::discarded(64)));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(format!("{}\n", "x".repeat(100)).as_bytes());
        buf.extend_from_slice(&encode(Frame::ack(3)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::ack(3)));
    }

    #[test]
    fn test_discarded_marker_is_local_only() {
        let mut buf = BytesMut::new();
        let result = FrameCodec::new().encode(Frame::discarded(8), &mut buf);
        assert!(matches!(result, Err(CodecError::Encode(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fit_within_truncates_longest_stream() {
        let frame = Frame::outcome(4, "o".repeat(10_000), "short warning\n".into(), None, 7);
        let fitted = frame.fit_within(2_048);
        assert!(fitted.encoded_len() <= 2_048);
        match fitted.payload {
            Payload::Outcome {
                stdout,
                stderr,
                exception,
                duration_ms,
            } => {
                assert!(stdout.starts_with("ooo"));
                assert!(stdout.ends_with(TRUNCATION_NOTE));
                assert_eq!(stderr, "short warning\n");
                assert!(exception.is_none());
                assert_eq!(duration_ms, 7);
            }
            other => panic!("expected outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_fit_within_leaves_small_frames_alone() {
        let frame = Frame::outcome(1, "é".repeat(5), String::new(), Some("Traceback".into()), 1);
        assert_eq!(frame.clone().fit_within(MAX_FRAME_LEN), frame);
        assert_eq!(Frame::beat(1).fit_within(4), Frame::beat(1));
    }

    proptest! {
        #[test]
        fn test_fit_within_always_fits(
            stdout in "[a-zé\n\"]{0,3000}",
            stderr in r"[a-z\\]{0,3000}",
            trace in prop::option::of("[A-Za-z \n]{0,3000}"),
        ) {
            let fitted = Frame::outcome(9, stdout, stderr, trace, 1).fit_within(512);
            prop_assert!(fitted.encoded_len() <= 512);
        }
    }

    #[test]
    fn test_encode_rejects_over_long_frames() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(Frame::ready(1, "python 3.12", "t"), &mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLong { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_without_newline() {
        let mut buf = BytesMut::from("{\"seq\":5,\"kind\":\"response\",\"payload\":{\"type\":\"ack\"}}");
        let mut codec = FrameCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::ack(5)));
    }

    #[test]
    fn test_classify() {
        let outstanding = Some(SequenceId::from_raw(3));
        let ok = Frame::outcome(3, String::new(), String::new(), None, 1);
        let late = Frame::outcome(2, String::new(), String::new(), None, 1);

        assert_eq!(classify(&ok, outstanding), Disposition::Accept);
        assert_eq!(classify(&late, outstanding), Disposition::Stale);
        assert_eq!(classify(&ok, None), Disposition::Stale);
        assert_eq!(classify(&Frame::beat(3), outstanding), Disposition::Heartbeat);
        assert_eq!(classify(&Frame::ack(1), None), Disposition::Ack);
        assert_eq!(classify(&Frame::shutdown(1), None), Disposition::Unexpected);
        assert_eq!(classify(&Frame::ready(1, "x", "t"), None), Disposition::Unexpected);
        assert_eq!(classify(&Frame::discarded(64), outstanding), Disposition::Oversized);
    }

    #[test]
    fn test_into_result() {
        let raised = Frame::outcome(2, "out".into(), String::new(), Some("Traceback".into()), 9);
        let result = raised.into_result().unwrap();
        assert_eq!(result.sequence_id, SequenceId::from_raw(2));
        assert_eq!(result.status, quarry_core::ExecutionStatus::Error);
        assert_eq!(result.duration_ms, 9);
        assert!(Frame::ack(1).into_result().is_none());
    }

    #[test]
    fn test_well_formed() {
        assert!(Frame::ready(1, "x", "t").is_well_formed());
        let bad = Frame {
            seq: 1,
            kind: FrameKind::Response,
            payload: Payload::Shutdown,
        };
        assert!(!bad.is_well_formed());
    }
}
