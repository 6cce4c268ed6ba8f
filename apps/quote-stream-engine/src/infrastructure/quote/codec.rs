//! Frame Codec
//!
//! Encoding and decoding for the quoting service's length-prefixed framing.
//!
//! # Wire Format
//!
//! Every message is wrapped as `~m~<len>~m~<payload>`, where `<len>` is the
//! decimal byte length of the UTF-8 payload. One socket message may carry
//! several frames back to back, and a frame may be split across reads.
//!
//! Payloads are either a heartbeat (`~h~<n>`, which must be echoed back
//! verbatim) or a JSON object:
//!
//! ```json
//! {"m":"du","p":["cs_xxxxxxxxxxxx",{"sds_1":{"s":[{"i":0,"v":[1700000000,1.0,2.0,0.5,1.5,100]}]}}]}
//! ```
//!
//! `du` and `timescale_update` are data; everything else is control.

use std::str::FromStr;

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::streaming::Bar;
use crate::infrastructure::quote::messages::ProtocolMessage;

/// Frame delimiter surrounding the length prefix.
pub const FRAME_MARKER: &str = "~m~";

/// Prefix of heartbeat payloads.
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Longest accepted length prefix, in digits.
const MAX_LENGTH_DIGITS: usize = 10;

/// Codec errors.
///
/// Any of these leaves the stream unsynchronized, so callers treat them as
/// connection-level faults.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer does not start with the frame marker.
    #[error("missing frame marker")]
    MissingMarker,

    /// The length prefix is empty, non-numeric, or too long.
    #[error("invalid length prefix: {0}")]
    InvalidLength(String),

    /// The declared payload length exceeds the configured limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// A data message carried no session identifier.
    #[error("data message `{0}` has no session id")]
    MissingSession(String),

    /// A bar record could not be parsed.
    #[error("invalid bar record: {0}")]
    InvalidRecord(String),
}

// =============================================================================
// Frames
// =============================================================================

/// Kind of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// Server heartbeat; must be echoed.
    Heartbeat,
    /// Initial server hello carrying the server session info.
    ServerHello,
    /// Symbol resolved for a chart session.
    SymbolResolved,
    /// Initial series load started.
    SeriesLoading,
    /// Initial series load finished.
    SeriesCompleted,
    /// Symbol could not be resolved.
    SymbolError,
    /// Series could not be created.
    SeriesError,
    /// Server-side fatal error.
    CriticalError,
    /// The server rejected a malformed client message.
    ProtocolError,
    /// Any other named message.
    Other(String),
}

impl ControlKind {
    /// Label used for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::ServerHello => "server_hello",
            Self::SymbolResolved => "symbol_resolved",
            Self::SeriesLoading => "series_loading",
            Self::SeriesCompleted => "series_completed",
            Self::SymbolError => "symbol_error",
            Self::SeriesError => "series_error",
            Self::CriticalError => "critical_error",
            Self::ProtocolError => "protocol_error",
            Self::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "symbol_resolved" => Self::SymbolResolved,
            "series_loading" => Self::SeriesLoading,
            "series_completed" => Self::SeriesCompleted,
            "symbol_error" => Self::SymbolError,
            "series_error" => Self::SeriesError,
            "critical_error" => Self::CriticalError,
            "protocol_error" => Self::ProtocolError,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A control frame (heartbeat, ack, or error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// What kind of control message this is.
    pub kind: ControlKind,
    /// Chart session the message refers to, if any.
    pub session_id: Option<String>,
    /// Human-readable reason carried by error messages.
    pub reason: Option<String>,
    /// Raw payload.
    pub payload: String,
}

/// A data frame: bars for one chart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Chart session the bars belong to.
    pub session_id: String,
    /// Decoded bars, in payload order.
    pub bars: Vec<Bar>,
    /// Raw payload.
    pub payload: String,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Heartbeat, ack, or error.
    Control(ControlFrame),
    /// Bars for a chart session.
    Data(DataFrame),
}

impl Frame {
    /// Raw payload of the frame.
    #[must_use]
    pub fn payload(&self) -> &str {
        match self {
            Self::Control(control) => &control.payload,
            Self::Data(data) => &data.payload,
        }
    }

    /// Whether this is a server heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Control(control) if control.kind == ControlKind::Heartbeat)
    }
}

/// Result of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied.
    Frame {
        /// The frame.
        frame: Frame,
        /// Bytes consumed from the start of the buffer.
        consumed: usize,
    },
    /// More bytes are needed; nothing was consumed.
    Incomplete,
}

// =============================================================================
// Codec
// =============================================================================

/// Length-prefix frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    /// Create a codec accepting payloads up to `max_frame_bytes`.
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Wrap a payload in a frame.
    #[must_use]
    pub fn encode(&self, payload: &str) -> String {
        format!("{FRAME_MARKER}{}{FRAME_MARKER}{payload}", payload.len())
    }

    /// Serialize and frame a protocol message.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_message(&self, message: &ProtocolMessage) -> Result<String, FrameError> {
        Ok(self.encode(&message.to_payload()?))
    }

    /// Decode the first frame in `buf`.
    ///
    /// Returns [`Decoded::Incomplete`] when `buf` holds only a prefix of a
    /// frame; the caller keeps the bytes and retries after the next read.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed header, an oversized frame, or a
    /// payload that cannot be classified.
    pub fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        let marker = FRAME_MARKER.as_bytes();

        if buf.len() < marker.len() {
            return if marker.starts_with(buf) {
                Ok(Decoded::Incomplete)
            } else {
                Err(FrameError::MissingMarker)
            };
        }
        if !buf.starts_with(marker) {
            return Err(FrameError::MissingMarker);
        }

        let digits_start = marker.len();
        let digits = buf[digits_start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits > MAX_LENGTH_DIGITS {
            return Err(FrameError::InvalidLength(format!("{digits} digits")));
        }

        let digits_end = digits_start + digits;
        let header_end = digits_end + marker.len();
        if buf.len() < header_end {
            return if marker.starts_with(&buf[digits_end..]) {
                Ok(Decoded::Incomplete)
            } else {
                Err(FrameError::InvalidLength(lossy_prefix(&buf[digits_start..])))
            };
        }
        if digits == 0 || &buf[digits_end..header_end] != marker {
            return Err(FrameError::InvalidLength(lossy_prefix(&buf[digits_start..])));
        }

        let len_text = std::str::from_utf8(&buf[digits_start..digits_end])?;
        let len = usize::from_str(len_text)
            .map_err(|e| FrameError::InvalidLength(format!("{len_text}: {e}")))?;
        if len > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let frame_end = header_end + len;
        if buf.len() < frame_end {
            return Ok(Decoded::Incomplete);
        }

        let payload = std::str::from_utf8(&buf[header_end..frame_end])?;
        let frame = classify(payload)?;
        Ok(Decoded::Frame {
            frame,
            consumed: frame_end,
        })
    }
}

fn lossy_prefix(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(16)]).into_owned()
}

/// Classify a payload as control or data.
fn classify(payload: &str) -> Result<Frame, FrameError> {
    if payload.starts_with(HEARTBEAT_PREFIX) {
        return Ok(Frame::Control(ControlFrame {
            kind: ControlKind::Heartbeat,
            session_id: None,
            reason: None,
            payload: payload.to_string(),
        }));
    }

    let value: Value = serde_json::from_str(payload)?;

    let Some(name) = value.get("m").and_then(Value::as_str) else {
        let kind = if value.get("session_id").is_some() {
            ControlKind::ServerHello
        } else {
            ControlKind::Other("unknown".to_string())
        };
        return Ok(Frame::Control(ControlFrame {
            kind,
            session_id: None,
            reason: None,
            payload: payload.to_string(),
        }));
    };

    let params = value
        .get("p")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice);
    let session_id = params
        .first()
        .and_then(Value::as_str)
        .map(ToString::to_string);

    match name {
        "du" | "timescale_update" => {
            let session_id = session_id.ok_or_else(|| FrameError::MissingSession(name.to_string()))?;
            let bars = match params.get(1) {
                Some(series) => parse_series(series)?,
                None => Vec::new(),
            };
            Ok(Frame::Data(DataFrame {
                session_id,
                bars,
                payload: payload.to_string(),
            }))
        }
        _ => {
            let kind = ControlKind::from_name(name);
            let reason = match kind {
                ControlKind::SymbolError
                | ControlKind::SeriesError
                | ControlKind::CriticalError
                | ControlKind::ProtocolError => last_text(params),
                _ => None,
            };
            // Connection-wide errors only carry a session when the first
            // parameter looks like a chart session id
            let session_id = match kind {
                ControlKind::CriticalError | ControlKind::ProtocolError => {
                    session_id.filter(|id| id.starts_with("cs_"))
                }
                _ => session_id,
            };
            Ok(Frame::Control(ControlFrame {
                kind,
                session_id,
                reason,
                payload: payload.to_string(),
            }))
        }
    }
}

fn last_text(params: &[Value]) -> Option<String> {
    params
        .iter()
        .rev()
        .find_map(Value::as_str)
        .map(ToString::to_string)
}

/// Parse `{series_key: {"s": [{"i": n, "v": [ts, o, h, l, c, vol?]}]}}`.
fn parse_series(series: &Value) -> Result<Vec<Bar>, FrameError> {
    let Some(series) = series.as_object() else {
        return Ok(Vec::new());
    };

    let mut bars = Vec::new();
    for entry in series.values() {
        let Some(records) = entry.get("s").and_then(Value::as_array) else {
            continue;
        };
        for record in records {
            let values = record
                .get("v")
                .and_then(Value::as_array)
                .ok_or_else(|| FrameError::InvalidRecord("missing `v` array".to_string()))?;
            bars.push(parse_bar(values)?);
        }
    }
    Ok(bars)
}

fn parse_bar(values: &[Value]) -> Result<Bar, FrameError> {
    if values.len() < 5 {
        return Err(FrameError::InvalidRecord(format!(
            "expected at least 5 fields, got {}",
            values.len()
        )));
    }

    let time = parse_timestamp(&values[0])?;
    let volume = match values.get(5) {
        Some(Value::Null) | None => Decimal::ZERO,
        Some(value) => parse_decimal(value)?,
    };

    Ok(Bar {
        time,
        open: parse_decimal(&values[1])?,
        high: parse_decimal(&values[2])?,
        low: parse_decimal(&values[3])?,
        close: parse_decimal(&values[4])?,
        volume,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, FrameError> {
    let seconds = value
        .as_f64()
        .ok_or_else(|| FrameError::InvalidRecord(format!("timestamp is not a number: {value}")))?;
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .ok_or_else(|| FrameError::InvalidRecord(format!("timestamp out of range: {value}")))
}

fn parse_decimal(value: &Value) -> Result<Decimal, FrameError> {
    let Value::Number(number) = value else {
        return Err(FrameError::InvalidRecord(format!("not a number: {value}")));
    };
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| FrameError::InvalidRecord(format!("{text}: {e}")))
}

// =============================================================================
// Frame Buffer
// =============================================================================

/// Accumulates socket reads and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received text.
    pub fn extend(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns the codec error for malformed data; the buffer is left as is.
    pub fn next_frame(&mut self, codec: &FrameCodec) -> Result<Option<Frame>, FrameError> {
        match codec.decode(&self.buf)? {
            Decoded::Frame { frame, consumed } => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    /// Buffered byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DU: &str = r#"{"m":"du","p":["cs_abcdefghijkl",{"sds_1":{"s":[{"i":299,"v":[1700000060.0,37000.5,37010.0,36990.25,37005.0,12.5]}],"ns":{"d":""}}}]}"#;

    fn decode_one(codec: &FrameCodec, wire: &str) -> (Frame, usize) {
        match codec.decode(wire.as_bytes()).unwrap() {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            Decoded::Incomplete => panic!("unexpected incomplete"),
        }
    }

    #[test]
    fn encode_prefixes_byte_length() {
        let codec = FrameCodec::default();
        assert_eq!(codec.encode("~h~1"), "~m~4~m~~h~1");
        assert_eq!(codec.encode("é"), "~m~2~m~é");
    }

    #[test]
    fn decodes_heartbeat() {
        let codec = FrameCodec::default();
        let (frame, consumed) = decode_one(&codec, "~m~4~m~~h~7");

        assert!(frame.is_heartbeat());
        assert_eq!(frame.payload(), "~h~7");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn decodes_server_hello() {
        let codec = FrameCodec::default();
        let payload = r#"{"session_id":"<0.1.2>","timestamp":1700000000,"release":"x"}"#;
        let (frame, _) = decode_one(&codec, &codec.encode(payload));

        match frame {
            Frame::Control(control) => assert_eq!(control.kind, ControlKind::ServerHello),
            Frame::Data(_) => panic!("hello is control"),
        }
    }

    #[test]
    fn decodes_data_update() {
        let codec = FrameCodec::default();
        let (frame, _) = decode_one(&codec, &codec.encode(DU));

        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.session_id, "cs_abcdefghijkl");
        assert_eq!(data.bars.len(), 1);
        let bar = &data.bars[0];
        assert_eq!(bar.time.timestamp(), 1_700_000_060);
        assert_eq!(bar.open, Decimal::from_str("37000.5").unwrap());
        assert_eq!(bar.low, Decimal::from_str("36990.25").unwrap());
        assert_eq!(bar.volume, Decimal::from_str("12.5").unwrap());
    }

    #[test]
    fn missing_volume_defaults_to_zero() {
        let codec = FrameCodec::default();
        let payload = r#"{"m":"timescale_update","p":["cs_a",{"sds_1":{"s":[{"i":0,"v":[1700000000,1,2,0.5,1.5]}]}}]}"#;
        let (frame, _) = decode_one(&codec, &codec.encode(payload));

        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.bars[0].volume, Decimal::ZERO);
    }

    #[test]
    fn symbol_error_carries_session_and_reason() {
        let codec = FrameCodec::default();
        let payload = r#"{"m":"symbol_error","p":["cs_abcdefghijkl","sds_sym_1","invalid symbol"]}"#;
        let (frame, _) = decode_one(&codec, &codec.encode(payload));

        let Frame::Control(control) = frame else {
            panic!("expected control frame");
        };
        assert_eq!(control.kind, ControlKind::SymbolError);
        assert_eq!(control.session_id.as_deref(), Some("cs_abcdefghijkl"));
        assert_eq!(control.reason.as_deref(), Some("invalid symbol"));
    }

    #[test]
    fn protocol_error_without_session() {
        let codec = FrameCodec::default();
        let payload = r#"{"m":"protocol_error","p":["wrong data"]}"#;
        let (frame, _) = decode_one(&codec, &codec.encode(payload));

        let Frame::Control(control) = frame else {
            panic!("expected control frame");
        };
        assert_eq!(control.kind, ControlKind::ProtocolError);
        assert!(control.session_id.is_none());
    }

    #[test]
    fn short_buffer_is_incomplete_then_completes() {
        let codec = FrameCodec::default();
        let wire = codec.encode(DU);
        let mut buffer = FrameBuffer::new();

        for cut in [1, 5, wire.len() - 1] {
            assert_eq!(codec.decode(&wire.as_bytes()[..cut]).unwrap(), Decoded::Incomplete);
        }

        let (head, tail) = wire.split_at(wire.len() / 2);
        buffer.extend(head);
        assert!(buffer.next_frame(&codec).unwrap().is_none());
        assert_eq!(buffer.len(), head.len());

        buffer.extend(tail);
        let frame = buffer.next_frame(&codec).unwrap().unwrap();
        assert_eq!(frame.payload(), DU);
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_yields_back_to_back_frames() {
        let codec = FrameCodec::default();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&format!("{}{}", codec.encode("~h~1"), codec.encode(DU)));

        assert!(buffer.next_frame(&codec).unwrap().unwrap().is_heartbeat());
        assert!(matches!(
            buffer.next_frame(&codec).unwrap(),
            Some(Frame::Data(_))
        ));
        assert!(buffer.next_frame(&codec).unwrap().is_none());
    }

    #[test]
    fn rejects_missing_marker() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(b"hello"),
            Err(FrameError::MissingMarker)
        ));
        assert!(matches!(codec.decode(b"x"), Err(FrameError::MissingMarker)));
    }

    #[test]
    fn rejects_bad_length() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(b"~m~abc~m~x"),
            Err(FrameError::InvalidLength(_))
        ));
        assert!(matches!(
            codec.decode(b"~m~12345678901~m~"),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let codec = FrameCodec::new(8);
        assert!(matches!(
            codec.decode(b"~m~9~m~"),
            Err(FrameError::FrameTooLarge { len: 9, max: 8 })
        ));
    }

    #[test]
    fn rejects_unparseable_payload() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(codec.encode("{not json").as_bytes()),
            Err(FrameError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rejects_truncated_bar_record() {
        let codec = FrameCodec::default();
        let payload = r#"{"m":"du","p":["cs_a",{"sds_1":{"s":[{"i":0,"v":[1700000000,1,2]}]}}]}"#;
        assert!(matches!(
            codec.decode(codec.encode(payload).as_bytes()),
            Err(FrameError::InvalidRecord(_))
        ));
    }

    #[test]
    fn rejects_data_without_session() {
        let codec = FrameCodec::default();
        let payload = r#"{"m":"du","p":[]}"#;
        assert!(matches!(
            codec.decode(codec.encode(payload).as_bytes()),
            Err(FrameError::MissingSession(_))
        ));
    }

    #[test]
    fn encodes_protocol_message() {
        let codec = FrameCodec::default();
        let wire = codec
            .encode_message(&ProtocolMessage::set_auth_token(None))
            .unwrap();
        let payload = r#"{"m":"set_auth_token","p":["unauthorized_user_token"]}"#;
        assert_eq!(wire, format!("~m~{}~m~{payload}", payload.len()));
    }

    proptest! {
        #[test]
        fn heartbeat_frames_round_trip(n in 0u64..1_000_000) {
            let codec = FrameCodec::default();
            let wire = codec.encode(&format!("~h~{n}"));
            let Decoded::Frame { frame, consumed } = codec.decode(wire.as_bytes()).unwrap() else {
                return Err(TestCaseError::fail("incomplete"));
            };
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(codec.encode(frame.payload()), wire);
        }

        #[test]
        fn control_frames_round_trip(name in "[a-z_]{1,20}", text in "\\PC{0,40}") {
            let codec = FrameCodec::default();
            let payload = serde_json::json!({"m": name, "p": [text]}).to_string();
            let wire = codec.encode(&payload);
            let Decoded::Frame { frame, .. } = codec.decode(wire.as_bytes()).unwrap() else {
                return Err(TestCaseError::fail("incomplete"));
            };
            prop_assert_eq!(codec.encode(frame.payload()), wire);
        }
    }
}
