//! Wire codec for the module bus.
//!
//! Protocol Overview:
//! - Format: ASCII, one message per line
//! - Outbound: `<module>:<payload>\r\n`, payload is `<channel>?` (query) or
//!   `<channel>=<value>` with an optional trailing `!` requesting an acknowledgement
//! - Inbound: `#<module>:<channel>=<signed decimal>[ [comment]]`, terminated by CR and/or LF
//! - Floats are sent with 10 fractional digits so the wire form is deterministic
//!
//! Lines that do not match the inbound pattern are not errors, they are dropped.
//! Values are kept as the raw decimal token; interpreting them is up to the
//! profile that owns the channel.

use crate::error::DecodeError;
use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Outbound line terminator.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Marker appended to an assignment when the module should acknowledge it.
pub const ACK_MARKER: char = '!';

static INBOUND_LINE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^#(\d+):(\d+)=(-?[0-9.]+)(?: +(.*))?$").expect("inbound pattern is valid")
});

/// Encode a payload addressed to `module` into a terminated ASCII line.
pub fn encode(module: u8, payload: &str) -> Vec<u8> {
    format!("{module}:{payload}{LINE_TERMINATOR}").into_bytes()
}

/// Payload for a bare channel query.
pub fn query_payload(channel: u8) -> String {
    format!("{channel}?")
}

/// Payload for a channel assignment.
pub fn assign_payload(channel: u8, value: &WireValue, request_ack: bool) -> String {
    if request_ack {
        format!("{channel}={value}{ACK_MARKER}")
    } else {
        format!("{channel}={value}")
    }
}

/// Decode one inbound line.
///
/// Trailing CR/LF is ignored. Returns `None` for anything that is not a
/// well-formed response line, including module or channel numbers that do not
/// fit the bus address space.
pub fn decode(line: &str) -> Option<InboundMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = INBOUND_LINE.captures(line)?;

    let module = caps.get(1)?.as_str().parse::<u8>().ok()?;
    let channel = caps.get(2)?.as_str().parse::<u8>().ok()?;
    let value = RawValue(caps.get(3)?.as_str().to_string());
    let comment = caps.get(4).and_then(|m| clean_comment(m.as_str()));

    Some(InboundMessage {
        module,
        channel,
        value,
        comment,
    })
}

fn clean_comment(text: &str) -> Option<String> {
    let text = text.trim();
    let text = text.strip_prefix('[').unwrap_or(text);
    let text = text.strip_suffix(']').unwrap_or(text).trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Sending module
    pub module: u8,
    /// Channel the value belongs to
    pub channel: u8,
    /// Untyped decimal token
    pub value: RawValue,
    /// Auxiliary text (identity name, status keywords)
    pub comment: Option<String>,
}

/// Decimal token exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue(String);

impl RawValue {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret as a floating point number.
    pub fn as_f64(&self) -> Result<f64, DecodeError> {
        self.0
            .parse::<f64>()
            .map_err(|_| DecodeError::new(format!("'{}' is not a number", self.0)))
    }

    /// Interpret as an integer. Integral decimals such as `3.0` are accepted.
    pub fn as_integer(&self) -> Result<i64, DecodeError> {
        if let Ok(v) = self.0.parse::<i64>() {
            return Ok(v);
        }
        let v = self.as_f64()?;
        if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
            Ok(v as i64)
        } else {
            Err(DecodeError::new(format!("'{}' is not an integer", self.0)))
        }
    }

    /// Interpret as a boolean (anything above 0.5 is on).
    pub fn as_flag(&self) -> Result<bool, DecodeError> {
        Ok(self.as_f64()? > 0.5)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value to be assigned to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Sent with 10 fractional digits
    Float(f64),
    /// Sent as a plain integer
    Integer(i64),
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Float(v) => write!(f, "{v:.10}"),
            WireValue::Integer(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        WireValue::Float(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        WireValue::Integer(value)
    }
}

impl From<u8> for WireValue {
    fn from(value: u8) -> Self {
        WireValue::Integer(i64::from(value))
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        WireValue::Integer(i64::from(value))
    }
}

/// Accumulates raw bytes and yields complete lines.
///
/// A line is complete once a CR or LF has been seen. Empty segments (the LF of
/// a CRLF pair, blank lines) are skipped. Whatever follows the last terminator
/// stays buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: BytesMut,
}

impl LineAssembler {
    /// Create an empty assembler with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(capacity),
        }
    }

    /// Append `data` and return every line it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line = self.pending.split_to(pos);
            self.pending.advance(1);
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// Bytes of the incomplete trailing fragment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop the incomplete trailing fragment.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
