//! Frames and the line-delimited frame codec
//!
//! Format: one `key: <json>` line per field, blank line terminates the frame.
//! JSON encoding keeps every value on a single line (newlines inside strings
//! are escaped), so a frame never contains an empty line before its end.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on the encoded size of a single frame (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Field naming the message type
pub const COMMAND_FIELD: &str = "command";

/// A flat field map exchanged between peers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    fields: BTreeMap<String, Value>,
}

impl Frame {
    /// Create a frame carrying only a command name
    pub fn new(command: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(COMMAND_FIELD.to_string(), Value::from(command));
        Self { fields }
    }

    /// Add a field, builder style
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Command name, if present
    pub fn command(&self) -> Option<&str> {
        self.fields.get(COMMAND_FIELD).and_then(Value::as_str)
    }

    /// Raw field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer field
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// All fields in key order
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the frame has no fields at all
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse the body of one frame (without the terminating blank line)
    fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| ProtocolError::malformed(format!("frame is not UTF-8: {}", e)))?;

        let mut fields = BTreeMap::new();
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, raw) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::malformed(format!("line without ':': {}", line)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ProtocolError::malformed("empty field name"));
            }
            let value: Value = serde_json::from_str(raw.trim())?;
            if fields.insert(key.to_string(), value).is_some() {
                return Err(ProtocolError::malformed(format!("duplicate field '{}'", key)));
            }
        }

        Ok(Self { fields })
    }

    /// Serialize into the wire layout, including the terminator
    fn write_into(&self, dst: &mut BytesMut) -> Result<()> {
        for (key, value) in &self.fields {
            if key.is_empty() || key.contains(|c| c == ':' || c == '\n' || c == '\r') {
                return Err(ProtocolError::malformed(format!("invalid field name {:?}", key)));
            }
            let encoded = serde_json::to_string(value)?;
            dst.reserve(key.len() + encoded.len() + 3);
            dst.put_slice(key.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(encoded.as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Codec turning a byte stream into [`Frame`]s and back
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    // Where the terminator search resumes; bytes before it were scanned
    // already and hold no terminator.
    next_index: usize,
}

impl FrameCodec {
    /// Create a codec with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            next_index: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }
}

/// Longest terminator prefix that can straddle two reads (`\n\r`)
const TERMINATOR_OVERLAP: usize = 2;

/// Locate the blank line ending the first frame, scanning from `start`.
///
/// Returns `(body_len, consumed)`: the frame body spans `..body_len` and the
/// frame including its terminator spans `..consumed`.
fn find_terminator(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut i = start;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let rest = &buf[i + 1..];
            if rest.starts_with(b"\n") {
                return Some((i + 1, i + 2));
            }
            if rest.starts_with(b"\r\n") {
                return Some((i + 1, i + 3));
            }
        }
        i += 1;
    }
    None
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Stray blank lines between frames carry no fields
        while self.next_index == 0 {
            if src.starts_with(b"\n") {
                src.advance(1);
            } else if src.starts_with(b"\r\n") {
                src.advance(2);
            } else {
                break;
            }
        }

        let Some((body_len, consumed)) = find_terminator(src, self.next_index) else {
            if src.len() > self.max_frame_size {
                self.next_index = 0;
                return Err(ProtocolError::FrameTooLarge(src.len()));
            }
            self.next_index = src.len().saturating_sub(TERMINATOR_OVERLAP);
            return Ok(None);
        };
        self.next_index = 0;

        if consumed > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(consumed));
        }

        let raw = src.split_to(consumed);
        Frame::parse(&raw[..body_len]).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        if let Err(e) = frame.write_into(dst) {
            dst.truncate(start);
            return Err(e);
        }
        let written = dst.len() - start;
        if written > self.max_frame_size {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge(written));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(Frame::new("pull_request").with("position", 42u64));
        assert_eq!(&buf[..], b"command: \"pull_request\"\nposition: 42\n\n");
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"command: \"wait\"\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command(), Some("wait"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_is_not_rescanned() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"command: \"wait\"\n");
        for _ in 0..64 {
            buf.extend_from_slice(b"pad: \"xxxxxxxxxxxxxxxx\"\n");
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert_eq!(codec.next_index, buf.len() - TERMINATOR_OVERLAP);
        }

        buf.extend_from_slice(b"\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command(), Some("wait"));
        assert_eq!(codec.next_index, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::default();
        let mut buf = encode(Frame::new("wait"));
        buf.extend_from_slice(&encode(Frame::new("position").with("value", 7u64)));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command(), Some("wait"));
        assert_eq!(second.get_u64("value"), Some(7));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_multiline_string_stays_on_one_line() {
        let frame = Frame::new("ident_fail").with("reason", "line one\n\nline two");
        let mut buf = encode(frame.clone());
        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"command: \"wait\"\r\n\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command(), Some("wait"));
    }

    #[test]
    fn test_malformed_line_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"no separator here\n\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"a: 1\na: 2\n\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut buf = BytesMut::from(&b"command: \"a very long command name\"\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_invalid_field_name_rejected_on_encode() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new("wait").with("bad:key", 1u64);
        assert!(codec.encode(frame, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
