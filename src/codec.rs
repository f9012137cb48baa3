use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{Frame, FrameError};
use crate::parser::{Parsed, escape_header_value, parse_frame_slice, unescape_header_value};

/// Errors produced while decoding or encoding frames.
///
/// Any decode error leaves the stream without a reliable frame boundary; the
/// transport is expected to close the connection.
#[derive(Error, Debug)]
pub enum CodecError {
    /// I/O-level error from the underlying transport
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Malformed wire data
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed framing around a structurally invalid frame
    #[error("invalid frame: {0}")]
    Invalid(#[from] FrameError),
    /// Buffered data grew past the configured limit
    #[error("frame exceeds maximum size of {0} bytes")]
    TooLarge(usize),
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Responsibilities:
/// - Decode incoming bytes into a `Frame`; a bare LF decodes as the
///   heartbeat frame.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Encode frames back into bytes, headers in the frame's own order.
#[derive(Debug, Clone, Default)]
pub struct StompCodec {
    max_frame_size: Option<usize>,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames (and partial buffers) larger than `max` bytes.
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            max_frame_size: Some(max),
        }
    }
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String, CodecError> {
    String::from_utf8(bytes)
        .map_err(|e| CodecError::Malformed(format!("invalid utf8 in {}: {}", what, e)))
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = CodecError;

    /// Decode bytes from `src` into a `Frame`.
    ///
    /// Returns
    /// - `Ok(Some(Frame))` when a full frame (or heartbeat) was decoded and
    ///   exactly its bytes were consumed from `src`.
    /// - `Ok(None)` when more bytes are required; `src` is left untouched.
    /// - `Err(CodecError)` on protocol or data errors.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (parsed, consumed) = match parse_frame_slice(src.chunk()).map_err(CodecError::Malformed)? {
            Some(v) => v,
            None => {
                if let Some(max) = self.max_frame_size.filter(|max| src.len() > *max) {
                    return Err(CodecError::TooLarge(max));
                }
                return Ok(None);
            }
        };
        if let Some(max) = self.max_frame_size.filter(|max| consumed > *max) {
            return Err(CodecError::TooLarge(max));
        }
        src.advance(consumed);

        let raw = match parsed {
            Parsed::Heartbeat => return Ok(Some(Frame::heartbeat())),
            Parsed::Frame(raw) => raw,
        };

        let command: Command = utf8(raw.command, "command")?
            .parse()
            .map_err(|e| CodecError::Malformed(format!("{}", e)))?;
        let escaped = command.escapes_headers();

        let mut builder = Frame::builder(command);
        for (k, v) in raw.headers {
            let (k, v) = if escaped {
                let k = unescape_header_value(&k)
                    .map_err(|e| CodecError::Malformed(format!("header name: {}", e)))?;
                let v = unescape_header_value(&v)
                    .map_err(|e| CodecError::Malformed(format!("header value: {}", e)))?;
                (k, v)
            } else {
                (k, v)
            };
            builder = builder.header(utf8(k, "header name")?, utf8(v, "header value")?);
        }
        if let Some(body) = raw.body {
            builder = builder.body(body);
        }
        Ok(Some(builder.build()?))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst);
        Ok(())
    }
}

fn encode_into(frame: &Frame, dst: &mut BytesMut) {
    let command = match frame.command() {
        Some(c) => c,
        None => {
            dst.put_u8(b'\n');
            return;
        }
    };
    dst.extend_from_slice(command.as_str().as_bytes());
    dst.put_u8(b'\n');

    for (k, v) in frame.headers().wire_iter() {
        if command.escapes_headers() {
            dst.extend_from_slice(escape_header_value(k).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape_header_value(&v).as_bytes());
        } else {
            dst.extend_from_slice(k.as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(v.as_bytes());
        }
        dst.put_u8(b'\n');
    }

    dst.put_u8(b'\n');
    if let Some(body) = frame.body() {
        dst.extend_from_slice(body);
    }
    dst.put_u8(0);
}

/// Serialize one frame to its wire bytes.
pub fn encode(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::new();
    encode_into(frame, &mut dst);
    dst.freeze()
}

/// Decode one frame from the front of `src`, advancing past exactly that
/// frame. Suitable for running repeatedly over a shared growable buffer.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    StompCodec::new().decode(src)
}
