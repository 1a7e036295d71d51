//! Line framing codec for the attach channel.
//!
//! Uses LinesCodec to reassemble lines from arbitrarily fragmented reads,
//! then assembles payload lines into base64-decoded frames.
//! Works over any AsyncRead/AsyncWrite (attach streams, pipes, duplex).

use std::io;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{END_OF_STREAM_MARKER, FRAME_TERMINATOR, Line, WireMessage};

/// Codec that frames payloads as base64 lines terminated by an empty line.
///
/// Consecutive payload lines are appended before decoding, so a terminal
/// that wraps long lines does not corrupt the payload.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
    pending: String,
    end_queued: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new(),
            pending: String::new(),
            end_queued: false,
        }
    }

    /// Number of payload characters accumulated for the frame in progress.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn on_line(&mut self, line: &str) -> io::Result<Option<WireMessage>> {
        match Line::classify(line) {
            Line::Payload(text) => {
                self.pending.push_str(text);
                Ok(None)
            }
            Line::Comment(text) => Ok(Some(WireMessage::Comment(text.to_string()))),
            Line::Blank => self.take_frame(),
            Line::EndOfStream => {
                if self.pending.is_empty() {
                    Ok(Some(WireMessage::EndOfStream))
                } else {
                    // Unterminated payload right before the marker still counts.
                    self.end_queued = true;
                    self.take_frame()
                }
            }
        }
    }

    fn take_frame(&mut self) -> io::Result<Option<WireMessage>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let text = std::mem::take(&mut self.pending);
        let bytes = STANDARD.decode(text.as_bytes()).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid base64 frame ({} chars): {}", text.len(), e),
            )
        })?;
        tracing::trace!(frame_size_bytes = bytes.len(), "Decoded frame");
        Ok(Some(WireMessage::Frame(bytes)))
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
    }
}

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.end_queued {
            self.end_queued = false;
            return Ok(Some(WireMessage::EndOfStream));
        }
        while let Some(line) = self.lines.decode(src).map_err(lines_error)? {
            if let Some(msg) = self.on_line(&line)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        // Last line without a trailing newline.
        if let Some(line) = self.lines.decode_eof(src).map_err(lines_error)?
            && let Some(msg) = self.on_line(&line)?
        {
            return Ok(Some(msg));
        }
        if self.end_queued {
            self.end_queued = false;
            return Ok(Some(WireMessage::EndOfStream));
        }
        self.take_frame()
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            WireMessage::Frame(bytes) => {
                // An empty payload would encode to a blank line, which reads back as nothing.
                if bytes.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cannot frame an empty payload",
                    ));
                }
                let text = STANDARD.encode(&bytes);
                tracing::trace!(frame_size_bytes = bytes.len(), encoded_len = text.len(), "Encoding frame");
                if text.len() > 1_000_000 {
                    tracing::info!(
                        encoded_len = text.len(),
                        encoded_kb = text.len() / 1024,
                        "Large frame being encoded"
                    );
                }
                dst.reserve(text.len() + FRAME_TERMINATOR.len());
                dst.extend_from_slice(text.as_bytes());
                dst.extend_from_slice(FRAME_TERMINATOR.as_bytes());
            }
            WireMessage::Comment(text) => {
                let flat = text.replace(['\r', '\n'], " ");
                dst.extend_from_slice(b"# ");
                dst.extend_from_slice(flat.as_bytes());
                dst.extend_from_slice(b"\n");
            }
            WireMessage::EndOfStream => {
                dst.extend_from_slice(END_OF_STREAM_MARKER.as_bytes());
                dst.extend_from_slice(b"\n");
            }
        }
        Ok(())
    }
}
