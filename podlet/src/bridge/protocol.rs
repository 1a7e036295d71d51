//! Wire protocol types for caller-worker communication.
//!
//! Every message is a UTF-8 line:
//! - **payload**: base64 text with no embedded newlines
//! - **frame terminator**: an empty line, completing the payload accumulated so far
//! - **comment**: a line starting with `#`, never part of a payload
//! - **end of stream**: the literal line `***`, after which no frame follows

use serde::{Deserialize, Serialize};

/// Literal line that ends the output stream.
pub const END_OF_STREAM_MARKER: &str = "***";

/// Prefix of comment lines.
pub const COMMENT_PREFIX: char = '#';

/// Written after every payload: ends the payload line and adds the empty terminator line.
pub const FRAME_TERMINATOR: &str = "\n\n";

/// Worker argument that switches it to streaming mode.
pub const STREAM_FLAG: &str = "--stream";

/// Messages carried by the attach channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A complete frame (payload already base64-decoded).
    Frame(Vec<u8>),

    /// Human-readable progress or log line from the other side.
    Comment(String),

    EndOfStream,
}

/// A single line as seen on the wire, before frame assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    Payload(&'a str),
    Comment(&'a str),
    Blank,
    EndOfStream,
}

impl<'a> Line<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            Line::Blank
        } else if let Some(text) = trimmed.strip_prefix(COMMENT_PREFIX) {
            Line::Comment(text.trim_start())
        } else if trimmed == END_OF_STREAM_MARKER {
            Line::EndOfStream
        } else {
            Line::Payload(trimmed.trim_start())
        }
    }
}

/// How many results a worker produces for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One result frame, then the end marker.
    #[default]
    OneShot,
    /// One frame per incremental result, then the end marker.
    Streaming,
}

impl ExecutionMode {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneShot => "one_shot",
            Self::Streaming => "streaming",
        }
    }

    /// Container arguments that select this mode in the worker.
    pub fn worker_args(&self) -> Vec<String> {
        match self {
            Self::OneShot => Vec::new(),
            Self::Streaming => vec![STREAM_FLAG.to_string()],
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
