//! Wire bridge between the caller and the worker pod.
//!
//! The only channel into a worker pod is the attach stream (the container's
//! stdin/stdout/stderr), so the caller and the worker speak a small line
//! protocol on top of it.
//!
//! # Architecture
//!
//! - **protocol**: line classification, wire messages, execution mode
//! - **codec**: base64 line framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
