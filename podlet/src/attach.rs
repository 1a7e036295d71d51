//! Attach session: frame exchange over a running worker pod's standard streams.
//!
//! The caller writes exactly two frames (runnable descriptor, then input) to
//! stdin and reads result frames from stdout until the end marker. Anything
//! on stderr means the worker failed, and that error wins over any output
//! already buffered.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ExecutionMode, WireMessage};
use crate::cluster::{AttachOptions, ChannelReader, ChannelWriter, ClusterClient};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::lifecycle::WorkerPod;

/// Upper bound on collected error output.
const MAX_ERROR_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Result frames, still encoded as value bytes.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, RemoteError>>;

enum Inbound {
    Frame(Vec<u8>),
    End,
}

pub struct AttachSession {
    pod: String,
    writer: FramedWrite<ChannelWriter, FrameCodec>,
    reader: FramedRead<ChannelReader, FrameCodec>,
    errors: Option<ChannelReader>,
    settle: Duration,
    _handle: Option<Box<dyn Send>>,
}

impl AttachSession {
    pub async fn open(
        client: &dyn ClusterClient,
        pod: &WorkerPod,
        config: &RemoteConfig,
    ) -> Result<Self, RemoteError> {
        let options = AttachOptions {
            container: Some(config.container_name.clone()),
            tty: config.tty,
            ..AttachOptions::default()
        };
        tracing::debug!(pod = %pod.qualified_name(), tty = options.tty, "Attaching to worker pod");
        let streams = client
            .attach(&pod.name, &pod.namespace, &options)
            .await
            .map_err(|source| RemoteError::PodAttachFailed {
                pod: pod.qualified_name(),
                source,
            })?;

        Ok(Self {
            pod: pod.qualified_name(),
            writer: FramedWrite::new(streams.stdin, FrameCodec::new()),
            reader: FramedRead::new(streams.stdout, FrameCodec::new()),
            errors: streams.stderr,
            settle: config.poll_interval,
            _handle: streams.handle,
        })
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), RemoteError> {
        let size = payload.len();
        self.writer
            .send(WireMessage::Frame(payload))
            .await
            .map_err(|e| self.protocol_error(format!("failed to send frame: {e}")))?;
        tracing::debug!(pod = %self.pod, frame_size_bytes = size, "Sent frame");
        Ok(())
    }

    /// Result frames in `mode`.
    ///
    /// One-shot reads to the end marker and yields the first frame. Streaming
    /// yields each frame as it arrives. Both fail with `EmptyOutput` if no
    /// frame precedes the end of output.
    pub fn receive_frames(self, mode: ExecutionMode) -> FrameStream {
        stream::unfold(Some((self, 0usize)), move |state| async move {
            let Some((mut session, produced)) = state else {
                return None;
            };
            match mode {
                ExecutionMode::OneShot => Some((session.read_one_shot().await, None)),
                ExecutionMode::Streaming => match session.next_inbound().await {
                    Ok(Inbound::Frame(bytes)) => Some((Ok(bytes), Some((session, produced + 1)))),
                    Ok(Inbound::End) => match session.check_late_errors().await {
                        Err(e) => Some((Err(e), None)),
                        Ok(()) if produced == 0 => Some((Err(session.empty_output()), None)),
                        Ok(()) => {
                            session.close().await;
                            None
                        }
                    },
                    Err(e) => Some((Err(e), None)),
                },
            }
        })
        .boxed()
    }

    /// Close the stdin side of the channel.
    pub async fn close(mut self) {
        if let Err(error) = self.writer.close().await {
            tracing::debug!(pod = %self.pod, %error, "Closing attach channel failed");
        }
    }

    async fn read_one_shot(mut self) -> Result<Vec<u8>, RemoteError> {
        let mut first = None;
        loop {
            match self.next_inbound().await? {
                Inbound::Frame(bytes) if first.is_none() => first = Some(bytes),
                Inbound::Frame(bytes) => {
                    tracing::debug!(pod = %self.pod, frame_size_bytes = bytes.len(), "Ignoring extra frame in one-shot mode");
                }
                Inbound::End => break,
            }
        }
        self.check_late_errors().await?;
        let output = first.ok_or_else(|| self.empty_output())?;
        self.close().await;
        Ok(output)
    }

    /// Next frame or end of output, giving error output priority.
    async fn next_inbound(&mut self) -> Result<Inbound, RemoteError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let errors_open = self.errors.is_some();
            tokio::select! {
                biased;

                read = read_errors(&mut self.errors, &mut buf), if errors_open => match read {
                    Ok(0) => self.errors = None,
                    Ok(n) => return Err(self.worker_error(buf[..n].to_vec()).await),
                    Err(error) => {
                        tracing::debug!(pod = %self.pod, %error, "Error stream read failed");
                        self.errors = None;
                    }
                },

                msg = self.reader.next() => match msg {
                    Some(Ok(WireMessage::Frame(bytes))) => {
                        tracing::trace!(pod = %self.pod, frame_size_bytes = bytes.len(), "Received frame");
                        return Ok(Inbound::Frame(bytes));
                    }
                    Some(Ok(WireMessage::Comment(text))) => {
                        tracing::debug!(target: "podlet::worker", pod = %self.pod, "{}", text);
                    }
                    Some(Ok(WireMessage::EndOfStream)) | None => return Ok(Inbound::End),
                    Some(Err(e)) => return Err(self.protocol_error(e.to_string())),
                },
            }
        }
    }

    /// Give the error stream one settle window after output ends.
    async fn check_late_errors(&mut self) -> Result<(), RemoteError> {
        let Some(errors) = self.errors.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(self.settle, errors.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => Err(self.worker_error(buf[..n].to_vec()).await),
            _ => Ok(()),
        }
    }

    /// Collect the rest of the error output, bounded by the settle window.
    async fn worker_error(&mut self, mut collected: Vec<u8>) -> RemoteError {
        if let Some(errors) = self.errors.as_mut() {
            let mut buf = [0u8; READ_CHUNK];
            while collected.len() < MAX_ERROR_BYTES {
                match tokio::time::timeout(self.settle, errors.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
                    _ => break,
                }
            }
        }
        collected.truncate(MAX_ERROR_BYTES);
        let message = String::from_utf8_lossy(&collected).trim().to_string();
        tracing::debug!(pod = %self.pod, %message, "Worker reported an error");
        RemoteError::WorkerError { message }
    }

    fn empty_output(&self) -> RemoteError {
        RemoteError::EmptyOutput {
            pod: self.pod.clone(),
        }
    }

    fn protocol_error(&self, message: String) -> RemoteError {
        RemoteError::Protocol {
            pod: self.pod.clone(),
            message,
        }
    }
}

async fn read_errors(errors: &mut Option<ChannelReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match errors {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
