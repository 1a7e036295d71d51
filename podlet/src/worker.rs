//! Worker side of the attach protocol.
//!
//! Runs inside the pod: reads the runnable descriptor frame and the input
//! frame from stdin, executes, and writes result frames followed by the end
//! marker to stdout. Progress and log lines go out as comments. On failure a
//! single error line goes to stderr and nothing more is written to stdout.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ExecutionMode, WireMessage};
use crate::error::{RunnableError, SerializationError};
use crate::runnable::{GraphLoader, RunnableDescriptor};
use crate::value::{decode_value, encode_value};
use crate::worker_tracing_layer::LogSink;

type SharedWriter<W> = Arc<Mutex<FramedWrite<W, FrameCodec>>>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerFailure {
    #[error("input ended before the {0} frame")]
    MissingFrame(&'static str),

    #[error("failed to read the {what} frame: {source}")]
    Read {
        what: &'static str,
        source: io::Error,
    },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Runnable(#[from] RunnableError),

    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub mode: ExecutionMode,
    /// Connected to the output for the duration of the run, so tracing
    /// events are forwarded as comments.
    pub log_sink: Option<LogSink>,
}

impl WorkerConfig {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            log_sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }
}

/// Serve one invocation.
///
/// The error, if any, has already been written to `errors` when this returns.
pub async fn run_worker<L, R, W, E>(
    loader: &L,
    config: WorkerConfig,
    input: R,
    output: W,
    mut errors: E,
) -> Result<(), WorkerFailure>
where
    L: GraphLoader + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Unpin,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(FramedWrite::new(output, FrameCodec::new())));

    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
    if let Some(sink) = &config.log_sink {
        sink.connect(log_tx.clone());
    }
    drop(log_tx);

    let writer_for_logs = Arc::clone(&writer);
    let log_forwarder = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            let mut w = writer_for_logs.lock().await;
            if w.send(WireMessage::Comment(line)).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(target: "podlet::worker", mode = %config.mode, version = crate::PODLET_VERSION, "Worker started");
    let result = execute(loader, config.mode, input, &writer).await;

    if let Some(sink) = &config.log_sink {
        sink.disconnect();
    }
    let _ = log_forwarder.await;

    let result = match result {
        Ok(()) => finish(&writer).await,
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        let line = format!("{e}\n");
        errors.write_all(line.as_bytes()).await?;
        errors.flush().await?;
    }
    result
}

async fn execute<L, R, W>(
    loader: &L,
    mode: ExecutionMode,
    input: R,
    writer: &SharedWriter<W>,
) -> Result<(), WorkerFailure>
where
    L: GraphLoader + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, FrameCodec::new());

    let descriptor = read_frame(&mut reader, "runnable").await?;
    comment(writer, format!("received runnable ({} bytes)", descriptor.len())).await?;
    let payload = read_frame(&mut reader, "input").await?;
    comment(writer, format!("received input ({} bytes)", payload.len())).await?;

    let runnable = loader.load(&RunnableDescriptor::from_bytes(descriptor)?)?;
    let value = decode_value(&payload)?;
    comment(writer, format!("running {} ({mode})", runnable.name())).await?;

    match mode {
        ExecutionMode::OneShot => {
            let result = runnable.invoke(value).await?;
            send(writer, WireMessage::Frame(encode_value(&result)?)).await?;
        }
        ExecutionMode::Streaming => {
            let mut results = runnable.stream(value);
            let mut count = 0usize;
            while let Some(item) = results.next().await {
                send(writer, WireMessage::Frame(encode_value(&item?)?)).await?;
                count += 1;
            }
            comment(writer, format!("streamed {count} results")).await?;
        }
    }
    Ok(())
}

async fn finish<W: AsyncWrite + Unpin>(writer: &SharedWriter<W>) -> Result<(), WorkerFailure> {
    send(writer, WireMessage::EndOfStream).await
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut FramedRead<R, FrameCodec>,
    what: &'static str,
) -> Result<Vec<u8>, WorkerFailure> {
    loop {
        match reader.next().await {
            Some(Ok(WireMessage::Frame(bytes))) => return Ok(bytes),
            Some(Ok(WireMessage::Comment(_))) => {}
            Some(Ok(WireMessage::EndOfStream)) | None => return Err(WorkerFailure::MissingFrame(what)),
            Some(Err(source)) => return Err(WorkerFailure::Read { what, source }),
        }
    }
}

async fn comment<W: AsyncWrite + Unpin>(
    writer: &SharedWriter<W>,
    text: String,
) -> Result<(), WorkerFailure> {
    send(writer, WireMessage::Comment(text)).await
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &SharedWriter<W>,
    msg: WireMessage,
) -> Result<(), WorkerFailure> {
    writer.lock().await.send(msg).await?;
    Ok(())
}
