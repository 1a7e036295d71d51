//! Remote runnable facade.
//!
//! [`RemoteRunnable`] wraps a serializable runnable and executes each
//! invocation in a fresh worker pod, presenting the same `invoke`/`stream`
//! contract as a local runnable so it composes into sequences.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use crate::attach::{AttachSession, FrameStream};
use crate::bridge::protocol::ExecutionMode;
use crate::cluster::ClusterClient;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, RunnableError};
use crate::invocation::{Invocation, InvocationOutcome, InvocationState};
use crate::lifecycle::{PodGuard, PodManager, WorkerPod};
use crate::runnable::{Runnable, RunnableDescriptor, Serializable, ValueStream};
use crate::value::{decode_value, encode_value};

pub struct RemoteRunnable<R> {
    runnable: R,
    manager: Arc<PodManager>,
}

enum StreamState {
    Start(Value),
    Receiving(Receiving),
    Done,
}

struct Receiving {
    frames: FrameStream,
    guard: PodGuard,
    invocation: Invocation,
    deadline: Option<Instant>,
}

impl<R: Serializable> RemoteRunnable<R> {
    pub fn new(runnable: R, client: Arc<dyn ClusterClient>, config: RemoteConfig) -> Self {
        Self {
            runnable,
            manager: Arc::new(PodManager::new(client, config)),
        }
    }

    pub fn inner(&self) -> &R {
        &self.runnable
    }

    pub fn config(&self) -> &RemoteConfig {
        self.manager.config()
    }

    /// A facade for `runnable` sharing this one's cluster client and config.
    pub fn bind<S: Serializable>(&self, runnable: S) -> RemoteRunnable<S> {
        RemoteRunnable {
            runnable,
            manager: Arc::clone(&self.manager),
        }
    }

    /// One-shot invocation with its bookkeeping.
    ///
    /// A pod that could not be deleted after the result arrived does not fail
    /// the invocation; the error is reported in `deletion_error`.
    pub async fn invoke_with_outcome(&self, input: Value) -> Result<InvocationOutcome, RemoteError> {
        let result = self.with_deadline(self.run_once(input)).await;
        if let Err(RemoteError::InvocationTimeout(limit)) = &result {
            tracing::warn!(runnable = %self.runnable.name(), ?limit, "Remote invocation timed out");
        }
        result
    }

    async fn run_once(&self, input: Value) -> Result<InvocationOutcome, RemoteError> {
        let mut invocation = Invocation::new(ExecutionMode::OneShot);
        let (session, mut guard) = match self.start(&mut invocation, &input, ExecutionMode::OneShot).await {
            Ok(started) => started,
            Err(e) => return Err(invocation.fail(e)),
        };

        invocation.advance(InvocationState::Receiving);
        let mut frames = session.receive_frames(ExecutionMode::OneShot);
        let received = match frames.next().await {
            Some(Ok(bytes)) => decode_value(&bytes).map_err(RemoteError::from),
            Some(Err(e)) => Err(e),
            None => Err(RemoteError::EmptyOutput {
                pod: invocation.pod_name().unwrap_or_default().to_string(),
            }),
        };
        drop(frames);

        let output = match received {
            Ok(output) => output,
            Err(e) => {
                self.discard(&mut guard).await;
                return Err(invocation.fail(e));
            }
        };

        invocation.advance(InvocationState::Deleting);
        let deletion_error = self.release(&mut guard).await;
        invocation.advance(InvocationState::Done);
        tracing::info!(invocation = %invocation.id(), pod = ?invocation.pod_name(), "Remote invocation complete");
        Ok(invocation.outcome(output, deletion_error))
    }

    /// Create the pod and hand over the request. On failure the pod is
    /// already cleaned up.
    async fn start(
        &self,
        invocation: &mut Invocation,
        input: &Value,
        mode: ExecutionMode,
    ) -> Result<(AttachSession, PodGuard), RemoteError> {
        // Serialize before creating anything, so a bad runnable costs no pod.
        let descriptor = self.runnable.descriptor()?;
        let payload = encode_value(input)?;

        invocation.advance(InvocationState::PodCreating);
        let pod = self.manager.prepare(mode);
        invocation.set_pod_name(pod.name.clone());
        // Armed before the request goes out: the server may accept the pod
        // even if this future is dropped or the response is an error.
        let mut guard = self.manager.guard(pod.clone());
        if let Err(e) = self.manager.create(&pod).await {
            self.discard(&mut guard).await;
            return Err(e);
        }

        match self.connect(invocation, pod, descriptor, payload).await {
            Ok(session) => Ok((session, guard)),
            Err(e) => {
                self.discard(&mut guard).await;
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        invocation: &mut Invocation,
        pod: WorkerPod,
        descriptor: RunnableDescriptor,
        payload: Vec<u8>,
    ) -> Result<AttachSession, RemoteError> {
        invocation.advance(InvocationState::PodStarting);
        let pod = self.manager.await_running(pod).await?;

        invocation.advance(InvocationState::Attaching);
        let mut session = AttachSession::open(self.manager.client(), &pod, self.manager.config()).await?;

        invocation.advance(InvocationState::Sending);
        session.send_frame(descriptor.into_bytes()).await?;
        session.send_frame(payload).await?;
        Ok(session)
    }

    async fn next_result(&self, receiving: Receiving) -> Option<(Result<Value, RunnableError>, StreamState)> {
        let Receiving {
            mut frames,
            mut guard,
            mut invocation,
            deadline,
        } = receiving;

        let next = self.until(deadline, async { Ok(frames.next().await) }).await;
        let failure = match next {
            Ok(Some(Ok(bytes))) => match decode_value(&bytes) {
                Ok(value) => {
                    let receiving = Receiving {
                        frames,
                        guard,
                        invocation,
                        deadline,
                    };
                    return Some((Ok(value), StreamState::Receiving(receiving)));
                }
                Err(e) => RemoteError::from(e),
            },
            Ok(Some(Err(e))) | Err(e) => e,
            Ok(None) => {
                drop(frames);
                invocation.advance(InvocationState::Deleting);
                // Results were already delivered; a failed delete is only reported.
                let _ = self.release(&mut guard).await;
                invocation.advance(InvocationState::Done);
                tracing::info!(invocation = %invocation.id(), pod = ?invocation.pod_name(), "Remote stream complete");
                return None;
            }
        };

        drop(frames);
        self.discard(&mut guard).await;
        Some((Err(invocation.fail(failure).into()), StreamState::Done))
    }

    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        self.until(self.deadline(), fut).await
    }

    /// When an invocation starting now must have finished.
    fn deadline(&self) -> Option<Instant> {
        self.manager
            .config()
            .invocation_timeout
            .map(|limit| Instant::now() + limit)
    }

    async fn until<T>(
        &self,
        deadline: Option<Instant>,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match (deadline, self.manager.config().invocation_timeout) {
            (Some(deadline), Some(limit)) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| RemoteError::InvocationTimeout(limit))?,
            _ => fut.await,
        }
    }

    /// Delete after success. Returns the deletion error instead of failing.
    async fn release(&self, guard: &mut PodGuard) -> Option<RemoteError> {
        let pod = guard.disarm()?;
        if !self.manager.config().delete_pod {
            tracing::info!(pod = %pod.qualified_name(), "Keeping worker pod");
            return None;
        }
        match self.manager.delete(&pod).await {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(%error, "Result delivered but worker pod was not deleted");
                Some(error)
            }
        }
    }

    /// Delete after failure. The original failure is what the caller sees.
    async fn discard(&self, guard: &mut PodGuard) {
        let Some(pod) = guard.disarm() else {
            return;
        };
        if !self.manager.config().delete_pod {
            tracing::info!(pod = %pod.qualified_name(), "Keeping failed worker pod for inspection");
            return;
        }
        if let Err(error) = self.manager.delete(&pod).await {
            tracing::warn!(%error, "Failed to delete worker pod after failure");
        }
    }
}

#[async_trait]
impl<R: Serializable> Runnable for RemoteRunnable<R> {
    fn name(&self) -> String {
        format!("Remote<{}>", self.runnable.name())
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        Ok(self.invoke_with_outcome(input).await?.output)
    }

    /// Results as the worker produces them. The pod is deleted once the
    /// stream is exhausted, or in the background if it is dropped early.
    /// `invocation_timeout` bounds the whole stream, not each result.
    fn stream(&self, input: Value) -> ValueStream<'_> {
        stream::unfold(StreamState::Start(input), move |state| async move {
            match state {
                StreamState::Start(input) => {
                    let mut invocation = Invocation::new(ExecutionMode::Streaming);
                    let deadline = self.deadline();
                    let started = self
                        .until(deadline, self.start(&mut invocation, &input, ExecutionMode::Streaming))
                        .await;
                    match started {
                        Ok((session, guard)) => {
                            invocation.advance(InvocationState::Receiving);
                            let receiving = Receiving {
                                frames: session.receive_frames(ExecutionMode::Streaming),
                                guard,
                                invocation,
                                deadline,
                            };
                            self.next_result(receiving).await
                        }
                        Err(e) => Some((Err(invocation.fail(e).into()), StreamState::Done)),
                    }
                }
                StreamState::Receiving(receiving) => self.next_result(receiving).await,
                StreamState::Done => None,
            }
        })
        .boxed()
    }
}
