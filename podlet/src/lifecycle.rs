//! Worker pod lifecycle: create, wait for Running, delete.
//!
//! Every invocation gets a fresh pod named after a random id and labelled
//! with it, so concurrent invocations never share a pod or see each other's
//! watch events.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bridge::protocol::ExecutionMode;
use crate::cluster::{
    ClusterClient, ClusterError, INVOCATION_LABEL, PodEventKind, PodPhase, WorkerPodSpec,
};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Pod name prefix; the invocation id completes it.
pub const POD_NAME_PREFIX: &str = "podlet-worker-";

/// A worker pod created for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPod {
    /// Invocation id; names and labels the pod.
    pub uid: Uuid,
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub mode: ExecutionMode,
    pub phase: PodPhase,
}

impl WorkerPod {
    pub fn label_selector(&self) -> String {
        format!("{INVOCATION_LABEL}={}", self.uid)
    }

    pub fn is_streaming(&self) -> bool {
        self.mode.is_streaming()
    }

    /// `namespace/name`, used in errors and logs.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Creates, awaits and deletes worker pods.
pub struct PodManager {
    client: Arc<dyn ClusterClient>,
    config: Arc<RemoteConfig>,
}

impl PodManager {
    pub fn new(client: Arc<dyn ClusterClient>, config: RemoteConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    pub fn pod_spec(&self, uid: Uuid, mode: ExecutionMode) -> WorkerPodSpec {
        WorkerPodSpec {
            name: format!("{POD_NAME_PREFIX}{uid}"),
            labels: BTreeMap::from([(INVOCATION_LABEL.to_string(), uid.to_string())]),
            container_name: self.config.container_name.clone(),
            image: self.config.image.clone(),
            image_pull_policy: self.config.image_pull_policy.clone(),
            args: mode.worker_args(),
            secret_name: self.config.secret_name.clone(),
        }
    }

    /// Name and describe a new pod without contacting the cluster, so the
    /// caller can guard it before the create request is sent.
    pub fn prepare(&self, mode: ExecutionMode) -> WorkerPod {
        let uid = Uuid::new_v4();
        WorkerPod {
            uid,
            name: format!("{POD_NAME_PREFIX}{uid}"),
            namespace: self.config.namespace.clone(),
            image: self.config.image.clone(),
            mode,
            phase: PodPhase::Pending,
        }
    }

    pub async fn create(&self, pod: &WorkerPod) -> Result<(), RemoteError> {
        let spec = self.pod_spec(pod.uid, pod.mode);
        tracing::info!(pod = %pod.qualified_name(), image = %spec.image, mode = %pod.mode, "Creating worker pod");
        self.client
            .create_pod(&pod.namespace, &spec)
            .await
            .map_err(|source| RemoteError::PodCreateFailed {
                pod: pod.qualified_name(),
                source,
            })
    }

    /// Wait until the pod reports Running.
    ///
    /// A Deleted event fails immediately whatever phase it carries. A watch
    /// the server closes is reopened; only `start_timeout` ends the wait.
    pub async fn await_running(&self, mut pod: WorkerPod) -> Result<WorkerPod, RemoteError> {
        let timeout = self.config.start_timeout;
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.watch_until_running(&pod, deadline)).await {
            Ok(Ok(phase)) => {
                pod.phase = phase;
                tracing::info!(pod = %pod.qualified_name(), "Worker pod running");
                Ok(pod)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RemoteError::PodStartTimeout {
                pod: pod.qualified_name(),
                timeout,
            }),
        }
    }

    async fn watch_until_running(
        &self,
        pod: &WorkerPod,
        deadline: Instant,
    ) -> Result<PodPhase, RemoteError> {
        let watch_failed = |source: ClusterError| RemoteError::PodWatchFailed {
            pod: pod.qualified_name(),
            source,
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut events = self
                .client
                .watch_pods(&pod.namespace, &pod.label_selector(), remaining)
                .await
                .map_err(watch_failed)?;

            while let Some(event) = events.next().await {
                let event = event.map_err(watch_failed)?;
                tracing::debug!(pod = %pod.qualified_name(), kind = ?event.kind, phase = %event.phase, "Pod event");
                if event.kind == PodEventKind::Deleted || event.phase == PodPhase::Deleted {
                    return Err(RemoteError::PodDeletedBeforeStart {
                        pod: pod.qualified_name(),
                    });
                }
                match event.phase {
                    PodPhase::Running => return Ok(PodPhase::Running),
                    phase if phase.is_terminal() => {
                        return Err(RemoteError::PodExitedBeforeStart {
                            pod: pod.qualified_name(),
                            phase,
                        });
                    }
                    _ => {}
                }
            }

            tracing::debug!(pod = %pod.qualified_name(), ?remaining, "Pod watch closed, reopening");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Delete `pod`. A pod that is already gone counts as deleted.
    pub async fn delete(&self, pod: &WorkerPod) -> Result<(), RemoteError> {
        tracing::info!(pod = %pod.qualified_name(), "Deleting worker pod");
        match self.client.delete_pod(&pod.name, &pod.namespace).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(pod = %pod.qualified_name(), "Worker pod already gone");
                Ok(())
            }
            Err(source) => Err(RemoteError::PodDeleteFailed {
                pod: pod.qualified_name(),
                source,
            }),
        }
    }

    /// Guard that deletes `pod` if the invocation is abandoned.
    pub fn guard(&self, pod: WorkerPod) -> PodGuard {
        PodGuard {
            client: Arc::clone(&self.client),
            pod: Some(pod),
            delete_on_drop: self.config.delete_pod,
        }
    }
}

/// Deletes its pod when dropped unless disarmed.
///
/// Covers futures cancelled mid-invocation and streams dropped before they
/// are exhausted. Deletion is spawned onto the current runtime and is best
/// effort: failures are only logged.
pub struct PodGuard {
    client: Arc<dyn ClusterClient>,
    pod: Option<WorkerPod>,
    delete_on_drop: bool,
}

impl PodGuard {
    pub fn pod(&self) -> Option<&WorkerPod> {
        self.pod.as_ref()
    }

    /// Take the pod out of the guard; dropping the guard then does nothing.
    pub fn disarm(&mut self) -> Option<WorkerPod> {
        self.pod.take()
    }
}

impl Drop for PodGuard {
    fn drop(&mut self) {
        let Some(pod) = self.pod.take() else {
            return;
        };
        if !self.delete_on_drop {
            tracing::info!(pod = %pod.qualified_name(), "Invocation abandoned, keeping worker pod");
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(pod = %pod.qualified_name(), "No runtime to delete abandoned worker pod");
            return;
        };
        let client = Arc::clone(&self.client);
        tracing::info!(pod = %pod.qualified_name(), "Invocation abandoned, deleting worker pod");
        handle.spawn(async move {
            match client.delete_pod(&pod.name, &pod.namespace).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    tracing::debug!(pod = %pod.qualified_name(), "Abandoned worker pod already gone");
                }
                Err(error) => {
                    tracing::warn!(pod = %pod.qualified_name(), %error, "Failed to delete abandoned worker pod");
                }
            }
        });
    }
}
