//! Cluster boundary: the four pod operations remote execution needs.
//!
//! [`ClusterClient`] is the seam between lifecycle logic and the Kubernetes
//! API. The `kube` feature provides [`KubeCluster`]; tests substitute a fake.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(feature = "kube")]
mod kube_client;

#[cfg(feature = "kube")]
pub use kube_client::KubeCluster;

/// Label carrying the invocation id, used to select the pod in watches.
pub const INVOCATION_LABEL: &str = "podlet.dev/invocation";

/// Name of the single container in every worker pod.
pub const WORKER_CONTAINER: &str = "podlet-worker";

/// Errors from the cluster API, before they are attributed to a lifecycle stage.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0}")]
    Api(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("attach did not provide {0}")]
    MissingStream(&'static str),

    #[error("pod {0} not found")]
    NotFound(String),
}

impl ClusterError {
    pub fn api(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Api(Box::new(e))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Pod phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Observed through a watch Deleted event; never reported by the API as a phase.
    Deleted,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// The pod will never run the worker again (restartPolicy Never).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/// One watch notification for the worker pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub phase: PodPhase,
}

impl PodEvent {
    pub fn added(phase: PodPhase) -> Self {
        Self {
            kind: PodEventKind::Added,
            phase,
        }
    }

    pub fn modified(phase: PodPhase) -> Self {
        Self {
            kind: PodEventKind::Modified,
            phase,
        }
    }

    pub fn deleted() -> Self {
        Self {
            kind: PodEventKind::Deleted,
            phase: PodPhase::Deleted,
        }
    }
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClusterError>>;

/// Everything needed to create one worker pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPodSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub container_name: String,
    pub image: String,
    pub image_pull_policy: Option<String>,
    pub args: Vec<String>,
    pub secret_name: Option<String>,
}

impl WorkerPodSpec {
    /// Pod manifest as the Kubernetes API expects it.
    ///
    /// The container keeps stdin open so the caller can attach and write
    /// frames; it never restarts, so one pod serves exactly one invocation.
    pub fn manifest(&self) -> Value {
        let mut container = json!({
            "name": self.container_name,
            "image": self.image,
            "stdin": true,
        });
        if let Some(policy) = &self.image_pull_policy {
            container["imagePullPolicy"] = json!(policy);
        }
        if !self.args.is_empty() {
            container["args"] = json!(self.args);
        }
        if let Some(secret) = &self.secret_name {
            container["envFrom"] = json!([{ "secretRef": { "name": secret } }]);
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "labels": self.labels,
            },
            "spec": {
                "containers": [container],
                "restartPolicy": "Never",
            },
        })
    }
}

/// Which standard streams to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub container: Option<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            container: None,
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }
}

pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// The container's standard streams, as seen from the caller.
pub struct AttachedStreams {
    pub stdin: ChannelWriter,
    pub stdout: ChannelReader,
    /// Absent when the attach merged stderr into stdout (tty mode).
    pub stderr: Option<ChannelReader>,
    /// Keeps the underlying connection alive for as long as the streams are used.
    pub handle: Option<Box<dyn Send>>,
}

impl AttachedStreams {
    pub fn new(stdin: ChannelWriter, stdout: ChannelReader, stderr: Option<ChannelReader>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Send + 'static) -> Self {
        self.handle = Some(Box::new(handle));
        self
    }
}

impl fmt::Debug for AttachedStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedStreams")
            .field("stderr", &self.stderr.is_some())
            .field("handle", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_pod(&self, namespace: &str, spec: &WorkerPodSpec) -> Result<(), ClusterError>;

    /// Watch pods matching `label_selector`. The stream may end once the
    /// server-side `timeout` elapses.
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<PodEventStream, ClusterError>;

    async fn attach(
        &self,
        pod_name: &str,
        namespace: &str,
        options: &AttachOptions,
    ) -> Result<AttachedStreams, ClusterError>;

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), ClusterError>;
}
