//! [`ClusterClient`] backed by the Kubernetes API.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, PostParams, WatchEvent, WatchParams};

use super::{
    AttachOptions, AttachedStreams, ChannelReader, ClusterClient, ClusterError, PodEvent,
    PodEventStream, PodPhase, WorkerPodSpec,
};

/// Server-side watch timeouts must stay below 295 seconds. Longer waits
/// reopen the watch.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the local kubeconfig, or the in-cluster service account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(ClusterError::api)?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn phase_of(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_pod(&self, namespace: &str, spec: &WorkerPodSpec) -> Result<(), ClusterError> {
        let pod: Pod = serde_json::from_value(spec.manifest()).map_err(ClusterError::api)?;
        self.pods(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(ClusterError::api)?;
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<PodEventStream, ClusterError> {
        let secs = timeout.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32;
        let params = WatchParams::default().labels(label_selector).timeout(secs);
        let events = self
            .pods(namespace)
            .watch(&params, "0")
            .await
            .map_err(ClusterError::api)?;

        let events = events.filter_map(|event| async move {
            match event {
                Ok(WatchEvent::Added(pod)) => Some(Ok(PodEvent::added(phase_of(&pod)))),
                Ok(WatchEvent::Modified(pod)) => Some(Ok(PodEvent::modified(phase_of(&pod)))),
                Ok(WatchEvent::Deleted(_)) => Some(Ok(PodEvent::deleted())),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(e)) => Some(Err(ClusterError::Watch(e.message))),
                Err(e) => Some(Err(ClusterError::api(e))),
            }
        });
        Ok(events.boxed())
    }

    async fn attach(
        &self,
        pod_name: &str,
        namespace: &str,
        options: &AttachOptions,
    ) -> Result<AttachedStreams, ClusterError> {
        // The API server rejects tty together with a separate stderr stream.
        let stderr = options.stderr && !options.tty;
        if options.stderr && !stderr {
            tracing::debug!(pod = %pod_name, "tty attach merges stderr into stdout");
        }

        let mut params = AttachParams::default()
            .stdin(options.stdin)
            .stdout(options.stdout)
            .stderr(stderr)
            .tty(options.tty);
        if let Some(container) = &options.container {
            params = params.container(container.clone());
        }

        let mut process = self
            .pods(namespace)
            .attach(pod_name, &params)
            .await
            .map_err(ClusterError::api)?;

        let stdin = process.stdin().ok_or(ClusterError::MissingStream("stdin"))?;
        let stdout = process.stdout().ok_or(ClusterError::MissingStream("stdout"))?;
        let stderr = process.stderr().map(|s| Box::new(s) as ChannelReader);

        Ok(AttachedStreams::new(Box::new(stdin), Box::new(stdout), stderr).with_handle(process))
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), ClusterError> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(ClusterError::NotFound(name.to_string()))
            }
            Err(e) => Err(ClusterError::api(e)),
        }
    }
}
