//! podlet: run serializable runnables in disposable Kubernetes worker pods.

mod version;

pub mod attach;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod error;
pub mod invocation;
pub mod lifecycle;
pub mod remote;
pub mod runnable;
pub mod value;
pub mod worker;
pub mod worker_tracing_layer;

#[cfg(test)]
mod testing;

pub use bridge::protocol::ExecutionMode;
pub use cluster::{ClusterClient, ClusterError};
#[cfg(feature = "kube")]
pub use cluster::KubeCluster;
pub use config::{ConfigError, RemoteConfig};
pub use error::{ErrorKind, RemoteError, RunnableError, SerializationError};
pub use invocation::{InvocationOutcome, InvocationState};
pub use remote::RemoteRunnable;
pub use runnable::{
    CatalogLoader, GraphLoader, Runnable, RunnableDescriptor, RunnableSpec, Sequence, Serializable,
    ValueStream,
};
pub use value::{decode_value, encode_value};
pub use version::{PODLET_VERSION, VersionInfo};
pub use worker::{WorkerConfig, WorkerFailure, run_worker};
pub use worker_tracing_layer::{LogSink, WorkerTracingLayer};
