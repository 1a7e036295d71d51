//! In-memory cluster for tests.
//!
//! Attaching either replays a scripted worker or runs the real worker loop
//! over in-memory pipes.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::bridge::protocol::{ExecutionMode, STREAM_FLAG};
use crate::cluster::{
    AttachOptions, AttachedStreams, ClusterClient, ClusterError, PodEvent, PodEventStream,
    PodPhase, WorkerPodSpec,
};
use crate::lifecycle::WorkerPod;
use crate::runnable::CatalogLoader;
use crate::worker::{WorkerConfig, run_worker};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
struct FakeFailure(&'static str);

impl std::fmt::Display for FakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for FakeFailure {}

/// Fixed output for an attached worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    stdout: Vec<String>,
    stdout_interval: Duration,
    hold_open: bool,
    stderr: Option<String>,
    stderr_delay: Duration,
}

impl WorkerScript {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: vec![text.to_string()],
            ..Self::default()
        }
    }

    /// Write `pieces` to stdout one at a time, `interval` apart.
    pub fn trickle(pieces: &[&str], interval: Duration) -> Self {
        Self {
            stdout: pieces.iter().map(|p| p.to_string()).collect(),
            stdout_interval: interval,
            ..Self::default()
        }
    }

    /// Keep stdout open after the scripted output.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn with_stderr(mut self, text: &str) -> Self {
        self.stderr = Some(text.to_string());
        self
    }

    pub fn with_stderr_delay(mut self, delay: Duration) -> Self {
        self.stderr_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    created: Vec<WorkerPodSpec>,
    live: BTreeSet<String>,
    deleted: Vec<String>,
    attached: usize,
    stdin: Option<String>,
    watches: VecDeque<Vec<PodEvent>>,
    watch_count: usize,
}

pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
    events: Vec<PodEvent>,
    hold_watch_open: bool,
    fail_watch: bool,
    fail_create: bool,
    fail_attach: bool,
    fail_delete: bool,
    create_delay: Duration,
    script: Option<WorkerScript>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Pods start normally and attach runs the real worker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            events: vec![
                PodEvent::added(PodPhase::Pending),
                PodEvent::modified(PodPhase::Pending),
                PodEvent::modified(PodPhase::Running),
            ],
            hold_watch_open: false,
            fail_watch: false,
            fail_create: false,
            fail_attach: false,
            fail_delete: false,
            create_delay: Duration::ZERO,
            script: None,
        }
    }

    pub fn with_events(mut self, events: Vec<PodEvent>) -> Self {
        self.events = events;
        self
    }

    /// Events for successive watches. Once these run out, every further
    /// watch replays the default events.
    pub fn with_watches(self, watches: Vec<Vec<PodEvent>>) -> Self {
        self.state.lock().unwrap().watches = watches.into();
        self
    }

    /// Register the pod, then answer the create request only after `delay`.
    pub fn slow_create(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Keep the watch open after the scripted events.
    pub fn hold_watch_open(mut self) -> Self {
        self.hold_watch_open = true;
        self
    }

    pub fn fail_watch(mut self) -> Self {
        self.fail_watch = true;
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn fail_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn with_script(mut self, script: WorkerScript) -> Self {
        self.script = Some(script);
        self
    }

    pub fn created(&self) -> Vec<WorkerPodSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn live(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().live.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn attach_count(&self) -> usize {
        self.state.lock().unwrap().attached
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().unwrap().watch_count
    }

    /// Everything written to a scripted worker's stdin, once the caller closed it.
    pub async fn wait_for_stdin(&self) -> String {
        for _ in 0..200 {
            if let Some(stdin) = self.state.lock().unwrap().stdin.clone() {
                return stdin;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stdin was never closed");
    }

    /// Wait for `count` deletions issued from spawned tasks.
    pub async fn wait_for_deletions(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let deleted = self.deleted();
            if deleted.len() >= count {
                return deleted;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} deletions, saw {:?}", self.deleted());
    }

    fn mode_of(&self, pod_name: &str) -> ExecutionMode {
        let state = self.state.lock().unwrap();
        let streaming = state
            .created
            .iter()
            .find(|spec| spec.name == pod_name)
            .is_some_and(|spec| spec.args.iter().any(|a| a == STREAM_FLAG));
        if streaming {
            ExecutionMode::Streaming
        } else {
            ExecutionMode::OneShot
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, _namespace: &str, spec: &WorkerPodSpec) -> Result<(), ClusterError> {
        if self.fail_create {
            return Err(ClusterError::api(FakeFailure("quota exceeded")));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.live.insert(spec.name.clone());
            state.created.push(spec.clone());
        }
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        _label_selector: &str,
        _timeout: Duration,
    ) -> Result<PodEventStream, ClusterError> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.watch_count += 1;
            state.watches.pop_front()
        };
        let scripted = scripted.unwrap_or_else(|| self.events.clone());
        let events = stream::iter(scripted.into_iter().map(Ok));
        if self.fail_watch {
            let failure = stream::once(async { Err(ClusterError::Watch("connection reset".to_string())) });
            return Ok(events.chain(failure).boxed());
        }
        if self.hold_watch_open {
            return Ok(events.chain(stream::pending()).boxed());
        }
        Ok(events.boxed())
    }

    async fn attach(
        &self,
        pod_name: &str,
        _namespace: &str,
        _options: &AttachOptions,
    ) -> Result<AttachedStreams, ClusterError> {
        if self.fail_attach {
            return Err(ClusterError::api(FakeFailure("upgrade refused")));
        }
        self.state.lock().unwrap().attached += 1;

        let (caller_stdin, mut worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut worker_stdout, caller_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut worker_stderr, caller_stderr) = tokio::io::duplex(PIPE_CAPACITY);

        match self.script.clone() {
            None => {
                let config = WorkerConfig::new(self.mode_of(pod_name));
                tokio::spawn(async move {
                    let _ = run_worker(&CatalogLoader, config, worker_stdin, worker_stdout, worker_stderr).await;
                });
            }
            Some(WorkerScript {
                stdout,
                stdout_interval,
                hold_open,
                stderr,
                stderr_delay,
            }) => {
                tokio::spawn(async move {
                    for (i, piece) in stdout.iter().enumerate() {
                        if i > 0 && !stdout_interval.is_zero() {
                            tokio::time::sleep(stdout_interval).await;
                        }
                        if worker_stdout.write_all(piece.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    if hold_open {
                        std::future::pending::<()>().await;
                    }
                });
                tokio::spawn(async move {
                    if let Some(text) = stderr {
                        if !stderr_delay.is_zero() {
                            tokio::time::sleep(stderr_delay).await;
                        }
                        let _ = worker_stderr.write_all(text.as_bytes()).await;
                    }
                });
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    let mut received = String::new();
                    let _ = worker_stdin.read_to_string(&mut received).await;
                    state.lock().unwrap().stdin = Some(received);
                });
            }
        }

        Ok(AttachedStreams::new(
            Box::new(caller_stdin),
            Box::new(caller_stdout),
            Some(Box::new(caller_stderr)),
        ))
    }

    async fn delete_pod(&self, name: &str, _namespace: &str) -> Result<(), ClusterError> {
        if self.fail_delete {
            return Err(ClusterError::api(FakeFailure("forbidden")));
        }
        let mut state = self.state.lock().unwrap();
        if !state.live.remove(name) {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        state.deleted.push(name.to_string());
        Ok(())
    }
}

/// A pod that is already running, for attach-level tests.
pub fn running_pod(mode: ExecutionMode) -> WorkerPod {
    WorkerPod {
        uid: Uuid::nil(),
        name: "podlet-worker-test".to_string(),
        namespace: "default".to_string(),
        image: "podlet-worker:test".to_string(),
        mode,
        phase: PodPhase::Running,
    }
}
