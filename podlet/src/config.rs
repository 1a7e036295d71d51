//! Remote execution configuration.

use std::time::Duration;

use crate::cluster::WORKER_CONTAINER;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_IMAGE: &str = "ghcr.io/podlet-dev/podlet-worker:latest";
pub const DEFAULT_SECRET: &str = "podlet-worker";
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(100);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Settings shared by every invocation of a remote runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub namespace: String,
    pub image: String,
    pub image_pull_policy: Option<String>,
    /// Secret exposed to the worker container as environment variables.
    pub secret_name: Option<String>,
    pub container_name: String,
    /// Delete the pod once the invocation ends, successfully or not.
    pub delete_pod: bool,
    /// Upper bound on waiting for the pod to reach Running.
    pub start_timeout: Duration,
    /// How long to wait for late error output once the worker has finished.
    pub poll_interval: Duration,
    /// Whole-invocation limit, covering every result of a stream.
    pub invocation_timeout: Option<Duration>,
    /// Request a terminal on attach. Merges stderr into stdout.
    pub tty: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            image_pull_policy: None,
            secret_name: Some(DEFAULT_SECRET.to_string()),
            container_name: WORKER_CONTAINER.to_string(),
            delete_pod: true,
            start_timeout: DEFAULT_START_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            invocation_timeout: None,
            tty: false,
        }
    }
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PODLET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("PODLET_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = lookup("PODLET_IMAGE") {
            config.image = v;
        }
        if let Some(v) = lookup("PODLET_IMAGE_PULL_POLICY") {
            config.image_pull_policy = Some(v);
        }
        if let Some(v) = lookup("PODLET_SECRET") {
            // Empty disables the secret reference.
            config.secret_name = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("PODLET_DELETE_POD") {
            config.delete_pod = parse_bool("PODLET_DELETE_POD", &v)?;
        }
        if let Some(v) = lookup("PODLET_START_TIMEOUT_SECS") {
            config.start_timeout = Duration::from_secs(parse_u64("PODLET_START_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("PODLET_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_u64("PODLET_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("PODLET_INVOCATION_TIMEOUT_SECS") {
            let secs = parse_u64("PODLET_INVOCATION_TIMEOUT_SECS", &v)?;
            config.invocation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = lookup("PODLET_TTY") {
            config.tty = parse_bool("PODLET_TTY", &v)?;
        }
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_image_pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.image_pull_policy = Some(policy.into());
        self
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret_name = secret;
        self
    }

    pub fn with_delete_pod(mut self, delete_pod: bool) -> Self {
        self.delete_pod = delete_pod;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
