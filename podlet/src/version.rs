//! Version information for podlet.

/// Podlet version from Cargo.toml
pub const PODLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the binaries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub podlet: &'static str,
    /// Image the caller launches workers from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_image: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            podlet: PODLET_VERSION,
            worker_image: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_image(mut self, image: String) -> Self {
        self.worker_image = Some(image);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_podlet_version() {
        let info = VersionInfo::new();
        assert_eq!(info.podlet, PODLET_VERSION);
        assert!(info.worker_image.is_none());
    }

    #[test]
    fn version_info_serializes_set_fields_only() {
        let info = VersionInfo {
            podlet: "0.3.0",
            worker_image: Some("ghcr.io/podlet-dev/podlet-worker:0.3.0".to_string()),
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "podlet": "0.3.0",
          "worker_image": "ghcr.io/podlet-dev/podlet-worker:0.3.0"
        }
        "#);
    }
}
