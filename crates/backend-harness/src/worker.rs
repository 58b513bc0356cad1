//! Worker profiles and daemon configuration.
//!
//! A worker profile records what a daemon flavour cannot do so test suites
//! can skip unsupported cases. The worker configuration file uses the
//! builder's TOML layout for registry mirrors and entitlements; it is
//! translated into the daemon's `daemon.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use harness_config::WorkerKind;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

/// Registry whose mirrors are forwarded to the daemon.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Capabilities a test may require from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    /// Exporting build cache.
    CacheExport,
    /// Importing build cache.
    CacheImport,
    /// Azure blob cache backend.
    CacheBackendAzblob,
    /// GitHub Actions cache backend.
    CacheBackendGha,
    /// Local directory cache backend.
    CacheBackendLocal,
    /// Registry cache backend.
    CacheBackendRegistry,
    /// S3 cache backend.
    CacheBackendS3,
    /// Pushing directly from the build.
    DirectPush,
    /// Image exporter.
    ImageExporter,
    /// Exporting to several caches at once.
    MultiCacheExport,
    /// Multi-platform builds.
    MultiPlatform,
    /// OCI tarball exporter.
    OciExporter,
    /// OCI layout sources.
    OciLayout,
    /// Provenance attestations.
    Provenance,
    /// SBOM attestations.
    Sbom,
    /// Insecure security mode.
    SecurityMode,
    /// CNI networking.
    CniNetwork,
}

const DOCKERD_UNSUPPORTED: &[Feature] = &[
    Feature::CacheExport,
    Feature::CacheImport,
    Feature::CacheBackendAzblob,
    Feature::CacheBackendGha,
    Feature::CacheBackendLocal,
    Feature::CacheBackendRegistry,
    Feature::CacheBackendS3,
    Feature::DirectPush,
    Feature::ImageExporter,
    Feature::MultiCacheExport,
    Feature::MultiPlatform,
    Feature::OciExporter,
    Feature::OciLayout,
    Feature::Provenance,
    Feature::Sbom,
    Feature::SecurityMode,
    Feature::CniNetwork,
];

const DOCKERD_CONTAINERD_UNSUPPORTED: &[Feature] = &[Feature::SecurityMode, Feature::CniNetwork];

/// Static description of a worker flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProfile {
    kind: WorkerKind,
    rootless: bool,
    unsupported: &'static [Feature],
}

impl WorkerProfile {
    /// Profile for `kind`.
    #[must_use]
    pub const fn for_kind(kind: WorkerKind) -> Self {
        match kind {
            WorkerKind::Dockerd => Self {
                kind,
                rootless: false,
                unsupported: DOCKERD_UNSUPPORTED,
            },
            WorkerKind::DockerdContainerd => Self {
                kind,
                rootless: false,
                unsupported: DOCKERD_CONTAINERD_UNSUPPORTED,
            },
        }
    }

    /// Profiles of every known worker.
    #[must_use]
    pub fn all() -> Vec<Self> {
        WorkerKind::ALL.into_iter().map(Self::for_kind).collect()
    }

    /// Worker flavour.
    #[must_use]
    pub const fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Worker name as used in test matrices.
    #[must_use]
    pub fn name(&self) -> String {
        self.kind.to_string()
    }

    /// Whether the daemon runs without root privileges.
    #[must_use]
    pub const fn rootless(&self) -> bool {
        self.rootless
    }

    /// Features this worker cannot provide.
    #[must_use]
    pub const fn unsupported_features(&self) -> &'static [Feature] {
        self.unsupported
    }

    /// Whether `feature` is available on this worker.
    #[must_use]
    pub fn supports(&self, feature: Feature) -> bool {
        !self.unsupported.contains(&feature)
    }
}

/// Mirror settings for one registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Mirror hosts, without scheme.
    pub mirrors: Vec<String>,
}

/// Worker configuration file. Keys the daemon translation does not use are
/// ignored.
///
/// ```toml
/// entitlements = ["network.host", "security.insecure"]
///
/// [registry."docker.io"]
/// mirrors = ["mirror.local:5000"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Registry settings keyed by registry host.
    #[serde(rename = "registry")]
    pub registries: BTreeMap<String, RegistryConfig>,
    /// Entitlements granted to builds.
    pub entitlements: Vec<String>,
}

impl WorkerConfig {
    /// Loads the configuration at `path`; no path means an empty configuration.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, WorkerConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path).map_err(|source| WorkerConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| WorkerConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Translates this configuration into daemon settings for `kind`.
    #[must_use]
    pub fn daemon_config(&self, kind: WorkerKind) -> DaemonConfig {
        let mut features = BTreeMap::new();
        features.insert(
            "containerd-snapshotter".to_owned(),
            kind.uses_containerd_snapshotter(),
        );
        let registry_mirrors = self
            .registries
            .get(DEFAULT_REGISTRY)
            .map(|registry| {
                registry
                    .mirrors
                    .iter()
                    .map(|mirror| format!("http://{mirror}"))
                    .collect()
            })
            .unwrap_or_default();
        let mut entitlements = BuilderEntitlements::default();
        for entitlement in &self.entitlements {
            match entitlement.as_str() {
                "network.host" => entitlements.network_host = true,
                "security.insecure" => entitlements.security_insecure = true,
                _ => {}
            }
        }
        DaemonConfig {
            features,
            registry_mirrors,
            builder: BuilderConfig { entitlements },
        }
    }
}

/// Contents of the daemon's `daemon.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonConfig {
    /// Daemon feature toggles.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, bool>,
    /// Pull-through mirrors for the default registry.
    #[serde(rename = "registry-mirrors", skip_serializing_if = "Vec::is_empty")]
    pub registry_mirrors: Vec<String>,
    /// Builder settings.
    pub builder: BuilderConfig,
}

impl DaemonConfig {
    /// Serialises the configuration as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, WorkerConfigError> {
        serde_json::to_vec_pretty(self).map_err(|source| WorkerConfigError::Render { source })
    }
}

/// Builder section of `daemon.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuilderConfig {
    /// Entitlements the builder grants.
    pub entitlements: BuilderEntitlements,
}

/// Builder entitlements; disabled entries are omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuilderEntitlements {
    /// Allow host networking.
    #[serde(skip_serializing_if = "is_false")]
    pub network_host: bool,
    /// Allow insecure security mode.
    #[serde(skip_serializing_if = "is_false")]
    pub security_insecure: bool,
}

const fn is_false(value: &bool) -> bool {
    !*value
}

/// Errors raised while loading or rendering worker configuration.
#[derive(Debug, Error)]
pub enum WorkerConfigError {
    /// The configuration file could not be read.
    #[error("failed to read worker configuration '{path}': {source}")]
    Read {
        /// Configuration file.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The configuration file is not valid.
    #[error("failed to parse worker configuration '{path}': {source}")]
    Parse {
        /// Configuration file.
        path: Utf8PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// The daemon configuration could not be serialised.
    #[error("failed to render daemon configuration: {source}")]
    Render {
        /// Underlying serialisation error.
        #[source]
        source: serde_json::Error,
    },
}
