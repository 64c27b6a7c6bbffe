//! Resource state snapshots and comparison rules.
//!
//! A [`ResourceState`] is one externally observable fact about the machine
//! or the cluster. Probes produce them, plan authors supply the desired
//! value, and a [`Comparator`] decides whether the two agree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceState {
    /// A systemd unit is (or is not) active.
    ServiceActive {
        /// Unit name.
        name: String,
        /// Whether the unit is active.
        active: bool,
    },
    /// Any swap device is active.
    SwapActive {
        /// Whether swap is on.
        active: bool,
    },
    /// Content checksum of a file.
    FileChecksum {
        /// File path.
        path: PathBuf,
        /// Hex sha256, `None` when the file does not exist.
        sha256: Option<String>,
    },
    /// A single taint on a node.
    NodeTaint {
        /// Node name.
        node: String,
        /// The taint.
        taint: Taint,
        /// Whether the node carries it.
        present: bool,
    },
    /// Installed packages among a requested set.
    PackagesPresent {
        /// Package names.
        packages: BTreeSet<String>,
    },
    /// Checksum of the manifest content last applied under a name.
    ManifestApplied {
        /// Manifest name.
        name: String,
        /// Hex sha256, `None` when never applied.
        sha256: Option<String>,
    },
    /// A chart release.
    ReleaseDeployed {
        /// Release name.
        name: String,
        /// Whether the release is in the `deployed` state.
        deployed: bool,
        /// Checksum of the values last used, `None` if unknown.
        values_sha256: Option<String>,
    },
    /// A cluster secret exists.
    SecretPresent {
        /// Namespace.
        namespace: String,
        /// Secret name.
        name: String,
        /// Whether it exists.
        present: bool,
    },
    /// HTTP status returned by an endpoint.
    EndpointReachable {
        /// Requested URL.
        url: String,
        /// Status code, `None` when no response was received.
        status: Option<u16>,
    },
}

/// A node taint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value, empty when the taint has none.
    #[serde(default)]
    pub value: String,
    /// Scheduling effect.
    pub effect: TaintEffect,
}

/// Scheduling effect of a taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled without a toleration.
    NoSchedule,
    /// The scheduler avoids the node when it can.
    PreferNoSchedule,
    /// Running pods without a toleration are evicted.
    NoExecute,
}

/// Result of comparing observed with desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// Observed state satisfies the desired state.
    Match,
    /// The action must run.
    Diverge,
}

/// A pure comparison rule: `(observed, desired) -> Comparison`.
pub type Comparator = Arc<dyn Fn(&ResourceState, &ResourceState) -> Comparison + Send + Sync>;

impl ResourceState {
    /// Short name of the variant, used in logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ServiceActive { .. } => "service_active",
            Self::SwapActive { .. } => "swap_active",
            Self::FileChecksum { .. } => "file_checksum",
            Self::NodeTaint { .. } => "node_taint",
            Self::PackagesPresent { .. } => "packages_present",
            Self::ManifestApplied { .. } => "manifest_applied",
            Self::ReleaseDeployed { .. } => "release_deployed",
            Self::SecretPresent { .. } => "secret_present",
            Self::EndpointReachable { .. } => "endpoint_reachable",
        }
    }
}

impl Comparison {
    /// Builds a comparison from a boolean "matches" flag.
    #[must_use]
    pub const fn from_match(matches: bool) -> Self {
        if matches { Self::Match } else { Self::Diverge }
    }
}

impl TaintEffect {
    /// Parses the effect name used by Kubernetes.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NoSchedule" => Some(Self::NoSchedule),
            "PreferNoSchedule" => Some(Self::PreferNoSchedule),
            "NoExecute" => Some(Self::NoExecute),
            _ => None,
        }
    }

    /// Returns the effect name used by Kubernetes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        }
    }
}

impl Taint {
    /// Renders the `key=value:Effect` form accepted by `kubectl taint`.
    #[must_use]
    pub fn spec(&self) -> String {
        if self.value.is_empty() {
            format!("{}:{}", self.key, self.effect.as_str())
        } else {
            format!("{}={}:{}", self.key, self.value, self.effect.as_str())
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceActive { name, active } => write!(f, "service {name} active={active}"),
            Self::SwapActive { active } => write!(f, "swap active={active}"),
            Self::FileChecksum { path, sha256 } => {
                write!(f, "file {} sha256={}", path.display(), short(sha256.as_deref()))
            }
            Self::NodeTaint { node, taint, present } => {
                write!(f, "node {node} taint {} present={present}", taint.spec())
            }
            Self::PackagesPresent { packages } => {
                let list: Vec<&str> = packages.iter().map(String::as_str).collect();
                write!(f, "packages [{}]", list.join(", "))
            }
            Self::ManifestApplied { name, sha256 } => {
                write!(f, "manifest {name} sha256={}", short(sha256.as_deref()))
            }
            Self::ReleaseDeployed { name, deployed, values_sha256 } => write!(
                f,
                "release {name} deployed={deployed} values={}",
                short(values_sha256.as_deref())
            ),
            Self::SecretPresent { namespace, name, present } => {
                write!(f, "secret {namespace}/{name} present={present}")
            }
            Self::EndpointReachable { url, status } => match status {
                Some(code) => write!(f, "endpoint {url} status={code}"),
                None => write!(f, "endpoint {url} unreachable"),
            },
        }
    }
}

fn short(hash: Option<&str>) -> String {
    hash.map_or_else(|| String::from("<none>"), |h| crate::config::ContentHasher::new().short_hash(h))
}

/// Built-in comparison rules.
///
/// The engine never picks one on its own; plan builders attach the rule that
/// fits the resource kind.
pub mod compare {
    use super::{Comparator, Comparison, ResourceState};
    use crate::config::ContentHasher;
    use std::sync::Arc;

    /// Structural equality.
    #[must_use]
    pub fn exact() -> Comparator {
        Arc::new(|observed, desired| Comparison::from_match(observed == desired))
    }

    /// Checksum equality for file, manifest and release values states.
    ///
    /// Falls back to structural equality for other kinds.
    #[must_use]
    pub fn checksum() -> Comparator {
        Arc::new(|observed, desired| {
            let matches = match (observed, desired) {
                (
                    ResourceState::FileChecksum { sha256: seen, .. },
                    ResourceState::FileChecksum { sha256: want, .. },
                )
                | (
                    ResourceState::ManifestApplied { sha256: seen, .. },
                    ResourceState::ManifestApplied { sha256: want, .. },
                ) => hashes_equal(seen.as_deref(), want.as_deref()),
                (
                    ResourceState::ReleaseDeployed {
                        deployed: seen_deployed,
                        values_sha256: seen,
                        ..
                    },
                    ResourceState::ReleaseDeployed {
                        deployed: want_deployed,
                        values_sha256: want,
                        ..
                    },
                ) => seen_deployed == want_deployed && hashes_equal(seen.as_deref(), want.as_deref()),
                _ => observed == desired,
            };
            Comparison::from_match(matches)
        })
    }

    /// Matches when every desired package is among the observed ones.
    #[must_use]
    pub fn packages_superset() -> Comparator {
        Arc::new(|observed, desired| match (observed, desired) {
            (
                ResourceState::PackagesPresent { packages: seen },
                ResourceState::PackagesPresent { packages: want },
            ) => Comparison::from_match(want.is_subset(seen)),
            _ => Comparison::Diverge,
        })
    }

    /// Matches when the endpoint answered with the desired status code.
    #[must_use]
    pub fn status_code() -> Comparator {
        Arc::new(|observed, desired| match (observed, desired) {
            (
                ResourceState::EndpointReachable { status: Some(seen), .. },
                ResourceState::EndpointReachable { status: Some(want), .. },
            ) => Comparison::from_match(seen == want),
            _ => Comparison::Diverge,
        })
    }

    fn hashes_equal(seen: Option<&str>, want: Option<&str>) -> bool {
        match (seen, want) {
            (Some(a), Some(b)) => ContentHasher::hashes_match(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}
