//! Plan file schema types.
//!
//! This module defines the structs that map to `kubeconverge.yaml`. A plan
//! file lists one or more named plans, each an ordered list of steps. Every
//! step names exactly one resource kind and the state that resource should
//! be in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::planner::FailurePolicy;
use crate::resource::TaintEffect;

/// The root of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergeConfig {
    /// Settings shared by every plan.
    #[serde(default)]
    pub settings: Settings,
    /// Plans in the file.
    pub plans: Vec<PlanConfig>,
}

/// Settings shared by every plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Directory for lock files, apply stamps and run history.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Kubeconfig passed to `kubectl` and `helm`.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Package manager used by `packages` steps.
    #[serde(default)]
    pub package_manager: PackageManager,
    /// Default probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Default action timeout.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// URL of the cluster installer script.
    #[serde(default = "default_installer_url")]
    pub installer_url: String,
}

/// Supported package managers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian and Ubuntu.
    #[default]
    Apt,
    /// Fedora and RHEL.
    Dnf,
    /// Arch.
    Pacman,
}

/// One named plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanConfig {
    /// Plan name, used for locks and history.
    pub name: String,
    /// What to do when a step fails.
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One step. Exactly one of the kind fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    /// Human-readable label, unique within the plan.
    pub label: String,
    /// Overrides the plan policy for this step.
    #[serde(default)]
    pub policy: Option<FailurePolicy>,
    /// Overrides both probe and action timeouts.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Bounded retry of the whole step.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Label of an earlier step whose convergence forces this step's action.
    #[serde(default)]
    pub after: Option<String>,

    /// Ensure packages are installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
    /// Ensure swap is on or off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapConfig>,
    /// Ensure a service is active or inactive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,
    /// Restart a service, usually behind an `after` edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartConfig>,
    /// Install the cluster as server or agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,
    /// Ensure a file has given content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileConfig>,
    /// Apply a manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestConfig>,
    /// Install or upgrade a chart release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseConfig>,
    /// Ensure a secret exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretConfig>,
    /// Ensure a node taint is present or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taint: Option<TaintConfig>,
    /// Wait for an HTTP endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
}

/// Borrowed view of the kind a step declares.
#[derive(Debug, Clone, Copy)]
pub enum StepKind<'a> {
    /// `packages`
    Packages(&'a [String]),
    /// `swap`
    Swap(&'a SwapConfig),
    /// `service`
    Service(&'a ServiceConfig),
    /// `restart`
    Restart(&'a RestartConfig),
    /// `cluster`
    Cluster(&'a ClusterConfig),
    /// `file`
    File(&'a FileConfig),
    /// `manifest`
    Manifest(&'a ManifestConfig),
    /// `release`
    Release(&'a ReleaseConfig),
    /// `secret`
    Secret(&'a SecretConfig),
    /// `taint`
    Taint(&'a TaintConfig),
    /// `http`
    Http(&'a HttpConfig),
}

/// Bounded retry settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    #[serde(default)]
    pub delay_secs: u64,
}

/// Swap state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapConfig {
    /// Whether swap should be on.
    pub active: bool,
}

/// Service state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// systemd unit name.
    pub name: String,
    /// Whether the unit should be active.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Service restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartConfig {
    /// systemd unit name.
    pub service: String,
}

/// Cluster installation mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Control plane node.
    #[default]
    Server,
    /// Worker joining an existing server.
    Agent,
}

/// Cluster installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Server or agent.
    #[serde(default)]
    pub mode: ClusterMode,
    /// Server URL to join (agent mode).
    #[serde(default)]
    pub join_url: Option<String>,
    /// Environment variable holding the join token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Pinned installer version.
    #[serde(default)]
    pub version: Option<String>,
    /// Extra flags passed to the installer.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// File content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    /// Target path.
    pub path: String,
    /// Inline content.
    #[serde(default)]
    pub content: Option<String>,
    /// Local file to copy content from, relative to the plan file.
    #[serde(default)]
    pub source: Option<String>,
    /// Octal permission bits, e.g. `"0600"`.
    #[serde(default)]
    pub mode: Option<String>,
}

/// Manifest to apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestConfig {
    /// Stable name used for the apply stamp.
    pub name: String,
    /// Inline manifest.
    #[serde(default)]
    pub content: Option<String>,
    /// Local manifest file, relative to the plan file.
    #[serde(default)]
    pub source: Option<String>,
}

/// Chart release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseConfig {
    /// Release name.
    pub name: String,
    /// Chart reference.
    pub chart: String,
    /// Target namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Chart repository URL.
    #[serde(default)]
    pub repo: Option<String>,
    /// Chart version.
    #[serde(default)]
    pub version: Option<String>,
    /// Values passed through to the chart tool.
    #[serde(default)]
    pub values: serde_yaml::Value,
    /// Wait for resources to become ready.
    #[serde(default)]
    pub wait: bool,
}

/// Secret to create once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretConfig {
    /// Secret name.
    pub name: String,
    /// Namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// How secret data is produced.
    pub generator: GeneratorConfig,
}

/// Secret data generators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratorConfig {
    /// Random hex strings for each key.
    Random {
        /// Data keys.
        keys: Vec<String>,
        /// Characters per value.
        #[serde(default = "default_secret_length")]
        length: usize,
    },
    /// Values read from environment variables.
    FromEnv {
        /// Data key to environment variable name.
        keys: BTreeMap<String, String>,
    },
}

/// Node taint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaintConfig {
    /// Node name.
    pub node: String,
    /// Taint key.
    pub key: String,
    /// Taint value.
    #[serde(default)]
    pub value: String,
    /// Taint effect.
    pub effect: TaintEffect,
    /// Whether the taint should be present.
    #[serde(default = "default_true")]
    pub present: bool,
}

/// HTTP endpoint check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    /// URL to request.
    pub url: String,
    /// Expected status code.
    #[serde(default = "default_http_status")]
    pub status: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            kubeconfig: None,
            package_manager: PackageManager::default(),
            probe_timeout_secs: default_probe_timeout(),
            action_timeout_secs: default_action_timeout(),
            installer_url: default_installer_url(),
        }
    }
}

impl Settings {
    /// Default state directory, relative to the plan file.
    pub const DEFAULT_STATE_DIR: &'static str = ".kubeconverge";

    /// Resolves the state directory against the plan file's directory.
    #[must_use]
    pub fn state_dir_path(&self, base: &Path) -> PathBuf {
        let dir = PathBuf::from(self.state_dir.as_deref().unwrap_or(Self::DEFAULT_STATE_DIR));
        if dir.is_absolute() { dir } else { base.join(dir) }
    }
}

impl StepConfig {
    /// Returns every kind this step declares, in field order.
    #[must_use]
    pub fn kinds(&self) -> Vec<StepKind<'_>> {
        let mut kinds = Vec::new();
        if let Some(p) = &self.packages {
            kinds.push(StepKind::Packages(p));
        }
        if let Some(s) = &self.swap {
            kinds.push(StepKind::Swap(s));
        }
        if let Some(s) = &self.service {
            kinds.push(StepKind::Service(s));
        }
        if let Some(r) = &self.restart {
            kinds.push(StepKind::Restart(r));
        }
        if let Some(c) = &self.cluster {
            kinds.push(StepKind::Cluster(c));
        }
        if let Some(f) = &self.file {
            kinds.push(StepKind::File(f));
        }
        if let Some(m) = &self.manifest {
            kinds.push(StepKind::Manifest(m));
        }
        if let Some(r) = &self.release {
            kinds.push(StepKind::Release(r));
        }
        if let Some(s) = &self.secret {
            kinds.push(StepKind::Secret(s));
        }
        if let Some(t) = &self.taint {
            kinds.push(StepKind::Taint(t));
        }
        if let Some(h) = &self.http {
            kinds.push(StepKind::Http(h));
        }
        kinds
    }

    /// Returns the single declared kind, if exactly one is set.
    #[must_use]
    pub fn kind(&self) -> Option<StepKind<'_>> {
        let kinds = self.kinds();
        if kinds.len() == 1 { kinds.first().copied() } else { None }
    }
}

impl StepKind<'_> {
    /// Key name of this kind in the plan file.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Packages(_) => "packages",
            Self::Swap(_) => "swap",
            Self::Service(_) => "service",
            Self::Restart(_) => "restart",
            Self::Cluster(_) => "cluster",
            Self::File(_) => "file",
            Self::Manifest(_) => "manifest",
            Self::Release(_) => "release",
            Self::Secret(_) => "secret",
            Self::Taint(_) => "taint",
            Self::Http(_) => "http",
        }
    }
}

impl ConvergeConfig {
    /// Finds a plan by name.
    #[must_use]
    pub fn plan(&self, name: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.name == name)
    }

    /// Total number of steps across all plans.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.plans.iter().map(|p| p.steps.len()).sum()
    }
}

impl ClusterMode {
    /// systemd unit the installer creates for this mode.
    #[must_use]
    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Server => "k3s",
            Self::Agent => "k3s-agent",
        }
    }

    /// Installer subcommand for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
        }
    }
}

const fn default_probe_timeout() -> u64 {
    5
}

const fn default_action_timeout() -> u64 {
    300
}

fn default_installer_url() -> String {
    String::from("https://get.k3s.io")
}

fn default_namespace() -> String {
    String::from("default")
}

const fn default_true() -> bool {
    true
}

const fn default_secret_length() -> usize {
    32
}

const fn default_http_status() -> u16 {
    200
}
