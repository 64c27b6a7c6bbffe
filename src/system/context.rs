//! Shared collaborators for probes and actions.

use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PackageManager, Settings};
use crate::error::{ConvergeError, Result};

use super::command::{CommandRunner, CommandSpec, TokioCommandRunner};
use super::stamp::StampStore;

/// HTTP client timeout for endpoint checks and installer downloads.
const HTTP_TIMEOUT_SECS: u64 = 60;

/// Everything a probe or action needs to reach the machine and the cluster.
#[derive(Clone)]
pub struct SystemContext {
    runner: Arc<dyn CommandRunner>,
    http: Client,
    state_dir: PathBuf,
    kubeconfig: Option<String>,
    package_manager: PackageManager,
    installer_url: String,
    probe_timeout: Duration,
}

impl SystemContext {
    /// Creates a context with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(runner: Arc<dyn CommandRunner>, state_dir: impl Into<PathBuf>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConvergeError::internal(format!("Failed to create HTTP client: {e}")))?;
        let defaults = Settings::default();

        Ok(Self {
            runner,
            http,
            state_dir: state_dir.into(),
            kubeconfig: None,
            package_manager: defaults.package_manager,
            installer_url: defaults.installer_url,
            probe_timeout: Duration::from_secs(defaults.probe_timeout_secs),
        })
    }

    /// Creates a context from plan file settings, running real commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_settings(settings: &Settings, base: &Path) -> Result<Self> {
        Self::with_runner(settings, base, Arc::new(TokioCommandRunner::new()))
    }

    /// Creates a context from plan file settings with a custom runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_runner(
        settings: &Settings,
        base: &Path,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let mut ctx = Self::new(runner, settings.state_dir_path(base))?;
        ctx.kubeconfig.clone_from(&settings.kubeconfig);
        ctx.package_manager = settings.package_manager;
        ctx.installer_url.clone_from(&settings.installer_url);
        ctx.probe_timeout = Duration::from_secs(settings.probe_timeout_secs);
        Ok(ctx)
    }

    /// Sets the kubeconfig passed to `kubectl` and `helm`.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<String>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    /// Sets the package manager.
    #[must_use]
    pub const fn with_package_manager(mut self, manager: PackageManager) -> Self {
        self.package_manager = manager;
        self
    }

    /// Sets the cluster installer URL.
    #[must_use]
    pub fn with_installer_url(mut self, url: impl Into<String>) -> Self {
        self.installer_url = url.into();
        self
    }

    /// Command runner.
    #[must_use]
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// HTTP client.
    #[must_use]
    pub const fn http(&self) -> &Client {
        &self.http
    }

    /// State directory.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Package manager.
    #[must_use]
    pub const fn package_manager(&self) -> PackageManager {
        self.package_manager
    }

    /// Cluster installer URL.
    #[must_use]
    pub fn installer_url(&self) -> &str {
        &self.installer_url
    }

    /// Stamp store under the state directory.
    #[must_use]
    pub fn stamps(&self) -> StampStore {
        StampStore::new(&self.state_dir)
    }

    /// `kubectl` invocation, with `--kubeconfig` when configured.
    #[must_use]
    pub fn kubectl<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_cluster_access(CommandSpec::new("kubectl"))
            .args(args)
    }

    /// `helm` invocation, with `--kubeconfig` when configured.
    #[must_use]
    pub fn helm<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_cluster_access(CommandSpec::new("helm"))
            .args(args)
    }

    /// Applies the probe time bound to a read-only command.
    #[must_use]
    pub const fn bounded(&self, spec: CommandSpec) -> CommandSpec {
        spec.timeout(self.probe_timeout)
    }

    fn with_cluster_access(&self, spec: CommandSpec) -> CommandSpec {
        match &self.kubeconfig {
            Some(path) => spec.arg("--kubeconfig").arg(path.clone()),
            None => spec,
        }
    }
}

impl fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemContext")
            .field("state_dir", &self.state_dir)
            .field("kubeconfig", &self.kubeconfig)
            .field("package_manager", &self.package_manager)
            .field("installer_url", &self.installer_url)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubectl_adds_kubeconfig() {
        let ctx = SystemContext::new(Arc::new(TokioCommandRunner::new()), "/tmp/state")
            .unwrap()
            .with_kubeconfig("/etc/rancher/k3s/k3s.yaml");

        let spec = ctx.kubectl(["get", "nodes"]);

        assert_eq!(
            spec.to_string(),
            "kubectl --kubeconfig /etc/rancher/k3s/k3s.yaml get nodes"
        );
    }

    #[test]
    fn test_from_settings_resolves_state_dir() {
        let settings = Settings {
            package_manager: PackageManager::Dnf,
            ..Settings::default()
        };

        let ctx = SystemContext::from_settings(&settings, Path::new("/srv/cluster")).unwrap();

        assert_eq!(ctx.state_dir(), Path::new("/srv/cluster/.kubeconverge"));
        assert_eq!(ctx.package_manager(), PackageManager::Dnf);
        assert_eq!(ctx.helm(["list"]).to_string(), "helm list");
    }
}
