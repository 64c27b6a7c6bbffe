//! Actions: idempotent mutations with a declared postcondition.
//!
//! Every action receives the desired state it must bring about. Applying the
//! same desired state twice leaves the same end state; none of them swallow
//! a failing command.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ClusterConfig, ClusterMode, ContentHasher, PackageManager, ReleaseConfig};
use crate::error::ActionError;
use crate::planner::Action;
use crate::resource::{ResourceState, Taint};

use super::command::{CommandOutput, CommandSpec};
use super::context::SystemContext;
use super::probes::ReleaseProbe;
use super::stamp::StampKind;
use super::write_atomic;

/// Filesystem table edited when swap is turned off.
const FSTAB: &str = "/etc/fstab";

/// Environment lookup used for tokens and secret literals.
type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Produces secret data. Called at most once per apply.
pub trait SecretGenerator: Send + Sync {
    /// Generates the key/value pairs of the secret.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be produced.
    fn generate(&self) -> Result<BTreeMap<String, String>, ActionError>;
}

/// Random hex values for each key.
#[derive(Debug, Clone)]
pub struct RandomGenerator {
    keys: Vec<String>,
    length: usize,
}

/// Values read from environment variables.
#[derive(Clone)]
pub struct EnvGenerator {
    keys: BTreeMap<String, String>,
    lookup: EnvLookup,
}

/// Installs packages with the configured package manager.
#[derive(Debug)]
pub struct EnsurePackages {
    ctx: Arc<SystemContext>,
}

/// Enables and starts, or disables and stops, a systemd unit.
#[derive(Debug)]
pub struct EnsureService {
    ctx: Arc<SystemContext>,
    name: String,
}

/// Restarts a systemd unit.
#[derive(Debug)]
pub struct RestartService {
    ctx: Arc<SystemContext>,
    name: String,
}

/// Turns swap on or off, persisting "off" in the filesystem table.
#[derive(Debug)]
pub struct SetSwap {
    ctx: Arc<SystemContext>,
    fstab: PathBuf,
}

/// Writes file content atomically.
#[derive(Debug)]
pub struct WriteFile {
    path: PathBuf,
    content: String,
    mode: Option<u32>,
}

/// Applies a manifest and stamps its checksum.
#[derive(Debug)]
pub struct ApplyManifest {
    ctx: Arc<SystemContext>,
    name: String,
    content: String,
}

/// Installs or upgrades a chart release and stamps its values checksum.
#[derive(Debug)]
pub struct EnsureRelease {
    ctx: Arc<SystemContext>,
    release: ReleaseConfig,
}

/// Creates a secret from generated data, or deletes it.
pub struct EnsureSecret {
    ctx: Arc<SystemContext>,
    namespace: String,
    name: String,
    generator: Arc<dyn SecretGenerator>,
}

/// Adds or removes a node taint.
#[derive(Debug)]
pub struct SetTaint {
    ctx: Arc<SystemContext>,
    node: String,
    taint: Taint,
}

/// Downloads and runs the cluster installer.
pub struct EnsureClusterInstalled {
    ctx: Arc<SystemContext>,
    mode: ClusterMode,
    join_url: Option<String>,
    token_env: Option<String>,
    version: Option<String>,
    extra_args: Vec<String>,
    lookup: EnvLookup,
}

/// Does nothing; the re-observation decides the outcome.
#[derive(Debug)]
pub struct Verify {
    url: String,
}

fn process_env() -> EnvLookup {
    Arc::new(|name| std::env::var(name).ok())
}

const fn unexpected(expected: &'static str, found: &ResourceState) -> ActionError {
    ActionError::UnexpectedDesired {
        expected,
        found: found.kind(),
    }
}

async fn run_checked(ctx: &SystemContext, spec: CommandSpec) -> Result<CommandOutput, ActionError> {
    let output = ctx.runner().run(&spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ActionError::CommandFailed {
            program: spec.program,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

impl RandomGenerator {
    /// Creates a generator of `length`-character values.
    #[must_use]
    pub const fn new(keys: Vec<String>, length: usize) -> Self {
        Self { keys, length }
    }
}

impl SecretGenerator for RandomGenerator {
    fn generate(&self) -> Result<BTreeMap<String, String>, ActionError> {
        if self.length == 0 {
            return Err(ActionError::generator("length must be positive"));
        }
        Ok(self
            .keys
            .iter()
            .map(|key| {
                let mut value = String::with_capacity(self.length + 32);
                while value.len() < self.length {
                    value.push_str(&uuid::Uuid::new_v4().simple().to_string());
                }
                value.truncate(self.length);
                (key.clone(), value)
            })
            .collect())
    }
}

impl EnvGenerator {
    /// Maps secret keys to environment variable names.
    #[must_use]
    pub fn new(keys: BTreeMap<String, String>) -> Self {
        Self {
            keys,
            lookup: process_env(),
        }
    }

    /// Uses a custom variable lookup.
    #[must_use]
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.lookup = Arc::new(lookup);
        self
    }
}

impl SecretGenerator for EnvGenerator {
    fn generate(&self) -> Result<BTreeMap<String, String>, ActionError> {
        self.keys
            .iter()
            .map(|(key, var)| {
                (self.lookup)(var)
                    .map(|value| (key.clone(), value))
                    .ok_or_else(|| ActionError::MissingEnvVar { name: var.clone() })
            })
            .collect()
    }
}

impl fmt::Debug for EnvGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvGenerator")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl EnsurePackages {
    /// Creates the action.
    #[must_use]
    pub const fn new(ctx: Arc<SystemContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for EnsurePackages {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        let ResourceState::PackagesPresent { packages } = desired else {
            return Err(unexpected("packages_present", desired));
        };
        if packages.is_empty() {
            return Ok(());
        }

        let install = match self.ctx.package_manager() {
            PackageManager::Apt => {
                run_checked(
                    &self.ctx,
                    CommandSpec::new("apt-get")
                        .arg("update")
                        .env("DEBIAN_FRONTEND", "noninteractive"),
                )
                .await?;
                CommandSpec::new("apt-get")
                    .args(["install", "-y"])
                    .env("DEBIAN_FRONTEND", "noninteractive")
            }
            PackageManager::Dnf => CommandSpec::new("dnf").args(["install", "-y"]),
            PackageManager::Pacman => {
                CommandSpec::new("pacman").args(["-S", "--noconfirm", "--needed"])
            }
        };

        info!("Installing packages: {}", packages.iter().cloned().collect::<Vec<_>>().join(" "));
        run_checked(&self.ctx, install.args(packages.iter().cloned())).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("install packages ({:?})", self.ctx.package_manager())
    }
}

impl EnsureService {
    /// Creates the action for a unit.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Action for EnsureService {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        let ResourceState::ServiceActive { active, .. } = desired else {
            return Err(unexpected("service_active", desired));
        };
        let verb = if *active { "enable" } else { "disable" };
        run_checked(
            &self.ctx,
            CommandSpec::new("systemctl").args([verb, "--now", self.name.as_str()]),
        )
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("systemctl enable/disable --now {}", self.name)
    }
}

impl RestartService {
    /// Creates the action for a unit.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Action for RestartService {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        if !matches!(desired, ResourceState::ServiceActive { .. }) {
            return Err(unexpected("service_active", desired));
        }
        run_checked(
            &self.ctx,
            CommandSpec::new("systemctl").args(["restart", self.name.as_str()]),
        )
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("systemctl restart {}", self.name)
    }
}

impl SetSwap {
    /// Creates the action, editing `/etc/fstab`.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>) -> Self {
        Self {
            ctx,
            fstab: PathBuf::from(FSTAB),
        }
    }

    /// Edits another filesystem table.
    #[must_use]
    pub fn with_fstab(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab = path.into();
        self
    }

    async fn persist_off(&self) -> Result<(), ActionError> {
        let content = match tokio::fs::read_to_string(&self.fstab).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ActionError::Io {
                    path: self.fstab.clone(),
                    message: e.to_string(),
                });
            }
        };
        if let Some(updated) = comment_out_swap(&content) {
            info!("Disabling swap entries in {}", self.fstab.display());
            write_atomic(&self.fstab, updated.as_bytes()).await?;
        }
        Ok(())
    }
}

/// Comments out active swap entries; `None` if there are none.
fn comment_out_swap(fstab: &str) -> Option<String> {
    let mut changed = false;
    let mut lines: Vec<String> = fstab
        .lines()
        .map(|line| {
            let is_swap = !line.trim_start().starts_with('#')
                && line.split_whitespace().nth(2) == Some("swap");
            if is_swap {
                changed = true;
                format!("# {line}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !changed {
        return None;
    }
    if fstab.ends_with('\n') {
        lines.push(String::new());
    }
    Some(lines.join("\n"))
}

#[async_trait]
impl Action for SetSwap {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        let ResourceState::SwapActive { active } = desired else {
            return Err(unexpected("swap_active", desired));
        };
        if *active {
            run_checked(&self.ctx, CommandSpec::new("swapon").arg("-a")).await?;
        } else {
            run_checked(&self.ctx, CommandSpec::new("swapoff").arg("-a")).await?;
            self.persist_off().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        String::from("swapon/swapoff -a")
    }
}

impl WriteFile {
    /// Creates the action.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>, mode: Option<u32>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode,
        }
    }

    #[cfg(unix)]
    async fn set_mode(&self) -> Result<(), ActionError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = self.mode {
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| ActionError::Io {
                    path: self.path.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn set_mode(&self) -> Result<(), ActionError> {
        Ok(())
    }
}

#[async_trait]
impl Action for WriteFile {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        if !matches!(desired, ResourceState::FileChecksum { .. }) {
            return Err(unexpected("file_checksum", desired));
        }
        debug!("Writing file: {}", self.path.display());
        write_atomic(&self.path, self.content.as_bytes()).await?;
        self.set_mode().await
    }

    fn describe(&self) -> String {
        format!("write {}", self.path.display())
    }
}

impl ApplyManifest {
    /// Creates the action.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
impl Action for ApplyManifest {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        if !matches!(desired, ResourceState::ManifestApplied { .. }) {
            return Err(unexpected("manifest_applied", desired));
        }
        run_checked(
            &self.ctx,
            self.ctx
                .kubectl(["apply", "-f", "-"])
                .stdin(self.content.as_bytes()),
        )
        .await?;

        let sha256 = ContentHasher::new().hash_str(&self.content);
        self.ctx.stamps().write(StampKind::Manifest, &self.name, &sha256).await
    }

    fn describe(&self) -> String {
        format!("kubectl apply manifest {}", self.name)
    }
}

impl EnsureRelease {
    /// Creates the action.
    #[must_use]
    pub const fn new(ctx: Arc<SystemContext>, release: ReleaseConfig) -> Self {
        Self { ctx, release }
    }

    fn values_path(&self) -> PathBuf {
        self.ctx
            .state_dir()
            .join("values")
            .join(format!("{}_{}.yaml", self.release.namespace, self.release.name))
    }

    fn render_values(&self) -> Result<String, ActionError> {
        if self.release.values.is_null() {
            return Ok(String::from("{}\n"));
        }
        serde_yaml::to_string(&self.release.values)
            .map_err(|e| ActionError::generator(format!("cannot render values: {e}")))
    }
}

#[async_trait]
impl Action for EnsureRelease {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        if !matches!(desired, ResourceState::ReleaseDeployed { .. }) {
            return Err(unexpected("release_deployed", desired));
        }
        let release = &self.release;
        let values = self.render_values()?;
        let values_path = self.values_path();
        write_atomic(&values_path, values.as_bytes()).await?;

        let mut spec = self.ctx.helm([
            "upgrade",
            "--install",
            release.name.as_str(),
            release.chart.as_str(),
            "--namespace",
            release.namespace.as_str(),
            "--create-namespace",
            "--values",
        ]);
        spec = spec.arg(values_path.display().to_string());
        if let Some(repo) = &release.repo {
            spec = spec.arg("--repo").arg(repo.clone());
        }
        if let Some(version) = &release.version {
            spec = spec.arg("--version").arg(version.clone());
        }
        if release.wait {
            spec = spec.arg("--wait");
        }

        info!("Deploying release {}/{}", release.namespace, release.name);
        run_checked(&self.ctx, spec).await?;

        let sha256 = ContentHasher::new().hash_str(&values);
        self.ctx
            .stamps()
            .write(
                StampKind::Release,
                &ReleaseProbe::stamp_key(&release.namespace, &release.name),
                &sha256,
            )
            .await
    }

    fn describe(&self) -> String {
        format!("helm upgrade --install {} {}", self.release.name, self.release.chart)
    }
}

impl EnsureSecret {
    /// Creates the action.
    #[must_use]
    pub fn new(
        ctx: Arc<SystemContext>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        generator: Arc<dyn SecretGenerator>,
    ) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            name: name.into(),
            generator,
        }
    }
}

#[async_trait]
impl Action for EnsureSecret {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        let ResourceState::SecretPresent { present, .. } = desired else {
            return Err(unexpected("secret_present", desired));
        };

        if !*present {
            run_checked(
                &self.ctx,
                self.ctx.kubectl([
                    "delete",
                    "secret",
                    self.name.as_str(),
                    "--namespace",
                    self.namespace.as_str(),
                    "--ignore-not-found",
                ]),
            )
            .await?;
            return Ok(());
        }

        let data = self.generator.generate()?;
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "stringData": data,
        });

        // Existing secrets are never overwritten: `create` fails instead.
        run_checked(
            &self.ctx,
            self.ctx
                .kubectl(["create", "-f", "-"])
                .stdin(manifest.to_string()),
        )
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("kubectl create secret {}/{}", self.namespace, self.name)
    }
}

impl fmt::Debug for EnsureSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsureSecret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SetTaint {
    /// Creates the action.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, node: impl Into<String>, taint: Taint) -> Self {
        Self {
            ctx,
            node: node.into(),
            taint,
        }
    }
}

#[async_trait]
impl Action for SetTaint {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        let ResourceState::NodeTaint { present, .. } = desired else {
            return Err(unexpected("node_taint", desired));
        };
        let spec = if *present {
            self.ctx
                .kubectl(["taint", "nodes", self.node.as_str()])
                .arg(self.taint.spec())
                .arg("--overwrite")
        } else {
            self.ctx
                .kubectl(["taint", "nodes", self.node.as_str()])
                .arg(format!("{}-", self.taint.spec()))
        };
        run_checked(&self.ctx, spec).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("kubectl taint nodes {} {}", self.node, self.taint.spec())
    }
}

impl EnsureClusterInstalled {
    /// Creates the action from a cluster step.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, cluster: &ClusterConfig) -> Self {
        Self {
            ctx,
            mode: cluster.mode,
            join_url: cluster.join_url.clone(),
            token_env: cluster.token_env.clone(),
            version: cluster.version.clone(),
            extra_args: cluster.extra_args.clone(),
            lookup: process_env(),
        }
    }

    /// Uses a custom variable lookup for the join token.
    #[must_use]
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.lookup = Arc::new(lookup);
        self
    }

    async fn download(&self) -> Result<Vec<u8>, ActionError> {
        let url = self.ctx.installer_url();
        let http_error = |e: reqwest::Error| ActionError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };

        debug!("Downloading installer: {}", url);
        let response = self
            .ctx
            .http()
            .get(url)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?;
        let body = response.bytes().await.map_err(http_error)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Action for EnsureClusterInstalled {
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError> {
        if !matches!(desired, ResourceState::ServiceActive { .. }) {
            return Err(unexpected("service_active", desired));
        }

        let token = match &self.token_env {
            Some(var) => Some((self.lookup)(var).ok_or_else(|| ActionError::MissingEnvVar {
                name: var.clone(),
            })?),
            None => None,
        };

        let script = self.download().await?;
        let script_path = self.ctx.state_dir().join("install-k3s.sh");
        write_atomic(&script_path, &script).await?;

        let mut spec = CommandSpec::new("sh")
            .arg(script_path.display().to_string())
            .arg(self.mode.as_str())
            .args(self.extra_args.iter().cloned());
        if let Some(version) = &self.version {
            spec = spec.env("INSTALL_K3S_VERSION", version.clone());
        }
        if let Some(url) = &self.join_url {
            spec = spec.env("K3S_URL", url.clone());
        }
        if let Some(token) = token {
            spec = spec.env("K3S_TOKEN", token);
        }

        info!("Installing cluster in {} mode", self.mode.as_str());
        run_checked(&self.ctx, spec).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("install k3s {}", self.mode.as_str())
    }
}

impl fmt::Debug for EnsureClusterInstalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsureClusterInstalled")
            .field("mode", &self.mode)
            .field("join_url", &self.join_url)
            .field("token_env", &self.token_env)
            .field("version", &self.version)
            .field("extra_args", &self.extra_args)
            .finish_non_exhaustive()
    }
}

impl Verify {
    /// Creates the action.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Action for Verify {
    async fn apply(&self, _desired: &ResourceState) -> Result<(), ActionError> {
        debug!("Verifying {}", self.url);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("verify {}", self.url)
    }
}
