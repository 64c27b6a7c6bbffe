//! Probes: read-only observations of the machine and the cluster.
//!
//! Probes decide from exit status, JSON output or a typed parse of a kernel
//! file. They never match against human-readable tool output.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::{ContentHasher, PackageManager};
use crate::error::ProbeError;
use crate::planner::Probe;
use crate::resource::{ResourceState, Taint, TaintEffect};

use super::command::{CommandOutput, CommandSpec};
use super::context::SystemContext;
use super::stamp::StampKind;

/// Kernel swap table.
pub const PROC_SWAPS: &str = "/proc/swaps";

/// Which of a set of packages are installed.
#[derive(Debug)]
pub struct PackagesProbe {
    ctx: Arc<SystemContext>,
    packages: Vec<String>,
}

/// Whether a systemd unit is active.
#[derive(Debug)]
pub struct ServiceProbe {
    ctx: Arc<SystemContext>,
    name: String,
}

/// Whether any swap device is active.
#[derive(Debug)]
pub struct SwapProbe {
    path: PathBuf,
}

/// Content checksum of a file.
#[derive(Debug)]
pub struct FileProbe {
    path: PathBuf,
}

/// Checksum a manifest was last applied with.
#[derive(Debug)]
pub struct ManifestProbe {
    ctx: Arc<SystemContext>,
    name: String,
}

/// Release status and the values it was last deployed with.
#[derive(Debug)]
pub struct ReleaseProbe {
    ctx: Arc<SystemContext>,
    name: String,
    namespace: String,
}

/// Whether a secret exists.
#[derive(Debug)]
pub struct SecretProbe {
    ctx: Arc<SystemContext>,
    namespace: String,
    name: String,
}

/// Whether a node carries a taint.
#[derive(Debug)]
pub struct TaintProbe {
    ctx: Arc<SystemContext>,
    node: String,
    taint: Taint,
}

/// HTTP status of an endpoint.
#[derive(Debug)]
pub struct EndpointProbe {
    ctx: Arc<SystemContext>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct HelmRelease {
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct KubeObject {
    metadata: KubeMetadata,
}

#[derive(Debug, Deserialize)]
struct KubeMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KubeNode {
    #[serde(default)]
    spec: KubeNodeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNodeSpec {
    #[serde(default)]
    taints: Vec<KubeTaint>,
}

#[derive(Debug, Deserialize)]
struct KubeTaint {
    key: String,
    #[serde(default)]
    value: String,
    effect: String,
}

impl PackagesProbe {
    /// Creates a probe for the given packages.
    #[must_use]
    pub const fn new(ctx: Arc<SystemContext>, packages: Vec<String>) -> Self {
        Self { ctx, packages }
    }

    fn query(&self, package: &str) -> CommandSpec {
        let spec = match self.ctx.package_manager() {
            PackageManager::Apt => CommandSpec::new("dpkg-query")
                .args(["-W", "-f=${db:Status-Abbrev}"])
                .arg(package),
            PackageManager::Dnf => CommandSpec::new("rpm").arg("-q").arg(package),
            PackageManager::Pacman => CommandSpec::new("pacman").arg("-Qq").arg(package),
        };
        self.ctx.bounded(spec)
    }

    async fn installed(&self, package: &str) -> Result<bool, ProbeError> {
        let spec = self.query(package);
        let output = self.ctx.runner().run(&spec).await?;
        match output.code {
            // dpkg also reports removed packages that left config files behind.
            Some(0) if self.ctx.package_manager() == PackageManager::Apt => {
                Ok(output.stdout.trim_start().starts_with("ii"))
            }
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_failed(&spec, output)),
        }
    }
}

#[async_trait]
impl Probe for PackagesProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let mut packages = BTreeSet::new();
        for package in &self.packages {
            if self.installed(package).await? {
                packages.insert(package.clone());
            }
        }
        debug!("Installed packages: {:?}", packages);
        Ok(ResourceState::PackagesPresent { packages })
    }

    fn describe(&self) -> String {
        format!("query packages {}", self.packages.join(" "))
    }
}

impl ServiceProbe {
    /// Creates a probe for a systemd unit.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Probe for ServiceProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let spec = self.ctx.bounded(
            CommandSpec::new("systemctl")
                .args(["is-active", "--quiet"])
                .arg(self.name.clone()),
        );
        let output = self.ctx.runner().run(&spec).await?;
        let active = match output.code {
            Some(0) => true,
            Some(_) => false,
            None => return Err(command_failed(&spec, output)),
        };
        Ok(ResourceState::ServiceActive {
            name: self.name.clone(),
            active,
        })
    }

    fn describe(&self) -> String {
        format!("systemctl is-active {}", self.name)
    }
}

impl SwapProbe {
    /// Probe reading `/proc/swaps`.
    #[must_use]
    pub fn new() -> Self {
        Self::at(PROC_SWAPS)
    }

    /// Probe reading a swap table at another path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for SwapProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for SwapProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ProbeError::Io {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        let active = parse_swaps(&content)?;
        Ok(ResourceState::SwapActive { active })
    }

    fn describe(&self) -> String {
        format!("read {}", self.path.display())
    }
}

/// Parses the kernel swap table; true if any device is listed.
///
/// # Errors
///
/// Returns an error if the header is missing or an entry is malformed.
pub fn parse_swaps(content: &str) -> Result<bool, ProbeError> {
    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default();
    let columns: Vec<&str> = header.split_whitespace().collect();
    if columns.first() != Some(&"Filename") || !columns.contains(&"Type") {
        return Err(ProbeError::invalid_output(PROC_SWAPS, format!("unexpected header '{header}'")));
    }

    let mut devices = 0;
    for line in lines.filter(|l| !l.trim().is_empty()) {
        if line.split_whitespace().count() < 3 {
            return Err(ProbeError::invalid_output(PROC_SWAPS, format!("malformed entry '{line}'")));
        }
        devices += 1;
    }
    Ok(devices > 0)
}

impl FileProbe {
    /// Creates a probe for a file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Probe for FileProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let sha256 = match tokio::fs::read(&self.path).await {
            Ok(content) => Some(ContentHasher::new().hash_bytes(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ProbeError::Io {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };
        Ok(ResourceState::FileChecksum {
            path: self.path.clone(),
            sha256,
        })
    }

    fn describe(&self) -> String {
        format!("sha256 {}", self.path.display())
    }
}

impl ManifestProbe {
    /// Creates a probe for a named manifest.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Probe for ManifestProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let sha256 = self.ctx.stamps().read(StampKind::Manifest, &self.name).await?;
        Ok(ResourceState::ManifestApplied {
            name: self.name.clone(),
            sha256,
        })
    }

    fn describe(&self) -> String {
        format!("manifest stamp {}", self.name)
    }
}

impl ReleaseProbe {
    /// Creates a probe for a release.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Stamp key, unique across namespaces.
    #[must_use]
    pub fn stamp_key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}

#[async_trait]
impl Probe for ReleaseProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let filter = format!("^{}$", self.name);
        let spec = self.ctx.bounded(self.ctx.helm([
            "list",
            "--namespace",
            self.namespace.as_str(),
            "--all",
            "--filter",
            filter.as_str(),
            "--output",
            "json",
        ]));
        let output = self.ctx.runner().run(&spec).await?;
        if !output.success() {
            return Err(command_failed(&spec, output));
        }

        let releases: Vec<HelmRelease> = serde_json::from_str(&output.stdout)
            .map_err(|e| ProbeError::invalid_output("helm list", e.to_string()))?;
        let deployed = releases
            .iter()
            .any(|r| r.name == self.name && r.status == "deployed");

        let values_sha256 = if deployed {
            self.ctx
                .stamps()
                .read(StampKind::Release, &Self::stamp_key(&self.namespace, &self.name))
                .await?
        } else {
            None
        };

        Ok(ResourceState::ReleaseDeployed {
            name: self.name.clone(),
            deployed,
            values_sha256,
        })
    }

    fn describe(&self) -> String {
        format!("helm list {}/{}", self.namespace, self.name)
    }
}

impl SecretProbe {
    /// Creates a probe for a secret.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Probe for SecretProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let spec = self.ctx.bounded(self.ctx.kubectl([
            "get",
            "secret",
            self.name.as_str(),
            "--namespace",
            self.namespace.as_str(),
            "--ignore-not-found",
            "--output",
            "json",
        ]));
        let output = self.ctx.runner().run(&spec).await?;
        if !output.success() {
            return Err(command_failed(&spec, output));
        }

        let present = if output.stdout.trim().is_empty() {
            false
        } else {
            let secret: KubeObject = serde_json::from_str(&output.stdout)
                .map_err(|e| ProbeError::invalid_output("kubectl get secret", e.to_string()))?;
            secret.metadata.name == self.name
        };

        Ok(ResourceState::SecretPresent {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            present,
        })
    }

    fn describe(&self) -> String {
        format!("kubectl get secret {}/{}", self.namespace, self.name)
    }
}

impl TaintProbe {
    /// Creates a probe for one taint on one node.
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
impl Probe for TaintProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let spec = self
            .ctx
            .bounded(self.ctx.kubectl(["get", "node", self.node.as_str(), "--output", "json"]));
        let output = self.ctx.runner().run(&spec).await?;
        if !output.success() {
            return Err(command_failed(&spec, output));
        }

        let node: KubeNode = serde_json::from_str(&output.stdout)
            .map_err(|e| ProbeError::invalid_output("kubectl get node", e.to_string()))?;
        let present = node.spec.taints.iter().any(|t| {
            t.key == self.taint.key
                && t.value == self.taint.value
                && TaintEffect::parse(&t.effect) == Some(self.taint.effect)
        });

        Ok(ResourceState::NodeTaint {
            node: self.node.clone(),
            taint: self.taint.clone(),
            present,
        })
    }

    fn describe(&self) -> String {
        format!("kubectl get node {}", self.node)
    }
}

impl EndpointProbe {
    /// Creates a probe for a URL.
    #[must_use]
    pub fn new(ctx: Arc<SystemContext>, url: impl Into<String>) -> Self {
        Self {
            ctx,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for EndpointProbe {
    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        let status = match self.ctx.http().get(&self.url).send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) if e.is_builder() => {
                return Err(ProbeError::Http {
                    url: self.url.clone(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                debug!("Endpoint {} unreachable: {}", self.url, e);
                None
            }
        };
        Ok(ResourceState::EndpointReachable {
            url: self.url.clone(),
            status,
        })
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

fn command_failed(spec: &CommandSpec, output: CommandOutput) -> ProbeError {
    ProbeError::CommandFailed {
        program: spec.program.clone(),
        code: output.code,
        stderr: output.stderr.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::command::MockCommandRunner;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn output(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn context(runner: MockCommandRunner, state_dir: &std::path::Path) -> Arc<SystemContext> {
        Arc::new(SystemContext::new(Arc::new(runner), state_dir).unwrap())
    }

    #[test]
    fn test_parse_swaps() {
        let empty = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";
        assert!(!parse_swaps(empty).unwrap());

        let active = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                      /swap.img                               file\t\t2097148\t\t0\t\t-2\n";
        assert!(parse_swaps(active).unwrap());

        assert!(parse_swaps("garbage").is_err());
    }

    #[tokio::test]
    async fn test_swap_probe_reads_table() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("swaps");
        std::fs::write(&table, "Filename Type Size Used Priority\n/dev/sda2 partition 1024 0 -2\n").unwrap();

        let state = SwapProbe::at(&table).observe().await.unwrap();

        assert_eq!(state, ResourceState::SwapActive { active: true });
    }

    #[tokio::test]
    async fn test_packages_probe_apt() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            let package = spec.args.last().cloned().unwrap_or_default();
            Ok(match package.as_str() {
                "curl" => output(0, "ii "),
                "nfs-common" => output(0, "rc "),
                _ => output(1, ""),
            })
        });
        let dir = TempDir::new().unwrap();
        let probe = PackagesProbe::new(
            context(runner, dir.path()),
            vec![String::from("curl"), String::from("nfs-common"), String::from("jq")],
        );

        let state = probe.observe().await.unwrap();

        assert_eq!(
            state,
            ResourceState::PackagesPresent {
                packages: BTreeSet::from([String::from("curl")]),
            }
        );
    }

    #[tokio::test]
    async fn test_packages_probe_unexpected_exit_is_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(output(2, "")));
        let dir = TempDir::new().unwrap();
        let probe = PackagesProbe::new(context(runner, dir.path()), vec![String::from("curl")]);

        assert!(probe.observe().await.is_err());
    }

    #[tokio::test]
    async fn test_service_probe_exit_codes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "systemctl" && spec.args.contains(&String::from("k3s")))
            .returning(|_| Ok(output(3, "")));
        let dir = TempDir::new().unwrap();
        let probe = ServiceProbe::new(context(runner, dir.path()), "k3s");

        let state = probe.observe().await.unwrap();

        assert_eq!(
            state,
            ResourceState::ServiceActive {
                name: String::from("k3s"),
                active: false,
            }
        );
    }

    #[tokio::test]
    async fn test_missing_systemctl_is_probe_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Err(crate::error::CommandError::NotFound {
                program: spec.program.clone(),
            })
        });
        let dir = TempDir::new().unwrap();
        let probe = ServiceProbe::new(context(runner, dir.path()), "k3s");

        let err = probe.observe().await.unwrap_err();

        assert!(matches!(err, ProbeError::Command(_)));
    }

    #[tokio::test]
    async fn test_file_probe_absent_and_present() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registries.yaml");
        let probe = FileProbe::new(&file);

        assert_eq!(
            probe.observe().await.unwrap(),
            ResourceState::FileChecksum {
                path: file.clone(),
                sha256: None,
            }
        );

        std::fs::write(&file, "mirrors: {}\n").unwrap();
        assert_eq!(
            probe.observe().await.unwrap(),
            ResourceState::FileChecksum {
                path: file.clone(),
                sha256: Some(ContentHasher::new().hash_str("mirrors: {}\n")),
            }
        );
    }

    #[tokio::test]
    async fn test_release_probe_reads_stamp() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "helm")
            .returning(|_| {
                Ok(output(
                    0,
                    r#"[{"name":"grafana","namespace":"monitoring","status":"deployed","revision":"3"}]"#,
                ))
            });
        let dir = TempDir::new().unwrap();
        let ctx = context(runner, dir.path());
        ctx.stamps()
            .write(StampKind::Release, "monitoring/grafana", "feedbeef")
            .await
            .unwrap();

        let state = ReleaseProbe::new(ctx, "grafana", "monitoring").observe().await.unwrap();

        assert_eq!(
            state,
            ResourceState::ReleaseDeployed {
                name: String::from("grafana"),
                deployed: true,
                values_sha256: Some(String::from("feedbeef")),
            }
        );
    }

    #[tokio::test]
    async fn test_release_probe_failed_release_not_deployed() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(output(0, r#"[{"name":"grafana","status":"failed"}]"#)));
        let dir = TempDir::new().unwrap();

        let state = ReleaseProbe::new(context(runner, dir.path()), "grafana", "monitoring")
            .observe()
            .await
            .unwrap();

        assert!(matches!(
            state,
            ResourceState::ReleaseDeployed {
                deployed: false,
                values_sha256: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_secret_probe_absent_is_valid_state() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.args.contains(&String::from("--ignore-not-found")))
            .returning(|_| Ok(output(0, "")));
        let dir = TempDir::new().unwrap();

        let state = SecretProbe::new(context(runner, dir.path()), "gitlab", "runner-token")
            .observe()
            .await
            .unwrap();

        assert_eq!(
            state,
            ResourceState::SecretPresent {
                namespace: String::from("gitlab"),
                name: String::from("runner-token"),
                present: false,
            }
        );
    }

    #[tokio::test]
    async fn test_secret_probe_bad_json_is_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(output(0, "Error from server")));
        let dir = TempDir::new().unwrap();

        let err = SecretProbe::new(context(runner, dir.path()), "gitlab", "runner-token")
            .observe()
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn test_taint_probe() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(output(
                0,
                r#"{"metadata":{"name":"node-1"},"spec":{"taints":[{"key":"node-role.kubernetes.io/control-plane","effect":"NoSchedule"}]}}"#,
            ))
        });
        let dir = TempDir::new().unwrap();
        let taint = Taint {
            key: String::from("node-role.kubernetes.io/control-plane"),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        };

        let state = TaintProbe::new(context(runner, dir.path()), "node-1", taint.clone())
            .observe()
            .await
            .unwrap();

        assert_eq!(
            state,
            ResourceState::NodeTaint {
                node: String::from("node-1"),
                taint,
                present: true,
            }
        );
    }

    #[tokio::test]
    async fn test_endpoint_probe_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let url = format!("{}/healthz", server.uri());

        let state = EndpointProbe::new(context(MockCommandRunner::new(), dir.path()), &url)
            .observe()
            .await
            .unwrap();

        assert_eq!(
            state,
            ResourceState::EndpointReachable {
                url,
                status: Some(503),
            }
        );
    }

    #[tokio::test]
    async fn test_endpoint_probe_unreachable_is_valid_state() {
        let dir = TempDir::new().unwrap();
        let url = String::from("http://127.0.0.1:9/");

        let state = EndpointProbe::new(context(MockCommandRunner::new(), dir.path()), &url)
            .observe()
            .await
            .unwrap();

        assert_eq!(state, ResourceState::EndpointReachable { url, status: None });
    }
}
