//! Plan file parser.
//!
//! This module loads plan files from YAML, applies environment overrides and
//! pulls referenced manifest and file sources into the configuration so the
//! rest of the engine deals only with opaque content.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{ConvergeConfig, PackageManager};

/// Parser for plan files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative sources.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative sources.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a plan file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let path = path.as_ref();
        info!("Loading plan file from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a plan file from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ConvergeConfig> {
        debug!("Parsing YAML plan file");

        let config: ConvergeConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed {} plan(s)", config.plans.len());
        Ok(config)
    }

    /// Loads a plan file and applies environment overrides.
    ///
    /// Recognised variables: `KUBECONVERGE_STATE_DIR`,
    /// `KUBECONVERGE_KUBECONFIG` and `KUBECONVERGE_PACKAGE_MANAGER`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// holds an unknown package manager.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup.
    fn apply_overrides(
        config: &mut ConvergeConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(dir) = lookup("KUBECONVERGE_STATE_DIR") {
            debug!("Overriding settings.state_dir from environment");
            config.settings.state_dir = Some(dir);
        }

        if let Some(kubeconfig) = lookup("KUBECONVERGE_KUBECONFIG") {
            debug!("Overriding settings.kubeconfig from environment");
            config.settings.kubeconfig = Some(kubeconfig);
        }

        if let Some(manager) = lookup("KUBECONVERGE_PACKAGE_MANAGER") {
            debug!("Overriding settings.package_manager from environment");
            config.settings.package_manager = match manager.to_ascii_lowercase().as_str() {
                "apt" => PackageManager::Apt,
                "dnf" => PackageManager::Dnf,
                "pacman" => PackageManager::Pacman,
                other => {
                    return Err(ConvergeError::Config(ConfigError::validation(
                        format!("Unknown package manager '{other}'"),
                        "KUBECONVERGE_PACKAGE_MANAGER",
                    )));
                }
            };
        }

        Ok(())
    }

    /// Reads every `source` reference into the matching `content` field.
    ///
    /// Run this after validation: validation checks that `content` and
    /// `source` are not both given.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced source cannot be read.
    pub fn resolve_sources(&self, config: &mut ConvergeConfig) -> Result<()> {
        for plan in &mut config.plans {
            for step in &mut plan.steps {
                if let Some(file) = step.file.as_mut() {
                    if let Some(source) = file.source.take() {
                        file.content = Some(self.read_source(&source)?);
                    }
                }
                if let Some(manifest) = step.manifest.as_mut() {
                    if let Some(source) = manifest.source.take() {
                        manifest.content = Some(self.read_source(&source)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads one source file relative to the base path.
    fn read_source(&self, source: &str) -> Result<String> {
        let path = self.resolve_path(source);
        debug!("Reading source: {}", path.display());
        std::fs::read_to_string(&path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read source: {e}"),
                location: Some(path.display().to_string()),
            })
        })
    }

    /// Resolves a path against the base path unless it is absolute.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            return candidate;
        }
        self.base_path
            .as_ref()
            .map_or(candidate.clone(), |base| base.join(&candidate))
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads a required environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn require_env(name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| {
            ConvergeError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Default plan file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "kubeconverge.yaml",
    "kubeconverge.yml",
    "converge.yaml",
    "converge.yml",
];

/// Per-user plan file directory (`~/.config/kubeconverge` on Linux).
#[must_use]
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kubeconverge"))
}

/// Finds the plan file in the given directory or its parents, then in the
/// per-user config directory.
///
/// # Errors
///
/// Returns an error if no plan file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found plan file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(user_dir) = user_config_dir() {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = user_dir.join(filename);
            if config_path.exists() {
                info!("Found plan file: {}", config_path.display());
                return Ok(config_path);
            }
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::ClusterMode;
    use crate::planner::FailurePolicy;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
plans:
  - name: node
    steps:
      - label: disable swap
        swap: { active: false }
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.plans.len(), 1);
        assert_eq!(config.plans[0].policy, FailurePolicy::Abort);
        assert_eq!(config.settings.probe_timeout_secs, 5);
        assert_eq!(config.settings.action_timeout_secs, 300);
        assert_eq!(config.settings.package_manager, PackageManager::Apt);
        assert_eq!(config.plans[0].steps[0].kind().map(|k| k.name()), Some("swap"));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
settings:
  state_dir: /var/lib/kubeconverge
  kubeconfig: /etc/rancher/k3s/k3s.yaml
  package_manager: dnf
plans:
  - name: node
    steps:
      - label: base packages
        packages: [curl, nfs-utils]
      - label: install k3s
        cluster:
          mode: agent
          join_url: https://10.0.0.1:6443
          token_env: K3S_TOKEN
        retry: { attempts: 3, delay_secs: 10 }
  - name: monitoring
    policy: continue
    steps:
      - label: metrics server
        release:
          name: metrics-server
          chart: metrics-server/metrics-server
          namespace: kube-system
          values:
            args: ["--kubelet-insecure-tls"]
          wait: true
      - label: admin password
        secret:
          name: grafana-admin
          namespace: monitoring
          generator: { type: random, keys: [password] }
      - label: dashboard up
        http: { url: "http://127.0.0.1:3000/api/health" }
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(config.settings.package_manager, PackageManager::Dnf);
        assert_eq!(config.total_steps(), 5);

        let node = config.plan("node").unwrap();
        let cluster = node.steps[1].cluster.as_ref().unwrap();
        assert_eq!(cluster.mode, ClusterMode::Agent);
        assert_eq!(node.steps[1].retry.unwrap().attempts, 3);

        let monitoring = config.plan("monitoring").unwrap();
        assert_eq!(monitoring.policy, FailurePolicy::Continue);
        assert!(monitoring.steps[0].release.as_ref().unwrap().wait);
        assert_eq!(monitoring.steps[2].http.as_ref().unwrap().status, 200);
    }

    #[test]
    fn test_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("plans: []", None)
            .unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("KUBECONVERGE_STATE_DIR", "/tmp/state"),
            ("KUBECONVERGE_PACKAGE_MANAGER", "Pacman"),
        ]);

        ConfigParser::apply_overrides(&mut config, |name| {
            vars.get(name).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.settings.state_dir.as_deref(), Some("/tmp/state"));
        assert_eq!(config.settings.package_manager, PackageManager::Pacman);
        assert!(config.settings.kubeconfig.is_none());
    }

    #[test]
    fn test_unknown_package_manager_override() {
        let mut config = ConfigParser::new()
            .parse_yaml("plans: []", None)
            .unwrap();
        let result = ConfigParser::apply_overrides(&mut config, |name| {
            (name == "KUBECONVERGE_PACKAGE_MANAGER").then(|| String::from("zypper"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_sources() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("traefik.yaml"), "kind: HelmChartConfig\n").unwrap();

        let yaml = r"
plans:
  - name: ingress
    steps:
      - label: traefik config
        manifest: { name: traefik-config, source: traefik.yaml }
";
        let parser = ConfigParser::new().with_base_path(dir.path());
        let mut config = parser.parse_yaml(yaml, None).unwrap();
        parser.resolve_sources(&mut config).unwrap();

        let manifest = config.plans[0].steps[0].manifest.as_ref().unwrap();
        assert!(manifest.source.is_none());
        assert_eq!(manifest.content.as_deref(), Some("kind: HelmChartConfig\n"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("converge.yaml"), "plans: []\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("converge.yaml"));
    }

    #[test]
    fn test_user_config_dir() {
        if let Some(dir) = user_config_dir() {
            assert!(dir.ends_with("kubeconverge"));
        }
    }
}
