//! Turns plan file entries into executable steps.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{
    ContentHasher, GeneratorConfig, PlanConfig, Settings, StepConfig, StepKind, parse_mode,
};
use crate::error::{ConfigError, ConvergeError, Result};
use crate::resource::{ResourceState, Taint, compare};
use crate::system::{
    ApplyManifest, EndpointProbe, EnsureClusterInstalled, EnsurePackages, EnsureRelease,
    EnsureSecret, EnsureService, EnvGenerator, FileProbe, ManifestProbe, PackagesProbe,
    RandomGenerator, ReleaseProbe, RestartService, SecretGenerator, SecretProbe, ServiceProbe,
    SetSwap, SetTaint, SwapProbe, SystemContext, TaintProbe, Verify, WriteFile,
};

use super::plan::Plan;
use super::retry::{Retry, RetryPolicy};
use super::step::{Step, StepTimeouts};

/// Builds [`Plan`]s from validated plan file entries.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    ctx: Arc<SystemContext>,
    timeouts: StepTimeouts,
}

impl PlanBuilder {
    /// Creates a builder using the settings' default timeouts.
    #[must_use]
    pub fn new(settings: &Settings, ctx: SystemContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            timeouts: StepTimeouts {
                probe: Duration::from_secs(settings.probe_timeout_secs),
                action: Duration::from_secs(settings.action_timeout_secs),
            },
        }
    }

    /// Builds one plan.
    ///
    /// The configuration must have been validated and its sources resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if a step declares no kind or several, or carries
    /// content that was never resolved.
    pub fn build(&self, config: &PlanConfig) -> Result<Plan> {
        let mut plan = Plan::new(&config.name);
        for step_config in &config.steps {
            let step = self.step(step_config)?;
            debug!("Built step '{}' in plan '{}'", step_config.label, config.name);

            match step_config.retry {
                Some(retry) => plan.push(Retry::new(
                    step,
                    RetryPolicy {
                        attempts: retry.attempts,
                        delay: Duration::from_secs(retry.delay_secs),
                    },
                )),
                None => plan.push(step),
            }
        }
        Ok(plan)
    }

    fn step(&self, config: &StepConfig) -> Result<Step> {
        let kind = config.kind().ok_or_else(|| {
            ConvergeError::Config(ConfigError::validation(
                "Step must declare exactly one kind",
                format!("steps.{}", config.label),
            ))
        })?;

        let mut step = self.bind(&config.label, kind)?.with_timeouts(
            config
                .timeout_secs
                .map_or(self.timeouts, |secs| StepTimeouts::uniform(Duration::from_secs(secs))),
        );
        if let Some(policy) = config.policy {
            step = step.with_policy(policy);
        }
        if let Some(after) = &config.after {
            step = step.triggered_by(after.clone());
        }
        Ok(step)
    }

    /// Picks the probe, action, desired state and comparison for a kind.
    fn bind(&self, label: &str, kind: StepKind<'_>) -> Result<Step> {
        let ctx = &self.ctx;
        let hasher = ContentHasher::new();

        let step = match kind {
            StepKind::Packages(packages) => Step::new(
                label,
                Arc::new(PackagesProbe::new(ctx.clone(), packages.to_vec())),
                Arc::new(EnsurePackages::new(ctx.clone())),
                ResourceState::PackagesPresent {
                    packages: packages.iter().cloned().collect(),
                },
                compare::packages_superset(),
            ),
            StepKind::Swap(swap) => Step::new(
                label,
                Arc::new(SwapProbe::new()),
                Arc::new(SetSwap::new(ctx.clone())),
                ResourceState::SwapActive { active: swap.active },
                compare::exact(),
            ),
            StepKind::Service(service) => Step::new(
                label,
                Arc::new(ServiceProbe::new(ctx.clone(), &service.name)),
                Arc::new(EnsureService::new(ctx.clone(), &service.name)),
                ResourceState::ServiceActive {
                    name: service.name.clone(),
                    active: service.active,
                },
                compare::exact(),
            ),
            StepKind::Restart(restart) => Step::new(
                label,
                Arc::new(ServiceProbe::new(ctx.clone(), &restart.service)),
                Arc::new(RestartService::new(ctx.clone(), &restart.service)),
                ResourceState::ServiceActive {
                    name: restart.service.clone(),
                    active: true,
                },
                compare::exact(),
            ),
            StepKind::Cluster(cluster) => {
                let service = cluster.mode.service_name();
                Step::new(
                    label,
                    Arc::new(ServiceProbe::new(ctx.clone(), service)),
                    Arc::new(EnsureClusterInstalled::new(ctx.clone(), cluster)),
                    ResourceState::ServiceActive {
                        name: service.to_string(),
                        active: true,
                    },
                    compare::exact(),
                )
            }
            StepKind::File(file) => {
                let content = resolved(label, file.content.as_deref())?;
                let mode = file.mode.as_deref().and_then(parse_mode);
                Step::new(
                    label,
                    Arc::new(FileProbe::new(&file.path)),
                    Arc::new(WriteFile::new(&file.path, content, mode)),
                    ResourceState::FileChecksum {
                        path: file.path.clone().into(),
                        sha256: Some(hasher.hash_str(content)),
                    },
                    compare::checksum(),
                )
            }
            StepKind::Manifest(manifest) => {
                let content = resolved(label, manifest.content.as_deref())?;
                Step::new(
                    label,
                    Arc::new(ManifestProbe::new(ctx.clone(), &manifest.name)),
                    Arc::new(ApplyManifest::new(ctx.clone(), &manifest.name, content)),
                    ResourceState::ManifestApplied {
                        name: manifest.name.clone(),
                        sha256: Some(hasher.hash_str(content)),
                    },
                    compare::checksum(),
                )
            }
            StepKind::Release(release) => Step::new(
                label,
                Arc::new(ReleaseProbe::new(ctx.clone(), &release.name, &release.namespace)),
                Arc::new(EnsureRelease::new(ctx.clone(), release.clone())),
                ResourceState::ReleaseDeployed {
                    name: release.name.clone(),
                    deployed: true,
                    values_sha256: Some(hasher.hash_values(&release.values)?),
                },
                compare::checksum(),
            ),
            StepKind::Secret(secret) => {
                let generator: Arc<dyn SecretGenerator> = match &secret.generator {
                    GeneratorConfig::Random { keys, length } => {
                        Arc::new(RandomGenerator::new(keys.clone(), *length))
                    }
                    GeneratorConfig::FromEnv { keys } => Arc::new(EnvGenerator::new(keys.clone())),
                };
                Step::new(
                    label,
                    Arc::new(SecretProbe::new(ctx.clone(), &secret.namespace, &secret.name)),
                    Arc::new(EnsureSecret::new(
                        ctx.clone(),
                        &secret.namespace,
                        &secret.name,
                        generator,
                    )),
                    ResourceState::SecretPresent {
                        namespace: secret.namespace.clone(),
                        name: secret.name.clone(),
                        present: true,
                    },
                    compare::exact(),
                )
            }
            StepKind::Taint(taint_config) => {
                let taint = Taint {
                    key: taint_config.key.clone(),
                    value: taint_config.value.clone(),
                    effect: taint_config.effect,
                };
                Step::new(
                    label,
                    Arc::new(TaintProbe::new(ctx.clone(), &taint_config.node, taint.clone())),
                    Arc::new(SetTaint::new(ctx.clone(), &taint_config.node, taint.clone())),
                    ResourceState::NodeTaint {
                        node: taint_config.node.clone(),
                        taint,
                        present: taint_config.present,
                    },
                    compare::exact(),
                )
            }
            StepKind::Http(http) => Step::new(
                label,
                Arc::new(EndpointProbe::new(ctx.clone(), &http.url)),
                Arc::new(Verify::new(&http.url)),
                ResourceState::EndpointReachable {
                    url: http.url.clone(),
                    status: Some(http.status),
                },
                compare::status_code(),
            ),
        };

        Ok(step)
    }
}

fn resolved<'a>(label: &str, content: Option<&'a str>) -> Result<&'a str> {
    content.ok_or_else(|| {
        ConvergeError::Config(ConfigError::validation(
            "Content was not resolved from its source",
            format!("steps.{label}"),
        ))
    })
}
