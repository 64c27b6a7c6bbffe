//! Plan file validation.
//!
//! Validation catches everything that can be known before touching the
//! machine: naming, step ordering edges and malformed step payloads.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ClusterMode, ConvergeConfig, GeneratorConfig, PlanConfig, StepConfig, StepKind};

/// Validator for plan files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a plan file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any are found.
    pub fn validate(&self, config: &ConvergeConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Plan file validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &ConvergeConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if config.plans.is_empty() {
            result.error("plans", "At least one plan is required");
        }

        if config.settings.probe_timeout_secs == 0 {
            result.error("settings.probe_timeout_secs", "Probe timeout must be positive");
        }
        if config.settings.action_timeout_secs == 0 {
            result.error("settings.action_timeout_secs", "Action timeout must be positive");
        }

        let mut plan_names = HashSet::new();
        for (i, plan) in config.plans.iter().enumerate() {
            let field = format!("plans[{i}]");
            if !is_valid_name(&plan.name) {
                result.error(
                    format!("{field}.name"),
                    format!(
                        "Plan name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        plan.name
                    ),
                );
            }
            if !plan_names.insert(plan.name.as_str()) {
                result.error(
                    format!("{field}.name"),
                    format!("Duplicate plan name: {}", plan.name),
                );
            }
            Self::validate_plan(plan, &field, &mut result);
        }

        result
    }

    /// Validates one plan's steps.
    fn validate_plan(plan: &PlanConfig, field: &str, result: &mut ValidationResult) {
        if plan.steps.is_empty() {
            result
                .warnings
                .push(format!("Plan '{}' has no steps", plan.name));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, step) in plan.steps.iter().enumerate() {
            let step_field = format!("{field}.steps[{i}]");

            if step.label.trim().is_empty() {
                result.error(format!("{step_field}.label"), "Step label cannot be empty");
            } else if seen.contains(step.label.as_str()) {
                result.error(
                    format!("{step_field}.label"),
                    format!("Duplicate step label '{}' in plan '{}'", step.label, plan.name),
                );
            }

            if let Some(after) = &step.after {
                if !seen.contains(after.as_str()) {
                    result.error(
                        format!("{step_field}.after"),
                        format!(
                            "Step '{}' is triggered by '{after}', which is not an earlier step of plan '{}'",
                            step.label, plan.name
                        ),
                    );
                }
            }

            if let Some(retry) = &step.retry {
                if retry.attempts == 0 {
                    result.error(format!("{step_field}.retry.attempts"), "Retry attempts must be at least 1");
                }
            }

            if step.timeout_secs == Some(0) {
                result.error(format!("{step_field}.timeout_secs"), "Step timeout must be positive");
            }

            Self::validate_kind(step, &step_field, result);
            seen.insert(step.label.as_str());
        }
    }

    /// Validates the kind payload of a step.
    fn validate_kind(step: &StepConfig, field: &str, result: &mut ValidationResult) {
        let kinds = step.kinds();
        let kind = match kinds.as_slice() {
            [] => {
                result.error(field, format!("Step '{}' declares no resource kind", step.label));
                return;
            }
            [kind] => *kind,
            many => {
                let names: Vec<&str> = many.iter().map(StepKind::name).collect();
                result.error(
                    field,
                    format!(
                        "Step '{}' declares several resource kinds: {}",
                        step.label,
                        names.join(", ")
                    ),
                );
                return;
            }
        };

        match kind {
            StepKind::Packages(packages) => {
                if packages.is_empty() {
                    result.error(format!("{field}.packages"), "Package list cannot be empty");
                }
                if packages.iter().any(|p| p.trim().is_empty() || p.starts_with('-')) {
                    result.error(format!("{field}.packages"), "Package names must be non-empty and not start with '-'");
                }
            }
            StepKind::Service(service) => {
                if service.name.is_empty() {
                    result.error(format!("{field}.service.name"), "Service name cannot be empty");
                }
            }
            StepKind::Restart(restart) => {
                if restart.service.is_empty() {
                    result.error(format!("{field}.restart.service"), "Service name cannot be empty");
                }
                if step.after.is_none() {
                    result.warnings.push(format!(
                        "Restart step '{}' has no 'after' edge and only starts an inactive service",
                        step.label
                    ));
                }
            }
            StepKind::Cluster(cluster) => {
                if cluster.mode == ClusterMode::Agent {
                    if cluster.join_url.is_none() {
                        result.error(format!("{field}.cluster.join_url"), "Agent mode requires join_url");
                    }
                    if cluster.token_env.is_none() {
                        result.error(format!("{field}.cluster.token_env"), "Agent mode requires token_env");
                    }
                }
                if let Some(url) = &cluster.join_url {
                    if !url.starts_with("https://") {
                        result.error(format!("{field}.cluster.join_url"), "join_url must be an https:// URL");
                    }
                }
            }
            StepKind::File(file) => {
                if file.path.is_empty() {
                    result.error(format!("{field}.file.path"), "File path cannot be empty");
                }
                check_one_source(file.content.is_some(), file.source.is_some(), &format!("{field}.file"), result);
                if let Some(mode) = &file.mode {
                    if parse_mode(mode).is_none() {
                        result.error(
                            format!("{field}.file.mode"),
                            format!("Invalid octal mode '{mode}'"),
                        );
                    }
                }
            }
            StepKind::Manifest(manifest) => {
                if !is_valid_name(&manifest.name) {
                    result.error(
                        format!("{field}.manifest.name"),
                        format!("Manifest name '{}' must be lowercase alphanumeric with hyphens", manifest.name),
                    );
                }
                check_one_source(
                    manifest.content.is_some(),
                    manifest.source.is_some(),
                    &format!("{field}.manifest"),
                    result,
                );
            }
            StepKind::Release(release) => {
                if release.name.is_empty() || release.chart.is_empty() {
                    result.error(format!("{field}.release"), "Release needs a name and a chart");
                }
                if !(release.values.is_null() || release.values.is_mapping()) {
                    result.error(format!("{field}.release.values"), "Release values must be a mapping");
                }
                if !release.wait {
                    result.warnings.push(format!(
                        "Release step '{}' does not wait; its postcondition only checks the release record",
                        step.label
                    ));
                }
            }
            StepKind::Secret(secret) => {
                if secret.name.is_empty() {
                    result.error(format!("{field}.secret.name"), "Secret name cannot be empty");
                }
                match &secret.generator {
                    GeneratorConfig::Random { keys, length } => {
                        if keys.is_empty() {
                            result.error(format!("{field}.secret.generator.keys"), "Generator needs at least one key");
                        }
                        if *length == 0 {
                            result.error(format!("{field}.secret.generator.length"), "Length must be positive");
                        }
                    }
                    GeneratorConfig::FromEnv { keys } => {
                        if keys.is_empty() {
                            result.error(format!("{field}.secret.generator.keys"), "Generator needs at least one key");
                        }
                    }
                }
            }
            StepKind::Taint(taint) => {
                if taint.node.is_empty() || taint.key.is_empty() {
                    result.error(format!("{field}.taint"), "Taint needs a node and a key");
                }
            }
            StepKind::Http(http) => {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    result.error(format!("{field}.http.url"), "URL must start with http:// or https://");
                }
                if !(100..=599).contains(&http.status) {
                    result.error(format!("{field}.http.status"), "Status must be a valid HTTP status code");
                }
            }
            StepKind::Swap(_) => {}
        }
    }
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

fn check_one_source(has_content: bool, has_source: bool, field: &str, result: &mut ValidationResult) {
    if has_content == has_source {
        result.error(field, "Exactly one of 'content' or 'source' is required");
    }
}

/// Parses an octal permission string such as `"0600"`.
#[must_use]
pub fn parse_mode(mode: &str) -> Option<u32> {
    u32::from_str_radix(mode, 8).ok().filter(|m| *m <= 0o7777)
}

/// Checks whether a name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
