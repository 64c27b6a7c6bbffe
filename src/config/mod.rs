//! Configuration module for kubeconverge.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `kubeconverge.yaml`
//! - Validation of plans and steps
//! - Content hashing for checksum comparison

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ClusterConfig, ClusterMode, ConvergeConfig, FileConfig, GeneratorConfig, HttpConfig,
    ManifestConfig, PackageManager, PlanConfig, ReleaseConfig, RestartConfig, RetryConfig,
    SecretConfig, ServiceConfig, Settings, StepConfig, StepKind, SwapConfig, TaintConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file, user_config_dir};
pub use validator::{ConfigValidator, ValidationResult, parse_mode};
pub use hash::ContentHasher;
