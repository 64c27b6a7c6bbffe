//! kubeconverge CLI entrypoint.
//!
//! This is the main entrypoint for the kubeconverge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use kubeconverge::cli::{Cli, Commands, LockCommands, OutputFormatter};
use kubeconverge::config::{
    ConfigParser, ConfigValidator, ConvergeConfig, PlanConfig, find_config_file,
};
use kubeconverge::error::{ConfigError, ConvergeError, Result, StateError};
use kubeconverge::planner::{FailurePolicy, Plan, PlanBuilder};
use kubeconverge::reconciler::{Reconciler, RunReport, run_concurrently};
use kubeconverge::state::{LocalRunStore, RunStore};
use kubeconverge::system::SystemContext;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of a run that failed or aborted.
const EXIT_RUN_FAILED: u8 = 2;

/// Plan file written by `init`.
const PLAN_TEMPLATE: &str = include_str!("../templates/kubeconverge.yaml");

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Plan { plan } => cmd_plan(config, plan.as_deref(), &formatter).await,
        Commands::Apply {
            plan,
            yes,
            continue_on_error,
            parallel,
        } => {
            let options = ApplyOptions {
                plan,
                yes,
                continue_on_error,
                parallel,
            };
            cmd_apply(config, &options, &formatter).await
        }
        Commands::History { limit } => cmd_history(config, limit, &formatter).await,
        Commands::Lock { command } => cmd_lock(config, command, &formatter).await,
    }
}

/// Flags of the apply command.
struct ApplyOptions {
    plan: Option<String>,
    yes: bool,
    continue_on_error: bool,
    parallel: bool,
}

/// Plan file with the directory it was loaded from.
struct Loaded {
    config: ConvergeConfig,
    base: PathBuf,
}

/// Write a template plan file.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing plan file in: {}", path.display());

    let config_path = path.join("kubeconverge.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Plan file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, PLAN_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    // Keep secrets and local state out of version control
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".kubeconverge") {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# kubeconverge")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".kubeconverge") {
                writeln!(file, ".kubeconverge/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.kubeconverge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Edit kubeconverge.yaml to describe your node");
    eprintln!("  2. Run 'kubeconverge validate' to check it");
    eprintln!("  3. Run 'kubeconverge plan' to see what would change");
    eprintln!("  4. Run 'kubeconverge apply' to converge");

    Ok(ExitCode::SUCCESS)
}

/// Validate the plan file, reporting every problem.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating plan file: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);

    if result.is_valid() {
        eprintln!("Plan file is valid!");
    } else {
        eprintln!("Plan file has {} error(s):", result.errors.len());
        for error in &result.errors {
            eprintln!("  - {}: {}", error.field, error.message);
        }
    }

    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nSummary:");
    for plan in &config.plans {
        eprintln!("  {} ({} steps, policy {})", plan.name, plan.steps.len(), plan.policy);
    }

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Probe every step of the selected plans without acting.
async fn cmd_plan(
    config_path: Option<&Path>,
    only: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let loaded = load_config(config_path)?;
    let plans = build_plans(&loaded, only)?;

    for (plan, _) in &plans {
        emit(&preview(plan, formatter).await);
    }

    Ok(ExitCode::SUCCESS)
}

/// Converge the selected plans.
async fn cmd_apply(
    config_path: Option<&Path>,
    options: &ApplyOptions,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let loaded = load_config(config_path)?;
    let mut plans = build_plans(&loaded, options.plan.as_deref())?;

    if options.continue_on_error {
        for (_, policy) in &mut plans {
            *policy = FailurePolicy::Continue;
        }
    }

    // Confirm
    if !options.yes {
        for (plan, _) in &plans {
            emit(&preview(plan, formatter).await);
        }

        eprint!("Do you want to apply these plans? [y/N]: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let store: Arc<dyn RunStore> =
        Arc::new(LocalRunStore::new(loaded.config.settings.state_dir_path(&loaded.base)));
    let cancel = cancel_on_interrupt();

    let results = if options.parallel {
        run_concurrently(plans, Some(store), cancel).await
    } else {
        let mut results = Vec::with_capacity(plans.len());
        for (plan, policy) in &plans {
            let result = Reconciler::new(*policy)
                .with_store(store.as_ref())
                .with_cancellation(cancel.clone())
                .run(plan)
                .await;
            let stop = !result.as_ref().is_ok_and(|r| r.status.is_success())
                && *policy == FailurePolicy::Abort;
            results.push(result);
            if stop {
                warn!("Plan '{}' did not converge; skipping remaining plans", plan.name());
                break;
            }
        }
        results
    };

    Ok(report_results(&results, formatter))
}

/// Show recorded runs.
async fn cmd_history(
    config_path: Option<&Path>,
    limit: usize,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let store = open_store(config_path)?;
    let history = store.load_history().await?;

    emit(&formatter.format_history(&history.recent(limit)));
    Ok(ExitCode::SUCCESS)
}

/// Lock management commands.
async fn cmd_lock(
    config_path: Option<&Path>,
    command: LockCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let store = open_store(config_path)?;

    match command {
        LockCommands::Show { plan } => {
            let info = store.lock_info(&plan).await?;
            emit(&formatter.format_lock(&plan, info.as_ref()));
        }
        LockCommands::Unlock { plan, force } => {
            match store.lock_info(&plan).await {
                Ok(Some(info)) if !info.is_expired() && !force => {
                    return Err(ConvergeError::State(StateError::LockedByOther {
                        plan,
                        holder: info.holder,
                        since: info.acquired_at.to_rfc3339(),
                    }));
                }
                Ok(_) => {}
                Err(e) if force => warn!("Removing unreadable lock: {e}"),
                Err(e) => return Err(e),
            }

            if store.force_unlock(&plan).await? {
                eprintln!("Plan '{plan}' unlocked.");
            } else {
                eprintln!("Plan '{plan}' was not locked.");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the plan file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Creates a parser rooted at the plan file's directory.
fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(base_dir(config_file))
}

/// Directory containing the plan file.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads, validates and resolves the plan file.
fn load_config(config_path: Option<&Path>) -> Result<Loaded> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading plan file from: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;

    let mut config = parser.load_with_env(&config_file)?;

    // Validate
    let validator = ConfigValidator::new();
    let result = validator.validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    parser.resolve_sources(&mut config)?;

    Ok(Loaded {
        config,
        base: base_dir(&config_file),
    })
}

/// Opens the run store of the plan file's state directory.
fn open_store(config_path: Option<&Path>) -> Result<LocalRunStore> {
    let config_file = resolve_config_path(config_path)?;
    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    Ok(LocalRunStore::new(config.settings.state_dir_path(&base_dir(&config_file))))
}

/// Builds the selected plans with their configured failure policies.
fn build_plans(loaded: &Loaded, only: Option<&str>) -> Result<Vec<(Plan, FailurePolicy)>> {
    let selected: Vec<&PlanConfig> = match only {
        Some(name) => {
            let plan = loaded.config.plans.iter().find(|p| p.name == name).ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation(format!("Unknown plan '{name}'"), "plan"))
            })?;
            vec![plan]
        }
        None => loaded.config.plans.iter().collect(),
    };

    let ctx = SystemContext::from_settings(&loaded.config.settings, &loaded.base)?;
    let builder = PlanBuilder::new(&loaded.config.settings, ctx);

    selected
        .into_iter()
        .map(|config| Ok((builder.build(config)?, config.policy)))
        .collect()
}

/// Probes every step of a plan and formats the result.
async fn preview(plan: &Plan, formatter: &OutputFormatter) -> String {
    let mut previews = Vec::with_capacity(plan.len());
    for step in plan.steps() {
        previews.push(step.preview().await);
    }
    formatter.format_preview(plan.name(), &previews)
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            token.cancel();
        }
    });

    cancel
}

/// Prints run results and picks the exit code.
fn report_results(results: &[Result<RunReport>], formatter: &OutputFormatter) -> ExitCode {
    let mut failed = false;

    for result in results {
        match result {
            Ok(report) => {
                emit(&formatter.format_report(report));
                failed |= !report.status.is_success();
            }
            Err(e) => {
                eprintln!("Error: {e}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::from(EXIT_RUN_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

/// Writes formatted output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(output.as_bytes());
    if !output.ends_with('\n') {
        let _ = stdout.write_all(b"\n");
    }
}
