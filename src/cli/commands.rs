//! CLI command definitions for quotaflow.
//!
//! `run` drives one batch end to end: load credentials, submit the items,
//! run the scheduler until the job finishes, then print a JSON summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::credentials::{CredentialPool, CredentialStore};
use crate::fetcher::HttpFetcher;
use crate::scheduler::{JobConfig, JobDetails, JobPriority};
use crate::service::Service;
use crate::storage::SqliteStore;
use crate::validation::{validate_and_clean, ItemFormat};

/// How often `run` checks the job while waiting.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Quota-aware batch processor for credential-limited lookups.
#[derive(Parser)]
#[command(name = "quotaflow")]
#[command(about = "Process item batches through a pool of rate-limited credentials")]
#[command(version)]
#[command(
    long_about = "quotaflow schedules batches of lookups across a pool of quota-limited credentials,\nrotating credentials, honoring daily quotas, and recording every failure.\n\nExample usage:\n  quotaflow run --items emails.txt --credentials tokens.txt --priority high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. QUOTAFLOW_* variables override its values.
    #[arg(short, long, global = true, env = "QUOTAFLOW_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit an items file and process it to completion.
    Run(RunArgs),

    /// Manage stored credentials.
    #[command(alias = "creds")]
    Credentials(CredentialsArgs),

    /// Check an items file without submitting it.
    Validate(ValidateArgs),

    /// Print the effective configuration as YAML.
    Config,
}

/// Arguments for `quotaflow run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File with one item per line.
    #[arg(short, long)]
    pub items: PathBuf,

    /// Credentials file to import before processing.
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Job priority (low, normal, high, urgent).
    #[arg(short, long, default_value = "normal")]
    pub priority: String,

    /// Seconds to wait between items.
    #[arg(long)]
    pub delay: Option<f64>,

    /// Consecutive requests per credential before rotating.
    #[arg(long)]
    pub requests_per_credential: Option<u32>,

    /// Stop the job at the first failed item.
    #[arg(long)]
    pub stop_on_error: bool,

    /// Require items to be email addresses.
    #[arg(long)]
    pub email: bool,

    /// Lookup endpoint (overrides QUOTAFLOW_FETCH_ENDPOINT).
    #[arg(long)]
    pub endpoint: Option<String>,

    /// SQLite URL (overrides QUOTAFLOW_DATABASE_URL).
    #[arg(long)]
    pub database_url: Option<String>,

    /// Write all results and errors to this JSON file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `quotaflow credentials`.
#[derive(Parser, Debug)]
pub struct CredentialsArgs {
    /// SQLite URL (overrides QUOTAFLOW_DATABASE_URL).
    #[arg(long)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: CredentialsSubcommand,
}

/// Credential subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CredentialsSubcommand {
    /// Add one credential.
    Add {
        /// The secret value.
        secret: String,

        /// Explicit id; generated from the secret when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// Import every credential found in a file.
    Import {
        /// Credentials file.
        path: PathBuf,
    },

    /// Print pool status as JSON.
    List,

    /// Remove a credential.
    Remove {
        /// Credential id.
        id: String,
    },

    /// Re-enable a deactivated credential.
    Reactivate {
        /// Credential id.
        id: String,
    },
}

/// Arguments for `quotaflow validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// File with one item per line.
    pub items: PathBuf,

    /// Require items to be email addresses.
    #[arg(long)]
    pub email: bool,
}

/// Summary printed by `quotaflow run`.
#[derive(Debug, Serialize)]
struct RunOutput {
    job: JobDetails,
    rejected_items: Vec<String>,
    interrupted: bool,
    results_file: Option<String>,
}

/// Summary printed by `quotaflow validate`.
#[derive(Debug, Serialize)]
struct ValidateOutput {
    total: usize,
    valid: usize,
    invalid: Vec<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_batch_command(config, args).await,
        Commands::Credentials(args) => run_credentials_command(config, args).await,
        Commands::Validate(args) => run_validate_command(args),
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

/// Reads an items file, skipping blank lines.
fn read_items(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read items file {}: {}", path.display(), e))?;

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

fn item_format(email: bool) -> ItemFormat {
    if email {
        ItemFormat::Email
    } else {
        ItemFormat::Any
    }
}

async fn run_batch_command(mut config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.endpoint.is_some() {
        config.fetch_endpoint = args.endpoint.clone();
    }
    if args.database_url.is_some() {
        config.database_url = args.database_url.clone();
    }

    let priority: JobPriority = args.priority.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let items = read_items(&args.items)?;

    let fetcher = HttpFetcher::new(config.require_fetch_endpoint()?)?;
    let service = Service::from_config(&config, Arc::new(fetcher)).await?;

    if let Some(path) = &args.credentials {
        service.import_credentials_file(path).await?;
    }
    if service.pool().is_empty().await {
        return Err(anyhow::anyhow!(
            "No credentials available. Pass --credentials or import some with `quotaflow credentials import`."
        ));
    }

    let mut job_config = JobConfig::default();
    if let Some(delay) = args.delay {
        job_config = job_config.with_delay_seconds(delay);
    }
    if let Some(requests) = args.requests_per_credential {
        job_config = job_config.with_requests_per_credential(requests);
    }
    if args.stop_on_error {
        job_config = job_config.with_stop_on_error(true);
    }

    let submission = service
        .submit_with_format(&items, priority, job_config, item_format(args.email))
        .await?;
    info!(
        job_id = %submission.job_id,
        accepted = submission.accepted,
        rejected = submission.rejected.len(),
        "Submitted job"
    );

    service.start_scheduler().await?;

    let job_id = submission.job_id;
    let interrupted = tokio::select! {
        result = service.wait_for_job(job_id, WAIT_POLL_INTERVAL) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupted, stopping scheduler");
            true
        }
    };

    if let Err(e) = service.stop_scheduler().await {
        warn!(error = %e, "Scheduler did not shut down cleanly");
    }

    let results_file = match &args.output {
        Some(path) => {
            let results = service.job_results(job_id, None).await?;
            std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
            Some(path.display().to_string())
        }
        None => None,
    };

    let output = RunOutput {
        job: service.job_details(job_id).await?,
        rejected_items: submission.rejected,
        interrupted,
        results_file,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_credentials_command(config: AppConfig, args: CredentialsArgs) -> anyhow::Result<()> {
    let url = args
        .database_url
        .or(config.database_url.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("Credential commands need --database-url or QUOTAFLOW_DATABASE_URL")
        })?;

    let store = SqliteStore::connect(&url).await?;
    let pool = CredentialPool::with_store(
        config.pool_config(),
        Arc::new(store) as Arc<dyn CredentialStore>,
    );
    pool.load_from_store().await?;

    match args.command {
        CredentialsSubcommand::Add { secret, id } => {
            let id = pool.add(&secret, id.as_deref()).await?;
            println!("{}", id);
        }
        CredentialsSubcommand::Import { path } => {
            let content = std::fs::read_to_string(&path)?;
            let secrets = crate::credentials::parse_credentials(&content);
            if secrets.is_empty() {
                return Err(anyhow::anyhow!("No credentials found in {}", path.display()));
            }
            let report = pool.add_many(&secrets).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        CredentialsSubcommand::List => {
            let status = pool.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CredentialsSubcommand::Remove { id } => {
            if !pool.remove(&id).await {
                return Err(anyhow::anyhow!("Credential '{}' not found", id));
            }
            println!("Removed {}", id);
        }
        CredentialsSubcommand::Reactivate { id } => {
            if !pool.reactivate(&id).await {
                return Err(anyhow::anyhow!("Credential '{}' not found", id));
            }
            println!("Reactivated {}", id);
        }
    }

    Ok(())
}

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let items = read_items(&args.items)?;
    let report = validate_and_clean(&items, item_format(args.email));

    let output = ValidateOutput {
        total: items.len(),
        valid: report.clean.len(),
        invalid: report.invalid,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["quotaflow", "run", "--items", "items.txt"])
            .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.items, PathBuf::from("items.txt"));
                assert_eq!(args.priority, "normal");
                assert!(args.credentials.is_none());
                assert!(!args.stop_on_error);
                assert!(!args.email);
                assert!(args.output.is_none());
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "quotaflow",
            "--log-level",
            "debug",
            "run",
            "-i",
            "items.txt",
            "--credentials",
            "tokens.txt",
            "-p",
            "urgent",
            "--delay",
            "0.5",
            "--requests-per-credential",
            "3",
            "--stop-on-error",
            "--email",
            "-o",
            "out.json",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.priority, "urgent");
                assert_eq!(args.delay, Some(0.5));
                assert_eq!(args.requests_per_credential, Some(3));
                assert!(args.stop_on_error);
                assert!(args.email);
                assert_eq!(args.output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_credentials_subcommands() {
        let cli = Cli::try_parse_from([
            "quotaflow",
            "creds",
            "--database-url",
            "sqlite://q.db",
            "add",
            "secret",
            "--id",
            "main",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Credentials(args) => {
                assert_eq!(args.database_url.as_deref(), Some("sqlite://q.db"));
                match args.command {
                    CredentialsSubcommand::Add { secret, id } => {
                        assert_eq!(secret, "secret");
                        assert_eq!(id.as_deref(), Some("main"));
                    }
                    other => panic!("Expected Add, got {:?}", other),
                }
            }
            _ => panic!("Expected Credentials command"),
        }
    }

    #[test]
    fn test_read_items_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.txt");
        std::fs::write(&path, "a@example.com\n\n  \nb@example.com\r\n").unwrap();

        let items = read_items(&path).unwrap();
        assert_eq!(items, vec!["a@example.com", "b@example.com"]);
        assert!(read_items(&dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_validate_output_serialization() {
        let output = ValidateOutput {
            total: 2,
            valid: 1,
            invalid: vec!["Item is empty".to_string()],
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"valid\":1"));
    }
}
