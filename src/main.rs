use anyhow::{Context, Result};
use citadel_backup::config::Settings;
use citadel_backup::context::AppContext;
use citadel_backup::core::{
    ArchiveEngineType, BackupManager, BackupSchedule, BackupType, EnhancedBackupManager,
    JobStatus, Rollout,
};
use citadel_backup::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use figment::providers::Serialized;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "citadel-backup")]
#[command(about = "Backup manager for locally hosted LLM models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to /etc/citadel/backup.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a directory and wait for the job to finish
    Create(CreateArgs),
    /// Audit an existing backup directory
    Verify {
        path: PathBuf,
        /// Fraction of files to read back (0.0-1.0)
        sample_rate: Option<f64>,
    },
    /// Remove backups older than the retention window
    Cleanup { days: Option<u32> },
    /// Show job counts for this process
    Status,
    /// Back up one model by name
    Model(ModelArgs),
    /// Back up every configured model in order
    Rollout(RolloutArgs),
    /// Print the effective settings
    Config,
}

#[derive(Args)]
struct CreateArgs {
    source: PathBuf,

    #[arg(default_value = "incremental")]
    backup_type: BackupType,

    #[arg(long)]
    engine: Option<ArchiveEngineType>,
}

#[derive(Args)]
struct ModelArgs {
    name: String,

    #[arg(long = "type", default_value = "daily")]
    schedule: BackupSchedule,

    #[arg(long)]
    test_mode: bool,
}

#[derive(Args)]
struct RolloutArgs {
    #[arg(long = "type", default_value = "daily")]
    schedule: BackupSchedule,

    /// Use a reduced subset for the first model
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut figment = Settings::figment(cli.config.as_deref());
    if let Commands::Create(CreateArgs {
        engine: Some(engine),
        ..
    }) = &cli.command
    {
        figment = figment.merge(Serialized::default("backup.engine", engine));
    }
    let settings = Settings::from_figment(figment).context("Failed to load settings")?;

    let log_file = settings
        .paths
        .app_logs
        .is_dir()
        .then(|| settings.log_file());
    logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
        file: log_file,
    });

    let ctx = AppContext::new(settings);

    match cli.command {
        Commands::Create(args) => run_create(ctx, args).await,
        Commands::Verify { path, sample_rate } => run_verify(ctx, path, sample_rate).await,
        Commands::Cleanup { days } => run_cleanup(ctx, days).await,
        Commands::Status => run_status(ctx).await,
        Commands::Model(args) => run_model(ctx, args).await,
        Commands::Rollout(args) => run_rollout(ctx, args).await,
        Commands::Config => run_config(&ctx),
    }
}

async fn run_create(ctx: AppContext, args: CreateArgs) -> Result<ExitCode> {
    let manager = BackupManager::new(ctx);
    let job = manager.create_backup(&args.source, args.backup_type).await;

    println!("Created backup job: {}", job.job_id);
    println!("Source: {}", job.source_path.display());
    println!("Destination: {}", job.destination_path.display());
    println!("Type: {}", job.backup_type);

    manager.wait_for_workers().await;

    let job = manager
        .job(&job.job_id)
        .await
        .context("Backup job missing from ledger")?;
    print_json(&job)?;

    Ok(exit_code(job.status == JobStatus::Completed))
}

async fn run_verify(ctx: AppContext, path: PathBuf, sample_rate: Option<f64>) -> Result<ExitCode> {
    let manager = BackupManager::new(ctx);
    let result = manager.verify_backup(&path, sample_rate).await;
    print_json(&result)?;
    Ok(exit_code(result.is_valid))
}

async fn run_cleanup(ctx: AppContext, days: Option<u32>) -> Result<ExitCode> {
    let manager = BackupManager::new(ctx);
    let removed = manager.cleanup_old_backups(days).await;

    println!("Removed {} old backups", removed.len());
    for path in &removed {
        println!("  {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_status(ctx: AppContext) -> Result<ExitCode> {
    let manager = BackupManager::new(ctx);
    print_json(&manager.get_backup_status().await)?;
    Ok(ExitCode::SUCCESS)
}

async fn run_model(ctx: AppContext, args: ModelArgs) -> Result<ExitCode> {
    let manager = EnhancedBackupManager::new(ctx)?;
    let result = manager
        .create_model_backup(&args.name, args.schedule, args.test_mode)
        .await;

    println!("{}", result.message);
    print_json(&result)?;
    Ok(exit_code(result.success))
}

async fn run_rollout(ctx: AppContext, args: RolloutArgs) -> Result<ExitCode> {
    let manager = EnhancedBackupManager::new(ctx)?;
    let report = Rollout::new(&manager).run(args.schedule, args.test_mode).await;

    for result in &report.results {
        let model = result.model_name.as_deref().unwrap_or("?");
        let mark = if result.success { "ok" } else { "FAILED" };
        println!("[{}] {}: {}", mark, model, result.message);
        if result.success {
            println!(
                "    duration {:.2}s, files {}, bytes {}",
                result.duration_seconds, result.files_processed, result.bytes_processed
            );
            if let Some(ratio) = result.compression_ratio {
                println!("    compression {:.2}%", ratio * 100.0);
            }
        }
    }

    if report.aborted {
        println!("Rollout stopped after the first model failed");
    } else {
        println!(
            "Rollout completed: {}/{} models backed up",
            report.succeeded(),
            report.results.len()
        );
    }

    Ok(exit_code(!report.aborted))
}

fn run_config(ctx: &AppContext) -> Result<ExitCode> {
    let rendered = toml::to_string_pretty(ctx.settings.as_ref())
        .context("Failed to render settings")?;
    print!("{}", rendered);
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
