/*!
Keepsafe CLI - operator commands for the Keepsafe backup engine.

Creates, lists, verifies and restores backups, runs retention, and runs the
scheduler daemon. Every command reads the same TOML configuration file.

Exit codes: `create` returns 0 when the job succeeded and 1 when it failed;
`restore` returns 0 when the restore completed (or a dry run was staged), 2
for a partial restore, and 1 for any other failure.
*/

use clap::{Parser, Subcommand};
use keepsafe_core::{
    init_observability, BackupEngine, BackupError, EngineConfig, LogOptions, Manifest,
    RestoreRequest, RestoreState, Tier,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keepsafe")]
#[command(about = "Scheduled, verified backups with tiered retention")]
#[command(version)]
struct Cli {
    /// Path to the engine configuration
    #[arg(short, long, global = true, env = "KEEPSAFE_CONFIG", default_value = "/etc/keepsafe/keepsafe.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of tables and emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup now and wait for it to finish
    Create {
        /// Label stored in the manifest
        #[arg(short, long)]
        name: Option<String>,
        /// Retention tier for the backup
        #[arg(short, long, default_value = "manual")]
        tier: Tier,
        /// Domain to include; repeat for several (default: all)
        #[arg(short, long = "domain")]
        domains: Vec<String>,
    },
    /// List backups, newest first
    List {
        /// Only show one tier
        #[arg(short, long)]
        tier: Option<Tier>,
    },
    /// Show the manifest of one backup
    Show {
        #[arg(short, long)]
        backup: String,
    },
    /// Restore a backup onto the live domains
    Restore {
        #[arg(short, long)]
        backup: String,
        /// Validate and stage only; no domain is touched
        #[arg(long)]
        dry_run: bool,
        /// Domain to restore; repeat for several (default: all in the backup)
        #[arg(short, long = "domain")]
        domains: Vec<String>,
        /// Destination to read the backup from
        #[arg(short, long)]
        source: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Re-read and re-hash every stored copy of a backup
    Verify {
        #[arg(short, long)]
        backup: String,
    },
    /// Run one retention pass
    Sweep,
    /// Show the job audit history
    History {
        /// Show the restore log instead
        #[arg(long)]
        restores: bool,
        /// Only show the most recent entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Inspect or clear destination health
    Destinations {
        #[command(subcommand)]
        command: DestinationCommands,
    },
    /// Run the scheduler and periodic retention until interrupted
    Run,
}

#[derive(Subcommand)]
enum DestinationCommands {
    /// Show every configured destination and its health
    List,
    /// Accept new copies on an unhealthy destination again
    Clear { name: String },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Backup ID")]
    id: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Domains")]
    domains: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Copies")]
    copies: String,
    #[tabled(rename = "Name")]
    name: String,
}

impl From<&Manifest> for BackupRow {
    fn from(manifest: &Manifest) -> Self {
        Self {
            id: manifest.backup_id.clone(),
            tier: manifest.tier.to_string(),
            created: format_timestamp(manifest.created_at),
            domains: manifest.domain_names().join(", "),
            size: format_size(manifest.stored_size_bytes),
            copies: manifest
                .destinations
                .iter()
                .map(|r| r.destination_name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            name: manifest.name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job ID")]
    id: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Triggered")]
    triggered: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Backup ID")]
    backup_id: String,
    #[tabled(rename = "Failure")]
    failure: String,
}

#[derive(Tabled)]
struct RestoreRow {
    #[tabled(rename = "Backup ID")]
    backup_id: String,
    #[tabled(rename = "Requested")]
    requested: String,
    #[tabled(rename = "Dry run")]
    dry_run: bool,
    #[tabled(rename = "Final state")]
    state: String,
    #[tabled(rename = "Applied")]
    applied: String,
    #[tabled(rename = "Failure")]
    failure: String,
}

#[derive(Tabled)]
struct DestinationRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Healthy")]
    healthy: bool,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_observability(&LogOptions {
        json: cli.json,
        verbose: cli.verbose,
    }) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, anyhow::Error> {
    let config = EngineConfig::load(&cli.config)?;
    let engine = BackupEngine::from_config(config).await?;

    let code = match cli.command {
        Commands::Create { name, tier, domains } => {
            create_backup(&engine, tier, &domains, name.as_deref(), cli.json).await?
        }
        Commands::List { tier } => {
            list_backups(&engine, tier, cli.json)?;
            ExitCode::SUCCESS
        }
        Commands::Show { backup } => {
            let manifest = engine.show_backup(&backup)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            ExitCode::SUCCESS
        }
        Commands::Restore {
            backup,
            dry_run,
            domains,
            source,
            yes,
        } => {
            let mut request = RestoreRequest::new(backup).dry_run(dry_run);
            if !domains.is_empty() {
                request = request.domains(domains);
            }
            if let Some(source) = source {
                request = request.from_destination(source);
            }
            restore_backup(&engine, &request, yes, cli.json).await?
        }
        Commands::Verify { backup } => verify_backup(&engine, &backup, cli.json).await?,
        Commands::Sweep => {
            let report = engine.sweep().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Considered {} backups: {} evicted, {} partially evicted, {} in use by a restore",
                    report.considered,
                    report.evicted.len(),
                    report.partially_evicted.len(),
                    report.skipped_for_restore.len()
                );
                for id in &report.evicted {
                    println!("  evicted {id}");
                }
                for id in &report.partially_evicted {
                    println!("  kept {id} (some copies could not be deleted)");
                }
            }
            ExitCode::SUCCESS
        }
        Commands::History { restores, limit } => {
            show_history(&engine, restores, limit, cli.json)?;
            ExitCode::SUCCESS
        }
        Commands::Destinations { command } => {
            match command {
                DestinationCommands::List => list_destinations(&engine, cli.json)?,
                DestinationCommands::Clear { name } => {
                    engine.clear_destination(&name)?;
                    println!("✓ Destination '{name}' accepts new copies again");
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Run => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received");
                }
                signal.cancel();
            });
            engine.run(shutdown).await?;
            ExitCode::SUCCESS
        }
    };

    engine.shutdown().await;
    Ok(code)
}

async fn create_backup(
    engine: &BackupEngine,
    tier: Tier,
    domains: &[String],
    name: Option<&str>,
    json: bool,
) -> Result<ExitCode, anyhow::Error> {
    let handle = match engine.submit(tier, domains, name) {
        Ok(handle) => handle,
        Err(e @ BackupError::JobConflict { .. }) => {
            eprintln!("✗ {e}");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };
    let job_id = handle.job_id().to_string();
    info!(job_id = %job_id, "Backup job submitted");

    match handle.wait().await {
        Ok(manifest) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("✓ Backup {} created", manifest.backup_id);
                println!("  Job: {job_id}");
                println!("  Domains: {}", manifest.domain_names().join(", "));
                println!("  Size: {}", format_size(manifest.stored_size_bytes));
                for reference in &manifest.destinations {
                    println!("  Copy: {} ({})", reference.destination_name, reference.remote_path);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("✗ Backup job {job_id} failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn list_backups(engine: &BackupEngine, tier: Option<Tier>, json: bool) -> Result<(), anyhow::Error> {
    let manifests: Vec<Manifest> = engine
        .list_backups()?
        .into_iter()
        .filter(|m| tier.map_or(true, |t| m.tier == t))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
    } else if manifests.is_empty() {
        println!("No backups found");
    } else {
        let rows: Vec<BackupRow> = manifests.iter().map(BackupRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn restore_backup(
    engine: &BackupEngine,
    request: &RestoreRequest,
    yes: bool,
    json: bool,
) -> Result<ExitCode, anyhow::Error> {
    if !request.dry_run && !yes && !confirm(&format!(
        "Restore backup '{}' over the live domains? (y/N): ",
        request.backup_id
    ))? {
        println!("Restore cancelled");
        return Ok(ExitCode::FAILURE);
    }

    match engine.restore(request).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match report.state {
                    RestoreState::Staged => {
                        println!("✓ Dry run: backup {} validated and staged from '{}'", report.backup_id, report.source);
                        for entry in &report.planned {
                            println!(
                                "  would restore {} ({})",
                                entry.domain,
                                format_size(entry.size_bytes)
                            );
                        }
                    }
                    RestoreState::Completed => {
                        println!("✓ Restored {}: {}", report.backup_id, report.applied.join(", "));
                    }
                    state => {
                        println!("✗ Restore {state}: rolled back {}", report.rolled_back.join(", "));
                        if let Some(failure) = &report.failure {
                            println!("  Cause: {failure}");
                        }
                    }
                }
            }
            Ok(match report.state {
                RestoreState::Completed | RestoreState::Staged => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
        Err(e @ BackupError::PartialRestore { .. }) => {
            eprintln!("✗ {e}");
            eprintln!("  The domains listed as restored now hold backup data; the rest are unchanged.");
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            eprintln!("✗ Restore failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn verify_backup(engine: &BackupEngine, backup_id: &str, json: bool) -> Result<ExitCode, anyhow::Error> {
    let results = engine.verify_backup(backup_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            match &result.error {
                None => println!("✓ {} {}", result.destination, result.remote_path),
                Some(error) => println!("✗ {} {}: {error}", result.destination, result.remote_path),
            }
        }
    }
    Ok(if results.iter().all(|r| r.verified) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn show_history(engine: &BackupEngine, restores: bool, limit: Option<usize>, json: bool) -> Result<(), anyhow::Error> {
    if restores {
        let mut records = engine.restore_history()?;
        truncate_to_latest(&mut records, limit);
        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            let rows: Vec<RestoreRow> = records
                .into_iter()
                .map(|r| RestoreRow {
                    backup_id: r.backup_id,
                    requested: format_timestamp(r.requested_at),
                    dry_run: r.dry_run,
                    state: r.final_state,
                    applied: r.applied.join(", "),
                    failure: r.failure.unwrap_or_default(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        return Ok(());
    }

    let mut jobs = engine.job_history()?;
    truncate_to_latest(&mut jobs, limit);
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else {
        let rows: Vec<JobRow> = jobs
            .into_iter()
            .map(|j| JobRow {
                id: j.id,
                tier: j.tier.to_string(),
                triggered: format_timestamp(j.triggered_at),
                status: j.status.to_string(),
                backup_id: j.backup_id.unwrap_or_default(),
                failure: j.failure.unwrap_or_default(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn list_destinations(engine: &BackupEngine, json: bool) -> Result<(), anyhow::Error> {
    let statuses = engine.destination_statuses();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    let rows: Vec<DestinationRow> = statuses
        .into_iter()
        .map(|s| DestinationRow {
            name: s.name,
            kind: s.kind.to_string(),
            healthy: s.healthy,
            reason: s.reason.unwrap_or_default(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

/// Histories come newest first; keep the first `limit`
fn truncate_to_latest<T>(entries: &mut Vec<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
}

fn confirm(prompt: &str) -> Result<bool, anyhow::Error> {
    print!("{prompt}");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
