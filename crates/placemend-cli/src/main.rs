//! placemend CLI
//!
//! Command-line interface for healing, auditing and syncing allocations.

mod commands;

use clap::{Parser, Subcommand};
use placemend_core::{LogFormat, PlacemendConfig, ShardId};
use placemend_engine::{AuditScope, HealOptions, HealRunOptions, HealScope};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// placemend - keep workload allocations consistent with their placement
#[derive(Parser, Debug)]
#[command(name = "placemend")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Heal missing or incorrect allocations
    Heal {
        /// Only heal this instance
        #[arg(long, conflicts_with = "cell")]
        instance: Option<Uuid>,

        /// Only heal instances in this cell
        #[arg(long)]
        cell: Option<u32>,

        /// Stop after healing this many instances
        #[arg(long)]
        max_count: Option<usize>,

        /// Instances fetched per page
        #[arg(long)]
        batch_size: Option<usize>,

        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Rewrite allocations even when they already match
        #[arg(long)]
        force: bool,

        /// Leave port allocations untouched
        #[arg(long)]
        skip_port_allocations: bool,
    },

    /// Find allocations held by consumers that no longer exist
    Audit {
        /// Only audit this resource provider (name or uuid)
        #[arg(long)]
        resource_provider: Option<String>,

        /// Delete the orphaned allocations that were found
        #[arg(long)]
        delete: bool,
    },

    /// Mirror host aggregates into resource provider aggregates
    SyncAggregates,

    /// Show accelerator requests of an instance
    AcceleratorRequests {
        /// Instance uuid
        instance: Uuid,

        /// Only show requests whose binding has resolved
        #[arg(long)]
        resolved: bool,
    },
}

fn log_level(verbose: bool, configured: &str) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    match configured.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

fn init_logging(config: &PlacemendConfig, verbose: bool) {
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level(verbose, &config.logging.level))
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PlacemendConfig::from_file(path)?,
        None => PlacemendConfig::default(),
    };
    init_logging(&config, cli.verbose);

    let services = commands::Services::connect(&config).await?;

    let code = match cli.command {
        Commands::Heal {
            instance,
            cell,
            max_count,
            batch_size,
            dry_run,
            force,
            skip_port_allocations,
        } => {
            let scope = match (instance, cell) {
                (Some(uuid), _) => HealScope::Workload(uuid),
                (None, Some(id)) => HealScope::Shard(ShardId(id)),
                (None, None) => HealScope::All,
            };
            let options = HealRunOptions {
                heal: HealOptions {
                    dry_run,
                    force,
                    skip_port_allocations,
                },
                max_count: max_count.or(config.heal.max_count),
                batch_size: batch_size.unwrap_or(config.heal.batch_size),
            };
            commands::heal(&services, scope, &options, cli.json).await?
        }
        Commands::Audit {
            resource_provider,
            delete,
        } => {
            let scope = match resource_provider {
                Some(name) => AuditScope::Provider(name),
                None => AuditScope::All,
            };
            commands::audit(&services, &scope, delete, config.heal.batch_size, cli.json).await?
        }
        Commands::SyncAggregates => commands::sync_aggregates(&services, cli.json).await?,
        Commands::AcceleratorRequests { instance, resolved } => {
            commands::accelerator_requests(&services, instance, resolved, cli.json).await?
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_heal_flags() {
        let cli = Cli::try_parse_from([
            "placemend",
            "heal",
            "--cell",
            "2",
            "--max-count",
            "5",
            "--dry-run",
            "--skip-port-allocations",
        ])
        .unwrap();
        match cli.command {
            Commands::Heal {
                cell,
                max_count,
                dry_run,
                force,
                skip_port_allocations,
                ..
            } => {
                assert_eq!(cell, Some(2));
                assert_eq!(max_count, Some(5));
                assert!(dry_run);
                assert!(!force);
                assert!(skip_port_allocations);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_instance_and_cell_conflict() {
        let result = Cli::try_parse_from([
            "placemend",
            "heal",
            "--instance",
            "9b8c7a2e-3f41-4d7e-9a2b-6c1d0e5f4a3b",
            "--cell",
            "1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_audit_with_global_flags() {
        let cli = Cli::try_parse_from([
            "placemend",
            "audit",
            "--resource-provider",
            "host1",
            "--delete",
            "--json",
            "-v",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Audit { delete: true, resource_provider: Some(ref rp) } if rp == "host1"
        ));
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(true, "error"), Level::DEBUG);
        assert_eq!(log_level(false, "INFO"), Level::INFO);
        assert_eq!(log_level(false, "bogus"), Level::WARN);
    }
}
