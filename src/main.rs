use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use logwarden::config::{Config, LoggingConfig};
use logwarden::storage::{IncidentStore, LogStore, Page};

#[derive(Parser)]
#[command(
    name = "logwarden",
    about = "Buffered log ingestion with lease-guarded error spike detection",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (falls back to $LOGWARDEN_CONFIG, then /etc/logwarden/logwarden.toml)
    #[arg(long, global = true, env = "LOGWARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + flush scheduler + detector)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a single detection cycle against the database and print the outcome
    Detect,

    /// Inspect incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, newest first
    List {
        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show one incident
    Show {
        /// Incident ID
        id: Uuid,
    },

    /// List the logs attributed to an incident
    Logs {
        /// Incident ID
        id: Uuid,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = Config::discover(cli.config.as_deref())?;
    init_tracing(&config.logging);
    match &source {
        Some(path) => tracing::debug!(path = %path.display(), "Loaded configuration"),
        None => tracing::debug!("No config file found, using defaults"),
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting logwarden daemon");
            logwarden::serve(config).await?;
        }
        Commands::Detect => {
            let store = logwarden::open_store(&config)?;
            let detector = logwarden::build_detector(&config, &store)?;
            let outcome = detector.run_cycle(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Incidents { action } => {
            let store = logwarden::open_store(&config)?;

            match action {
                IncidentAction::List { page, limit } => {
                    let result = store.list(Page::new(page, limit)).await?;
                    if result.data.is_empty() {
                        println!("No incidents found.");
                    } else {
                        println!(
                            "{:<36} | {:<8} | {:<12} | {:<25} | Title",
                            "ID", "Severity", "Status", "Created"
                        );
                        println!("{:-<36}-|-{:-<8}-|-{:-<12}-|-{:-<25}-|-{:-<30}", "", "", "", "", "");
                        for incident in &result.data {
                            println!(
                                "{:<36} | {:<8} | {:<12} | {:<25} | {}",
                                incident.id,
                                incident.severity,
                                incident.status,
                                incident.created_at.to_rfc3339(),
                                incident.title
                            );
                        }
                        println!(
                            "\nPage {} of {} ({} incidents)",
                            result.meta.page, result.meta.total_pages, result.meta.total
                        );
                    }
                }
                IncidentAction::Show { id } => {
                    let incident = store
                        .get(id)
                        .await?
                        .with_context(|| format!("incident {} not found", id))?;
                    println!("{}", serde_json::to_string_pretty(&incident)?);
                }
                IncidentAction::Logs { id, page, limit } => {
                    let result = store.logs_for_incident(id, Page::new(page, limit)).await?;
                    if result.data.is_empty() {
                        println!("No logs attributed to incident {}.", id);
                    } else {
                        for log in &result.data {
                            println!(
                                "{} {:<5} [{}] {}",
                                log.timestamp.to_rfc3339(),
                                log.level,
                                log.service_id,
                                log.message
                            );
                        }
                        println!(
                            "\nPage {} of {} ({} logs)",
                            result.meta.page, result.meta.total_pages, result.meta.total
                        );
                    }
                }
            }
        }
        Commands::Config => {
            match &source {
                Some(path) => println!("# loaded from {}", path.display()),
                None => println!("# built-in defaults"),
            }
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
