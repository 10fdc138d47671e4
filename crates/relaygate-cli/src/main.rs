//! relaygate — secure access gateway
//!
//! Usage:
//!   relaygate serve [--config PATH]
//!   relaygate check-config [--config PATH]
//!   relaygate wal inspect <FILE>
//!   relaygate wal recover [--config PATH]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use relaygate_core::config::GatewayConfig;
use relaygate_core::index::SessionIndex;
use relaygate_core::wal::{
    JsonFileStorageWriter, RecoveredLog, SessionTranscript, WalStore, read_contents,
};
use relaygate_gateway::GatewayServer;

#[derive(Debug, Parser)]
#[command(name = "relaygate", version, about = "Secure access gateway")]
struct Cli {
    /// Config file (defaults to ~/.relaygate/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, value_name = "FILTER", default_value = "relaygate=info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the transport server and the control API
    Serve,
    /// Load and validate the config, then print a summary
    CheckConfig,
    /// Session log maintenance
    Wal {
        #[command(subcommand)]
        command: WalCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WalCommand {
    /// Print a session log as a transcript
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Commit every audit and indexer log left open by a previous run
    Recover,
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<PathBuf>) -> Result<GatewayConfig> {
    let path = match path {
        Some(path) => path,
        None => GatewayConfig::default_path().context("could not determine the home directory")?,
    };
    if !path.exists() {
        bail!("config file {} does not exist", path.display());
    }
    GatewayConfig::load(&path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Serve => serve(load_config(cli.config)?).await,
        Command::CheckConfig => check_config(&load_config(cli.config)?),
        Command::Wal { command } => match command {
            WalCommand::Inspect { file } => inspect_wal(&file),
            WalCommand::Recover => recover_wal(&load_config(cli.config)?).await,
        },
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let server = Arc::new(GatewayServer::from_config(&config).await?);
    let listener = server.bind().await?;
    let control = server.bind_control().await?;

    let control_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_control(control).await {
                error!("control API stopped: {:#}", e);
            }
        })
    };
    let signal_task = {
        let server = server.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!("failed to listen for ctrl-c: {}", e),
            }
            server.shutdown();
        })
    };

    let result = server.serve(listener).await;
    server.shutdown();
    signal_task.abort();
    if let Err(e) = control_task.await {
        warn!("control task failed: {}", e);
    }
    info!("relaygate stopped");
    result
}

fn check_config(config: &GatewayConfig) -> Result<()> {
    println!("listen:      {}", config.server.listen_addr);
    println!("control:     {}", config.server.control_addr);
    println!("wal dir:     {}", config.wal_settings().dir.display());
    println!("transcripts: {}", config.storage_dir().display());
    println!("index dir:   {}", config.index_dir().display());
    println!("identities:  {}", config.identities.len());
    println!("connections:");
    for conn in &config.connections {
        println!(
            "  {} ({}) -> agent {}",
            conn.name, conn.connection_type, conn.agent_id
        );
    }
    for plugin in &config.plugins {
        let enabled: Vec<&str> = plugin
            .connections
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.connection.as_str())
            .collect();
        println!("plugin {}: {}", plugin.name, enabled.join(", "));
    }
    println!("config ok");
    Ok(())
}

fn inspect_wal(file: &Path) -> Result<()> {
    let contents =
        read_contents(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let end_date = contents
        .footer
        .as_ref()
        .and_then(|f| f.end_date)
        .or_else(|| contents.events.last().map(|e| e.time))
        .unwrap_or(contents.header.start_date);
    let session_error = contents
        .footer
        .as_ref()
        .and_then(|f| f.commit_error.as_deref());
    let transcript =
        SessionTranscript::build(&contents.header, &contents.events, end_date, session_error);

    println!("{}", serde_json::to_string_pretty(&transcript)?);
    match &contents.footer {
        Some(footer) => eprintln!("commit status: {:?}", footer.commit_status),
        None => eprintln!("no footer, the session was not committed"),
    }
    if contents.torn_tail {
        eprintln!(
            "torn tail after {} valid bytes",
            contents.valid_len
        );
    }
    Ok(())
}

async fn recover_wal(config: &GatewayConfig) -> Result<()> {
    let writer = Arc::new(JsonFileStorageWriter::new(config.storage_dir()));
    let audit = WalStore::new(config.wal_settings(), writer);
    let mut recovered = audit
        .recover_orphans()
        .await
        .context("Failed to recover audit session logs")?;

    let index = Arc::new(SessionIndex::new(config.index_orgs_dir()));
    let indexer = WalStore::new(config.index_wal_settings(), index);
    recovered.extend(
        indexer
            .recover_orphans()
            .await
            .context("Failed to recover indexer session logs")?,
    );

    if recovered.is_empty() {
        println!("no open session logs");
    }
    for log in recovered {
        print_recovered(&log);
    }
    Ok(())
}

fn print_recovered(log: &RecoveredLog) {
    println!(
        "{} {} ({})",
        if log.committed { "committed" } else { "failed" },
        log.session_id,
        log.path.display()
    );
}
