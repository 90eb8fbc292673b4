mod cli;

use crate::cli::Cli;
use anyhow::{Context, Result};
use clap::Parser;
use pkgops::{
    Config, EventTransport, JsonFileWarningStore, LocalEventBus, MemoryWarningStore, Operation,
    OperationManager, OperationStatus, OutputLine, OutputSource, ProcessSupervisor, RegistryChange,
    WarningConfigStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pkgops={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn print_line(operation_id: &str, line: &OutputLine) {
    match line.source {
        OutputSource::Command => println!("[{}] $ {}", operation_id, line.line),
        OutputSource::Stdout => println!("[{}] {}", operation_id, line.line),
        OutputSource::Stderr => eprintln!("[{}] {}", operation_id, line.line),
        // Shown by `report` once the operation settles.
        OutputSource::Success | OutputSource::Error => {}
    }
}

fn report(op: &Operation) {
    match op.status {
        OperationStatus::Success => println!("[{}] ✔ {}", op.id, op.summary_message()),
        _ => eprintln!("[{}] ✘ {}", op.id, op.summary_message()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting pkgops");
    tracing::debug!("Loaded configuration: {:?}", config);

    if which::which(&config.package_manager).is_err() {
        tracing::warn!(
            package_manager = %config.package_manager,
            "Package manager is not installed or not in PATH. Package operations will fail to start."
        );
    }

    let config = Arc::new(config);
    let transport: Arc<dyn EventTransport> = Arc::new(LocalEventBus::new());
    let supervisor = Arc::new(ProcessSupervisor::new(config.clone(), transport.clone())?);
    let store: Box<dyn WarningConfigStore> = match &config.warning_state_file {
        Some(path) => Box::new(JsonFileWarningStore::new(path)),
        None => Box::new(MemoryWarningStore::new()),
    };
    let manager = OperationManager::init(config.clone(), transport, supervisor, store).await?;
    let sweeper = manager.spawn_sweeper();

    let mut changes = manager.registry().subscribe();
    let mut pending: HashSet<String> = HashSet::new();
    let mut failed = 0usize;

    for command in cli.command.into_operations() {
        match manager.launch(&command).await {
            Ok(op) => {
                println!("[{}] $ {}", op.id, command.display(&config.package_manager));
                pending.insert(op.id);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to launch operation");
                eprintln!("Failed to start {}: {}", command.title(), e);
                failed += 1;
            }
        }
    }

    if manager.should_warn().await {
        eprintln!(
            "Warning: {} operations are running at the same time and may compete for resources.",
            manager.active_count().await
        );
    }

    // Set whenever an operation may have settled, including during launch.
    let mut recheck = true;
    while !pending.is_empty() {
        if recheck {
            recheck = false;
            for id in pending.clone() {
                match manager.registry().get(&id).await {
                    Some(op) if op.is_terminal() => {
                        report(&op);
                        if op.status != OperationStatus::Success {
                            failed += 1;
                        }
                        pending.remove(&id);
                    }
                    Some(_) => {}
                    None => {
                        failed += 1;
                        pending.remove(&id);
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
        }

        tokio::select! {
            change = changes.recv() => match change {
                Ok(RegistryChange::OutputAppended { operation_id, line }) => {
                    print_line(&operation_id, &line);
                }
                Ok(RegistryChange::Updated { status, .. }) if status.is_terminal() => recheck = true,
                Ok(RegistryChange::Removed { .. }) => recheck = true,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output display fell behind");
                    recheck = true;
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let cancelled = manager.cancel_all().await;
                eprintln!("Cancelling {} operation(s)...", cancelled);
            }
        }
    }

    sweeper.abort();
    tracing::info!(failed, "pkgops finished");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
