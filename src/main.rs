// src/main.rs - wires the store, configuration, engine and scheduler together

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use mintbot::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting mintbot v{}", env!("CARGO_PKG_VERSION"));

    let db_path = env::var("MINTBOT_DB").unwrap_or_else(|_| "data/mintbot.db".to_string());
    let config_dir = env::var("MINTBOT_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

    info!("Opening reward store at {db_path}");
    let store = Arc::new(
        RewardStore::connect(&db_path)
            .await
            .context("opening reward store")?,
    );
    store.migrate().await.context("running migrations")?;

    info!("Initializing configuration manager...");
    let config = Arc::new(ConfigurationManager::new(Arc::clone(&store), &config_dir));
    if let Err(e) = config.initialize().await {
        error!("Failed to initialize configuration: {e:#}");
        return Err(e);
    }
    let snapshot = config.get_configuration().await;
    info!(
        "Configuration loaded: {} rules ({} active)",
        snapshot.rule_count(),
        snapshot.active_rule_count()
    );

    // Log configuration changes as they happen.
    let mut changes = config.subscribe_to_changes();
    tokio::spawn(async move {
        while let Ok(event) = changes.recv().await {
            match event {
                ConfigChangeEvent::Reloaded { rule_count } => {
                    info!("configuration reloaded ({rule_count} rules)")
                }
                ConfigChangeEvent::ReloadRejected { errors } => {
                    warn!("configuration reload rejected: {errors:?}")
                }
                other => debug!("configuration change: {other:?}"),
            }
        }
    });

    let engine = Arc::new(RewardEngine::new(Arc::clone(&store), Arc::clone(&config)));

    info!("Starting maintenance scheduler...");
    let scheduler = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&store),
        Arc::clone(&config),
    ));
    scheduler.start().await;

    info!("Ready: feed reward lines on stdin, Ctrl-C to stop");

    // Minimal transport: one reward event per stdin line.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let event = RewardEvent::new(line);
                        match engine.parse(&event).await {
                            Ok(ParseOutcome::Match(tx)) => info!(
                                "parsed {} reward: {} -> {} {} (transaction {})",
                                tx.source_name,
                                tx.original_amount,
                                tx.converted_amount,
                                tx.currency_type,
                                tx.id
                            ),
                            Ok(ParseOutcome::NoMatch) => debug!("no rule matched"),
                            Err(e) => error!("failed to process reward: {e}"),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("stdin read failed: {e}");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let status = scheduler.status();
    info!(
        "Stopping background tasks (cleanup alive: {}, monitoring alive: {})",
        status.cleanup_job_alive, status.monitoring_job_alive
    );
    scheduler.stop().await;
    store.close().await;
    info!("mintbot stopped cleanly");
    Ok(())
}
