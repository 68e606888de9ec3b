use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use shareloop_engine::{EngineConfig, ExpirySweeper, RewardEngine, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first - this validates every threshold
    let config = Arc::new(EngineConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        eprintln!("Please check SHARELOOP_* environment variables.");
        e
    })?);

    init_secure_logging(&config)?;

    info!("Starting ShareLoop reward engine");
    info!(
        "Fraud thresholds: flag={}, limit={}, block={}, report above {}",
        config.fraud.flag_action,
        config.fraud.limit_action,
        config.fraud.block_action,
        config.fraud.report_above
    );

    // Persistence is supplied by the host; the daemon runs on the in-memory store
    let engine = RewardEngine::new(Store::in_memory(), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweep.enabled {
        let sweeper = ExpirySweeper::new(engine.referrals(), config.sweep.interval_secs)
            .with_badges(engine.badges());
        Some(tokio::spawn(async move { sweeper.run(shutdown_rx).await }))
    } else {
        info!("Referral expiry sweep disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        handle.await?;
    }

    info!("ShareLoop reward engine stopped");
    Ok(())
}

/// Initialize logging based on configuration
fn init_secure_logging(config: &EngineConfig) -> Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(if config.logging.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    if config.logging.sanitize_logs {
        info!("Secure logging initialized with data sanitization enabled");
    }

    Ok(())
}
