#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use telegram_max_bridge::cli::Cli;
use telegram_max_bridge::config::Config;
use telegram_max_bridge::db::DatabaseManager;
use telegram_max_bridge::dead_letter::DeadLetterService;
use telegram_max_bridge::dispatch::{Dispatcher, LinkCache, MediaGroupAggregator};
use telegram_max_bridge::max::MaxHttpClient;
use telegram_max_bridge::migration::MigrationQueue;
use telegram_max_bridge::resilience::{BreakerRegistry, CircuitBreakerConfig, RateLimiter, RetryPolicy};
use telegram_max_bridge::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load_from_file(&cli.config)?);
    logging::init_tracing(&config.logging);
    info!("telegram-max bridge starting up");

    let db_manager = Arc::new(DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    let max_client = Arc::new(MaxHttpClient::new(&config.max)?);

    let limits = &config.limits;
    let limiter = Arc::new(RateLimiter::new(
        limits.rate_max_calls,
        Duration::from_millis(limits.rate_period_ms),
    ));
    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: limits.breaker_failure_threshold,
        recovery_timeout: Duration::from_secs(limits.breaker_recovery_secs),
        successes_required: limits.breaker_successes_required,
    }));
    let retry = RetryPolicy {
        max_attempts: limits.retry_max_attempts,
        base_delay: Duration::from_millis(limits.retry_base_delay_ms),
        max_delay: Duration::from_millis(limits.retry_max_delay_ms),
    };

    let link_cache = Arc::new(LinkCache::new(db_manager.link_store()));
    let migration_queue = Arc::new(MigrationQueue::new());

    let dispatcher = Arc::new(Dispatcher::new(
        db_manager.clone(),
        max_client,
        limiter,
        breakers,
        link_cache,
        migration_queue,
        retry,
        Duration::from_secs(limits.send_timeout_secs),
    ));

    let aggregator = MediaGroupAggregator::new(
        dispatcher.clone(),
        Duration::from_millis(config.media_groups.quiet_period_ms),
        Duration::from_secs(config.media_groups.stale_after_secs),
    );
    let sweep_interval = Duration::from_secs(config.media_groups.sweep_interval_secs);
    let sweeper = aggregator.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run_sweeper(sweep_interval).await;
    });

    let dead_letters = DeadLetterService::new(db_manager.clone(), &config.dead_letter);
    let backlog_interval = Duration::from_secs(config.dead_letter.sweep_interval_secs);
    let backlog_limit = config.dead_letter.redrive_batch;
    let backlog_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(backlog_interval).await;
            match dead_letters.pending(backlog_limit).await {
                Ok(entries) if entries.is_empty() => {}
                Ok(entries) => {
                    warn!("{} dead-lettered posts awaiting re-drive", entries.len());
                }
                Err(e) => error!("dead letter backlog check failed: {e:#}"),
            }
        }
    });

    info!("bridge ready, waiting for shutdown signal");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = sweeper_handle => {
            error!("media group sweeper exited unexpectedly");
        }
        _ = backlog_handle => {
            error!("dead letter monitor exited unexpectedly");
        }
    }

    info!("telegram-max bridge shutting down");
    Ok(())
}
