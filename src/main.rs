use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::client::{HttpSettings, PncpClient};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSettings, RunReport};
use crate::data_structures::CliArgs;
use crate::error::{ExtractError, ExtractResult};
use crate::rate_limit::{AdaptiveLimiter, RateLimitConfig};

mod breaker;
mod client;
mod config;
mod coordinator;
mod data_structures;
mod discovery;
mod error;
mod executor;
mod planner;
mod rate_limit;
mod reconciler;
mod storage;
#[cfg(test)]
mod testing;
mod writer;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(&args);

    match run(args).await {
        Ok(report) => {
            info!("run {} (plan {}) finished cleanly", report.run_id, report.fingerprint);
            process::exit(0);
        }
        Err(e) => {
            if e.is_cancelled() {
                warn!("run cancelled before completion; re-run to resume");
            } else {
                error!("run failed: {}", e);
            }
            process::exit(e.exit_code());
        }
    }
}

async fn run(args: CliArgs) -> ExtractResult<RunReport> {
    let config = Config::load(Path::new(&args.config))?;

    let mut http = config.http.clone();
    if let Some(max_rps) = args.max_rps {
        http.max_rps = max_rps;
    }
    if let Some(min_rps) = args.min_rps {
        http.min_rps = min_rps;
    }
    if http.min_rps == 0 || http.min_rps > http.max_rps {
        return Err(ExtractError::Config(format!(
            "rps bounds invalid after overrides: min {} max {}",
            http.min_rps, http.max_rps
        )));
    }

    let run_id = args.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let limiter = Arc::new(AdaptiveLimiter::new(RateLimitConfig::new(
        http.initial_rps,
        http.max_rps,
        http.min_rps,
    )));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let settings = HttpSettings::from_config(&http, args.http_timeout_seconds);
    let client = Arc::new(PncpClient::new(settings, limiter, breakers)?);

    let concurrency = args.concurrency.clamp(1, http.max_connections_total.max(1));
    let coordinator = Coordinator::new(
        config,
        CoordinatorSettings {
            start: args.from,
            end: args.to,
            granularity_override: args.granularity,
            concurrency,
            allow_replan: args.allow_replan,
            endpoint_filter: args.endpoints.clone(),
        },
        PathBuf::from(&args.db),
        client,
        cancel,
        run_id,
    )
    .await?;
    coordinator.run().await
}

fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

fn init_logging(args: &CliArgs) {
    let level = if args.debug { LevelFilter::Debug } else { LevelFilter::Info };
    match &args.log_file {
        Some(path) if !path.is_empty() => {
            if simple_logging::log_to_file(path, level).is_err() {
                simple_logging::log_to_stderr(level);
                error!("could not open log file '{}', logging to stderr instead", path);
            }
        }
        _ => simple_logging::log_to_stderr(level),
    }
}
