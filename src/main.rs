//! Engine entry point and operator command loop.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 both venues
//! unavailable beyond the configured limit.

mod books;
mod config;
mod fees;
mod immediate;
mod liquidity;
mod logging;
mod matcher;
mod opinion;
mod orders;
mod polymarket;
mod reconcile;
mod retry;
mod scanner;
mod supervisor;
#[cfg(test)]
mod testkit;
mod trade_log;
mod types;
mod venue;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::Config;
use opinion::{OpinionClient, OpinionConfig};
use polymarket::{PolymarketClient, PolymarketConfig};
use supervisor::{StopReason, Supervisor};
use trade_log::TradeLog;
use venue::VenueApi;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_VENUES_DOWN: i32 = 2;

#[tokio::main]
async fn main() {
    let log_guard = logging::init_logging();
    dotenvy::dotenv().ok();

    let code = run().await;

    // Flush the non-blocking writer before the process exits.
    drop(log_guard);
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run() -> i32 {
    let run_id = logging::run_id();
    let cfg = Config::from_env();

    if let Err(problem) = cfg.validate() {
        error!("configuration error: {}", problem);
        return EXIT_CONFIG_ERROR;
    }

    info!(
        run_id = %run_id,
        dry_run = cfg.dry_run,
        scan_interval_ms = cfg.scan_interval.as_millis() as u64,
        immediate_min_edge_pct = cfg.immediate_min_edge_pct,
        liquidity_min_annualized_pct = cfg.liquidity_min_annualized_pct,
        "cross-venue arbitrage engine starting"
    );
    if cfg.dry_run {
        info!("mode: DRY RUN (set DRY_RUN=0 to trade)");
    } else {
        warn!("mode: LIVE EXECUTION");
    }

    let opinion_cfg = match OpinionConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("opinion credentials: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    let polymarket_cfg = match PolymarketConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("polymarket credentials: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let opinion: Arc<dyn VenueApi> = match OpinionClient::new(opinion_cfg, &cfg) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("opinion client: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    let polymarket: Arc<dyn VenueApi> = match PolymarketClient::new(polymarket_cfg, &cfg) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("polymarket client: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let trade_log = match TradeLog::open(&cfg.trade_log_dir) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!("trade log: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    info!("trade log at {}", trade_log.path().display());

    let shutdown = CancellationToken::new();
    let (supervisor, _tasks) =
        Supervisor::new(cfg, opinion, polymarket, trade_log, shutdown.clone());
    let status = supervisor.status_handle();
    let running = supervisor.running_handle();

    let engine = tokio::spawn(async move { supervisor.run().await });

    // Operator command loop on stdin, alongside Ctrl-C.
    let cli_shutdown = shutdown.clone();
    let cli = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("commands: start | stop | opps | status | quit");
        loop {
            tokio::select! {
                _ = cli_shutdown.cancelled() => break,
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    match line.trim() {
                        "start" => {
                            running.store(true, Ordering::Release);
                            println!("engine started");
                        }
                        "stop" => {
                            running.store(false, Ordering::Release);
                            println!("engine stopped (resting orders drain)");
                        }
                        "opps" => {
                            let snapshot = status.read().await;
                            if snapshot.opportunities.is_empty() {
                                println!("no opportunities in the last scan");
                            }
                            for opp in &snapshot.opportunities {
                                println!(
                                    "{:<9} edge {:>7}  ann {:>8}  [{}] {}",
                                    format!("{:?}", opp.strategy).to_lowercase(),
                                    config::format_pct(opp.effective_edge * 100.0),
                                    config::format_pct(opp.annualized_pct),
                                    opp.combination,
                                    opp.question,
                                );
                            }
                        }
                        "status" => {
                            let snapshot = status.read().await;
                            println!(
                                "running={} dry_run={} pairs={} tickets={} \
                                 opinion_degraded={} polymarket_degraded={} last_scan={:?}",
                                snapshot.running,
                                snapshot.dry_run,
                                snapshot.pair_count,
                                snapshot.active_tickets,
                                snapshot.opinion_degraded,
                                snapshot.polymarket_degraded,
                                snapshot.last_scan,
                            );
                        }
                        "quit" | "exit" => {
                            cli_shutdown.cancel();
                            break;
                        }
                        "" => {}
                        other => println!("unknown command '{}'", other),
                    }
                }
            }
        }
    });

    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrlc_shutdown.cancel();
        }
    });

    let reason = match engine.await {
        Ok(reason) => reason,
        Err(e) => {
            error!("supervisor task failed: {}", e);
            shutdown.cancel();
            let _ = cli.await;
            return EXIT_CONFIG_ERROR;
        }
    };
    shutdown.cancel();
    let _ = cli.await;

    match reason {
        StopReason::Shutdown => {
            info!("engine stopped cleanly");
            0
        }
        StopReason::BothVenuesDown => {
            error!("engine halted: both venues unavailable");
            EXIT_VENUES_DOWN
        }
        StopReason::SchemaDrift => {
            error!("engine halted: venue schema drift");
            EXIT_CONFIG_ERROR
        }
    }
}
