//! Engine orchestration.
//!
//! The supervisor owns the main loop: trigger matcher refreshes on their
//! own cadence, pull book frames, run the scanner, dispatch high-edge
//! opportunities to the immediate channel without waiting, drive the
//! liquidity manager on its slower cadence, refresh the balance cache
//! before execution slots, and enforce the global halt when both venues
//! stay unavailable too long. Shutdown flows through one cancellation
//! token that every task checks at its suspension points.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::books::BookFetcher;
use crate::config::Config;
use crate::immediate::ImmediateExecutor;
use crate::liquidity::LiquidityManager;
use crate::matcher::Matcher;
use crate::reconcile::Reconciler;
use crate::scanner::Scanner;
use crate::trade_log::TradeLog;
use crate::types::{Combination, DeficitEvent, Opportunity, StrategyKind, VenueId};
use crate::venue::{Balances, VenueApi};

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator-requested shutdown; clean drain.
    Shutdown,
    /// Both venues unavailable beyond the configured limit.
    BothVenuesDown,
    /// A venue response stopped matching its expected shape.
    SchemaDrift,
}

/// A trimmed opportunity row for the operator display.
#[derive(Debug, Clone)]
pub struct OpportunityView {
    pub question: String,
    pub combination: Combination,
    pub raw_edge: f64,
    pub effective_edge: f64,
    pub annualized_pct: f64,
    pub strategy: StrategyKind,
}

impl From<&Opportunity> for OpportunityView {
    fn from(opp: &Opportunity) -> Self {
        Self {
            question: opp.pair.question.clone(),
            combination: opp.combination,
            raw_edge: opp.raw_edge,
            effective_edge: opp.effective_edge,
            annualized_pct: opp.annualized_pct,
            strategy: opp.strategy,
        }
    }
}

/// Shared status snapshot for the operator interface.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub running: bool,
    pub dry_run: bool,
    pub pair_count: usize,
    pub active_tickets: usize,
    pub opportunities: Vec<OpportunityView>,
    pub last_scan: Option<DateTime<Utc>>,
    pub opinion_degraded: bool,
    pub polymarket_degraded: bool,
}

/// Cached balances, refreshed before execution slots. Strategies must not
/// assume it stays current across await points that place orders.
#[derive(Debug, Default, Clone)]
struct BalanceCache {
    opinion: Balances,
    polymarket: Balances,
}

impl BalanceCache {
    /// Conservative check: pass when the collateral entry exists and
    /// covers the notional, or when the venue does not report it at all.
    fn covers(&self, venue: VenueId, notional: f64) -> bool {
        let (balances, asset) = match venue {
            VenueId::Opinion => (&self.opinion, "USDT"),
            VenueId::Polymarket => (&self.polymarket, "USDC"),
        };
        match balances.get(asset) {
            Some(balance) => balance.available >= notional,
            None => true,
        }
    }
}

pub struct Supervisor {
    cfg: Config,
    opinion: Arc<dyn VenueApi>,
    polymarket: Arc<dyn VenueApi>,
    matcher: Arc<Matcher>,
    fetcher: BookFetcher,
    scanner: Scanner,
    immediate_tx: mpsc::Sender<Opportunity>,
    liquidity: Mutex<LiquidityManager>,
    status: Arc<RwLock<EngineStatus>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

/// Handles returned alongside the supervisor for background tasks it owns.
pub struct SupervisorTasks {
    pub immediate_loop: tokio::task::JoinHandle<()>,
    pub reconciler_loop: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    pub fn new(
        cfg: Config,
        opinion: Arc<dyn VenueApi>,
        polymarket: Arc<dyn VenueApi>,
        trade_log: Arc<TradeLog>,
        shutdown: CancellationToken,
    ) -> (Self, SupervisorTasks) {
        let matcher = Arc::new(Matcher::new(opinion.clone(), polymarket.clone(), &cfg));
        let fetcher = BookFetcher::new(opinion.clone(), polymarket.clone(), &cfg);
        let scanner = Scanner::new(&cfg);

        let (deficit_tx, deficit_rx) = mpsc::channel::<DeficitEvent>(64);
        let (immediate_tx, immediate_rx) = mpsc::channel::<Opportunity>(64);

        let executor = Arc::new(ImmediateExecutor::new(
            opinion.clone(),
            polymarket.clone(),
            trade_log.clone(),
            deficit_tx.clone(),
            &cfg,
        ));
        let immediate_loop = tokio::spawn(run_immediate_loop(
            immediate_rx,
            executor,
            cfg.max_concurrent_immediate,
            shutdown.clone(),
        ));

        let reconciler = Reconciler::new(
            opinion.clone(),
            polymarket.clone(),
            trade_log.clone(),
            &cfg,
        );
        let reconciler_loop = tokio::spawn(reconciler.run(deficit_rx, shutdown.clone()));

        let liquidity = Mutex::new(LiquidityManager::new(
            opinion.clone(),
            polymarket.clone(),
            trade_log,
            deficit_tx,
            &cfg,
        ));

        let status = Arc::new(RwLock::new(EngineStatus {
            running: true,
            dry_run: cfg.dry_run,
            ..EngineStatus::default()
        }));

        (
            Self {
                cfg,
                opinion,
                polymarket,
                matcher,
                fetcher,
                scanner,
                immediate_tx,
                liquidity,
                status,
                running: Arc::new(AtomicBool::new(true)),
                shutdown,
            },
            SupervisorTasks {
                immediate_loop,
                reconciler_loop,
            },
        )
    }

    /// Shared status handle for the operator interface.
    pub fn status_handle(&self) -> Arc<RwLock<EngineStatus>> {
        self.status.clone()
    }

    /// Pause/resume handle for the operator interface.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run until shutdown or a fatal condition. The matcher refresh runs
    /// on its own task and cadence.
    pub async fn run(&self) -> StopReason {
        let matcher = self.matcher.clone();
        let refresh_interval = self.cfg.matcher_refresh;
        let matcher_shutdown = self.shutdown.clone();
        let matcher_task = tokio::spawn(async move {
            loop {
                matcher.refresh().await;
                tokio::select! {
                    _ = matcher_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(refresh_interval) => {}
                }
            }
        });

        let reason = self.scan_loop().await;

        // Drain: cancel resting orders, observe pending fills, hedge.
        info!("supervisor draining");
        self.liquidity.lock().await.drain(&self.shutdown).await;
        matcher_task.abort();
        reason
    }

    async fn scan_loop(&self) -> StopReason {
        let mut both_down_since: Option<Instant> = None;
        let mut last_liquidity_pass = Instant::now()
            .checked_sub(self.cfg.scan_interval * 8)
            .unwrap_or_else(Instant::now);
        let mut balances = BalanceCache::default();
        let mut was_paused = false;

        loop {
            if self.shutdown.is_cancelled() {
                return StopReason::Shutdown;
            }

            let cycle_start = Instant::now();

            // Operator pause: drain tickets once, then idle.
            if !self.running.load(Ordering::Acquire) {
                if !was_paused {
                    info!("engine paused by operator");
                    self.liquidity.lock().await.drain(&self.shutdown).await;
                    was_paused = true;
                    self.status.write().await.running = false;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return StopReason::Shutdown,
                    _ = tokio::time::sleep(self.cfg.scan_interval) => continue,
                }
            }
            if was_paused {
                info!("engine resumed by operator");
                was_paused = false;
                self.status.write().await.running = true;
            }

            // Schema drift means responses can no longer be trusted.
            if self.opinion.schema_drift() || self.polymarket.schema_drift() {
                error!("venue schema drift detected, halting");
                return StopReason::SchemaDrift;
            }

            // Venue availability: degraded adapters pause dispatch; both
            // degraded for too long halts the engine.
            let opinion_down = self.opinion.is_degraded();
            let poly_down = self.polymarket.is_degraded();
            if opinion_down && poly_down {
                let since = *both_down_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.cfg.both_venues_down_limit {
                    error!(
                        down_for_secs = since.elapsed().as_secs(),
                        "both venues unavailable beyond limit, halting"
                    );
                    return StopReason::BothVenuesDown;
                }
            } else {
                both_down_since = None;
            }

            let pairs = self.matcher.pairs().await;
            let frame = self
                .fetcher
                .fetch_frame(&pairs, self.cfg.scan_interval)
                .await;
            let opportunities = self.scanner.scan(&pairs, &frame);

            // Immediate dispatch: enqueue and keep scanning, never wait.
            let immediates: Vec<&Opportunity> = opportunities
                .iter()
                .filter(|o| o.strategy == StrategyKind::Immediate)
                .collect();
            if !immediates.is_empty() {
                // Balance cache refresh before the execution slot.
                balances = self.refresh_balances().await.unwrap_or(balances);
            }
            for opp in immediates {
                if opinion_down || poly_down {
                    warn!(
                        pair_id = %opp.pair.pair_id,
                        "skipping immediate: a venue is degraded"
                    );
                    continue;
                }
                let notional = opp.size_cap * opp.gross_cost();
                if !balances.covers(VenueId::Opinion, opp.size_cap * opp.opinion_price)
                    || !balances.covers(VenueId::Polymarket, opp.size_cap * opp.poly_price)
                {
                    warn!(
                        event = "balance_paused",
                        pair_id = %opp.pair.pair_id,
                        notional,
                        "skipping immediate: insufficient balance this scan"
                    );
                    continue;
                }
                if let Err(e) = self.immediate_tx.try_send(opp.clone()) {
                    warn!(error = %e, "immediate channel full, opportunity dropped");
                }
            }

            // Liquidity pass on its slower cadence.
            if last_liquidity_pass.elapsed() >= self.cfg.scan_interval * 4
                && !(opinion_down || poly_down)
            {
                let mut liquidity = self.liquidity.lock().await;
                liquidity
                    .on_frame(&frame, &opportunities, &self.shutdown)
                    .await;
                last_liquidity_pass = Instant::now();
            }

            // Publish status for the operator.
            {
                let mut status = self.status.write().await;
                status.pair_count = pairs.len();
                status.opportunities = opportunities.iter().map(OpportunityView::from).collect();
                status.active_tickets = self.liquidity.lock().await.active_tickets();
                status.last_scan = Some(frame.frame_time);
                status.opinion_degraded = opinion_down;
                status.polymarket_degraded = poly_down;
            }

            // Sleep out the remainder of the scan interval.
            let elapsed = cycle_start.elapsed();
            if elapsed < self.cfg.scan_interval {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return StopReason::Shutdown,
                    _ = tokio::time::sleep(self.cfg.scan_interval - elapsed) => {}
                }
            }
        }
    }

    async fn refresh_balances(&self) -> Option<BalanceCache> {
        let (opinion, polymarket) = tokio::join!(
            self.opinion.get_balances(),
            self.polymarket.get_balances()
        );
        match (opinion, polymarket) {
            (Ok(opinion), Ok(polymarket)) => Some(BalanceCache {
                opinion,
                polymarket,
            }),
            (o, p) => {
                if let Err(e) = o {
                    warn!("opinion balance refresh failed: {}", e);
                }
                if let Err(e) = p {
                    warn!("polymarket balance refresh failed: {}", e);
                }
                None
            }
        }
    }
}

/// Consumes the immediate channel, running at most `max_concurrent`
/// executions in parallel. The scanner never waits on this loop.
async fn run_immediate_loop(
    mut rx: mpsc::Receiver<Opportunity>,
    executor: Arc<ImmediateExecutor>,
    max_concurrent: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    info!(max_concurrent, "immediate execution loop started");

    loop {
        let opp = tokio::select! {
            _ = shutdown.cancelled() => break,
            opp = rx.recv() => match opp {
                Some(opp) => opp,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let executor = executor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let report = executor.execute(&opp, &shutdown).await;
            info!(
                opportunity_id = %report.opportunity_id,
                end = ?report.end,
                first_filled = report.first_filled,
                hedged = report.hedged,
                "immediate execution report"
            );
            drop(permit);
        });
    }

    info!("immediate execution loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{book_with_ask, MockVenue};
    use crate::types::MarketSummary;
    use chrono::Duration as ChronoDuration;

    fn market(venue: VenueId, id: &str, title: &str) -> MarketSummary {
        MarketSummary {
            venue,
            market_id: id.to_string(),
            title: title.to_string(),
            yes_token_id: format!("{}-yes", id),
            no_token_id: format!("{}-no", id),
            resolution_time: Some(Utc::now() + ChronoDuration::days(20)),
            tick_size: 0.01,
            min_order_size: 5.0,
            closed: false,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_dry_run_scan() {
        let question = "Will the measure pass in November?";
        let opinion = MockVenue::new(VenueId::Opinion)
            .with_markets(vec![market(VenueId::Opinion, "op-1", question)])
            .with_book(book_with_ask(VenueId::Opinion, "op-1-yes", 0.55, 500.0));
        // Poly YES bid is 0.58 (ask 0.60), so the derived NO ask is 0.42:
        // raw edge 3%, immediate after fees stays above 2%.
        let polymarket = MockVenue::new(VenueId::Polymarket)
            .with_markets(vec![market(VenueId::Polymarket, "pm-1", question)])
            .with_book(book_with_ask(VenueId::Polymarket, "pm-1-yes", 0.60, 500.0));

        let cfg = Config::default(); // dry_run = true
        let dir = tempfile::tempdir().unwrap();
        let trade_log = Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap());
        let shutdown = CancellationToken::new();

        let (supervisor, tasks) = Supervisor::new(
            cfg,
            Arc::new(opinion),
            Arc::new(polymarket),
            trade_log,
            shutdown.clone(),
        );
        let status = supervisor.status_handle();

        let run = tokio::spawn(async move { supervisor.run().await });

        // Let a few scan cycles complete, then stop.
        tokio::time::sleep(std::time::Duration::from_millis(1800)).await;
        shutdown.cancel();
        let reason = run.await.unwrap();
        assert_eq!(reason, StopReason::Shutdown);

        let status = status.read().await;
        assert_eq!(status.pair_count, 1);
        assert!(!status.opportunities.is_empty(), "scan found the mispricing");
        let _ = tasks;
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let opinion = MockVenue::new(VenueId::Opinion);
        let polymarket = MockVenue::new(VenueId::Polymarket);
        let dir = tempfile::tempdir().unwrap();
        let trade_log = Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap());
        let shutdown = CancellationToken::new();

        let (supervisor, _tasks) = Supervisor::new(
            Config::default(),
            Arc::new(opinion),
            Arc::new(polymarket),
            trade_log,
            shutdown.clone(),
        );

        let run = tokio::spawn(async move { supervisor.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let start = Instant::now();
        shutdown.cancel();
        let reason = run.await.unwrap();
        assert_eq!(reason, StopReason::Shutdown);
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_both_venues_down_halts() {
        let opinion = MockVenue::new(VenueId::Opinion).failing();
        let polymarket = MockVenue::new(VenueId::Polymarket).failing();
        let dir = tempfile::tempdir().unwrap();
        let trade_log = Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap());

        let mut cfg = Config::default();
        cfg.both_venues_down_limit = std::time::Duration::from_millis(200);
        cfg.scan_interval = std::time::Duration::from_millis(50);

        let shutdown = CancellationToken::new();
        let (supervisor, _tasks) = Supervisor::new(
            cfg,
            Arc::new(opinion),
            Arc::new(polymarket),
            trade_log,
            shutdown.clone(),
        );

        let reason = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            tokio::spawn(async move { supervisor.run().await }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, StopReason::BothVenuesDown);
    }
}
