//! End-to-end strategy flows against scriptable mock venues.
//!
//! Covers the literal trading scenarios: an immediate two-leg cross, the
//! under-filled hedge routed through reconciliation, the liquidity
//! partial-fill/hedge/reprice cycle, the suspicious-edge skip, and the
//! shutdown drain.

use chrono::{Duration as ChronoDuration, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cross_venue_arbitrage::config::Config;
use cross_venue_arbitrage::immediate::{ExecutionEnd, ImmediateExecutor};
use cross_venue_arbitrage::liquidity::LiquidityManager;
use cross_venue_arbitrage::matcher::PairSet;
use cross_venue_arbitrage::reconcile::Reconciler;
use cross_venue_arbitrage::scanner::Scanner;
use cross_venue_arbitrage::testkit::MockVenue;
use cross_venue_arbitrage::trade_log::TradeLog;
use cross_venue_arbitrage::types::{
    BookLevel, BookSnapshot, Combination, DeficitEvent, MarketPair, Outcome, ScanFrame,
    StrategyKind, Tif, Token, VenueId,
};

fn pair() -> MarketPair {
    MarketPair {
        pair_id: "op-1:pm-1".to_string(),
        question: "Will the incumbent win the runoff?".to_string(),
        opinion_yes: Token::new(VenueId::Opinion, "op-1", "oy", Outcome::Yes),
        opinion_no: Token::new(VenueId::Opinion, "op-1", "on", Outcome::No),
        polymarket_yes: Token::new(VenueId::Polymarket, "pm-1", "py", Outcome::Yes),
        polymarket_no: Token::new(VenueId::Polymarket, "pm-1", "pn", Outcome::No),
        resolution_time: Some(Utc::now() + ChronoDuration::days(30)),
        similarity: 1.0,
    }
}

fn book(venue: VenueId, token_id: &str, bid: f64, ask: f64, size: f64) -> BookSnapshot {
    BookSnapshot {
        venue,
        token_id: token_id.to_string(),
        bids: vec![BookLevel { price: bid, size }],
        asks: vec![BookLevel { price: ask, size }],
        fetched_at: Utc::now(),
    }
}

fn frame(books: Vec<BookSnapshot>) -> ScanFrame {
    let mut map = FxHashMap::default();
    for b in books {
        map.insert(b.token_id.clone(), b);
    }
    ScanFrame {
        frame_time: Utc::now(),
        books: map,
    }
}

fn live_config() -> Config {
    let mut cfg = Config::default();
    cfg.dry_run = false;
    cfg.liquidity_reprice_interval = Duration::ZERO;
    cfg
}

fn trade_log(dir: &tempfile::TempDir) -> Arc<TradeLog> {
    Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap())
}

/// Scenario: Opinion YES ask 0.55, Polymarket NO ask 0.40, 500 shares of
/// depth on both sides. The scanner classifies it immediate, the executor
/// crosses both legs in full, and the trade log shows two filled legs.
#[tokio::test]
async fn test_immediate_two_leg_cross() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = live_config();

    let pairs = PairSet { pairs: vec![pair()] };
    let scan_frame = frame(vec![
        book(VenueId::Opinion, "oy", 0.53, 0.55, 500.0),
        // Poly YES bid 0.60 -> derived NO ask 0.40.
        book(VenueId::Polymarket, "py", 0.60, 0.62, 500.0),
    ]);

    let scanner = Scanner::new(&cfg);
    let opportunities = scanner.scan(&pairs, &scan_frame);
    let opp = opportunities
        .iter()
        .find(|o| o.strategy == StrategyKind::Immediate)
        .expect("immediate opportunity expected");
    assert!((opp.raw_edge - 0.05).abs() < 1e-9);
    assert_eq!(opp.size_cap, 500.0);

    let opinion = Arc::new(MockVenue::new(VenueId::Opinion));
    let polymarket = Arc::new(MockVenue::new(VenueId::Polymarket));
    let (deficit_tx, mut deficit_rx) = mpsc::channel::<DeficitEvent>(8);
    let executor = ImmediateExecutor::new(
        opinion.clone(),
        polymarket.clone(),
        trade_log(&dir),
        deficit_tx,
        &cfg,
    );

    let report = executor.execute(opp, &CancellationToken::new()).await;

    assert_eq!(report.end, ExecutionEnd::Hedged);
    assert!((report.first_filled - 500.0).abs() < 0.5);
    assert!((report.hedged - report.first_filled).abs() < 1e-6);
    assert!(deficit_rx.try_recv().is_err(), "fully hedged, no deficit");

    // Both venues saw exactly one IOC buy.
    assert_eq!(opinion.placed_orders().len(), 1);
    assert_eq!(polymarket.placed_orders().len(), 1);
    assert!(opinion.placed_orders()[0].qty > 500.0);

    let log = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
    let legs: Vec<&str> = log.lines().collect();
    assert_eq!(legs.len(), 2, "two filled legs recorded");
    assert!(log.contains("\"kind\":\"immediate\""));
    assert!(log.contains("\"kind\":\"hedge\""));
}

/// Scenario: first leg fills 500 but the hedge venue only has 450. The
/// 50-share deficit flows to reconciliation, whose ladder closes the
/// gap, leaving the net position balanced.
#[tokio::test]
async fn test_underfilled_hedge_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = live_config();

    let pairs = PairSet { pairs: vec![pair()] };
    let scan_frame = frame(vec![
        book(VenueId::Opinion, "oy", 0.53, 0.55, 500.0),
        book(VenueId::Polymarket, "py", 0.60, 0.62, 500.0),
    ]);
    let scanner = Scanner::new(&cfg);
    let opportunities = scanner.scan(&pairs, &scan_frame);
    let opp = opportunities
        .iter()
        .find(|o| o.strategy == StrategyKind::Immediate)
        .expect("immediate opportunity expected");

    let opinion = Arc::new(MockVenue::new(VenueId::Opinion));
    // Hedge leg consumes only 90% of the book; the retry fills the rest.
    let polymarket =
        Arc::new(MockVenue::new(VenueId::Polymarket).with_ioc_fills("pn", vec![0.9, 1.0]));

    let (deficit_tx, mut deficit_rx) = mpsc::channel::<DeficitEvent>(8);
    let log = trade_log(&dir);
    let executor = ImmediateExecutor::new(
        opinion.clone(),
        polymarket.clone(),
        log.clone(),
        deficit_tx,
        &cfg,
    );

    let shutdown = CancellationToken::new();
    let report = executor.execute(opp, &shutdown).await;
    assert!(report.deficit > 0.0);

    let event = deficit_rx.try_recv().expect("deficit event expected");
    assert!((event.deficit_qty - report.deficit).abs() < 1e-6);

    let reconciler = Reconciler::new(opinion.clone(), polymarket.clone(), log, &cfg);
    reconciler.close_deficit(event, &shutdown).await;

    // Reconciliation sent one more IOC and the ladder closed the gap.
    let hedge_orders = polymarket.placed_orders();
    assert_eq!(hedge_orders.len(), 2);
    assert!((hedge_orders[1].qty - report.deficit).abs() < 1e-6);

    let contents = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
    assert!(contents.contains("\"kind\":\"reconcile\""));
    assert!(
        !contents.contains("\"kind\":\"deficit\""),
        "no residual exposure once the ladder fills"
    );
}

/// Scenario: a 55% apparent edge is flagged suspicious and never emitted.
#[tokio::test]
async fn test_suspicious_edge_never_dispatched() {
    let cfg = live_config();
    let pairs = PairSet { pairs: vec![pair()] };
    // 0.20 + 0.25 = 0.45: apparent edge 55%.
    let scan_frame = frame(vec![
        book(VenueId::Opinion, "oy", 0.18, 0.20, 500.0),
        book(VenueId::Polymarket, "py", 0.75, 0.78, 500.0),
    ]);

    let scanner = Scanner::new(&cfg);
    let opportunities = scanner.scan(&pairs, &scan_frame);
    assert!(
        opportunities
            .iter()
            .all(|o| o.combination != Combination::OpinionYesPolyNo),
        "suspicious edge must be skipped"
    );
}

/// Scenario: a liquidity-grade opportunity rests a GTC, sees a partial
/// fill of 150, hedges exactly 150 IOC, keeps resting the remainder, and
/// is canceled with a final hedge when the engine shuts down.
#[tokio::test]
async fn test_liquidity_partial_fill_hedge_and_drain() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = live_config();

    let p = pair();
    let opportunity = {
        // Hand-built liquidity opportunity: 0.30/0.30 asks, wide spread.
        cross_venue_arbitrage::types::Opportunity {
            id: "opp-liq-1".to_string(),
            opinion_token: p.opinion_yes.clone(),
            opinion_price: 0.30,
            opinion_depth: 600.0,
            poly_token: p.polymarket_no.clone(),
            poly_price: 0.30,
            poly_depth: 600.0,
            pair: p.clone(),
            combination: Combination::OpinionYesPolyNo,
            raw_edge: 0.40,
            effective_edge: 0.01,
            size_cap: 600.0,
            annualized_pct: 30.0,
            strategy: StrategyKind::Liquidity,
            detected_at: Utc::now(),
        }
    };

    let opinion = Arc::new(MockVenue::new(VenueId::Opinion));
    let polymarket = Arc::new(MockVenue::new(VenueId::Polymarket));
    let (deficit_tx, mut deficit_rx) = mpsc::channel::<DeficitEvent>(8);
    let mut manager = LiquidityManager::new(
        opinion.clone(),
        polymarket.clone(),
        trade_log(&dir),
        deficit_tx,
        &cfg,
    );

    let scan_frame = frame(vec![book(VenueId::Opinion, "oy", 0.25, 0.30, 600.0)]);
    let shutdown = CancellationToken::new();

    // Frame 1: the ticket rests at 0.29 GTC.
    manager
        .on_frame(&scan_frame, std::slice::from_ref(&opportunity), &shutdown)
        .await;
    let rest = &opinion.placed_orders()[0];
    assert_eq!(rest.tif, Tif::Gtc);
    assert_eq!(rest.price, 0.29);
    assert_eq!(rest.qty, 250.0);

    // The venue matches 150 shares.
    opinion.fill_gtc(&rest.order_id, 150.0);

    // Frame 2: the fill is observed and hedged IOC on Polymarket.
    manager
        .on_frame(&scan_frame, std::slice::from_ref(&opportunity), &shutdown)
        .await;
    let hedges = polymarket.placed_orders();
    assert_eq!(hedges.len(), 1);
    assert_eq!(hedges[0].tif, Tif::Ioc);
    assert!((hedges[0].qty - 150.0).abs() < 1e-9);
    assert_eq!(manager.active_tickets(), 1, "remaining 100 keeps resting");

    // Shutdown: the resting order is canceled, nothing further fills,
    // and no deficit remains.
    manager.drain(&shutdown).await;
    assert_eq!(manager.active_tickets(), 0);
    assert!(deficit_rx.try_recv().is_err());

    let contents = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
    assert!(contents.contains("\"kind\":\"liquidity\""));
    assert!(contents.contains("\"kind\":\"hedge\""));
}

/// Scenario: shutdown mid-execution cancels resting orders and the
/// in-flight hedge still completes, leaving hedged == filled.
#[tokio::test]
async fn test_shutdown_drain_hedges_pending_fills() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = live_config();

    let p = pair();
    let opportunity = cross_venue_arbitrage::types::Opportunity {
        id: "opp-liq-2".to_string(),
        opinion_token: p.opinion_yes.clone(),
        opinion_price: 0.30,
        opinion_depth: 600.0,
        poly_token: p.polymarket_no.clone(),
        poly_price: 0.30,
        poly_depth: 600.0,
        pair: p.clone(),
        combination: Combination::OpinionYesPolyNo,
        raw_edge: 0.40,
        effective_edge: 0.01,
        size_cap: 600.0,
        annualized_pct: 30.0,
        strategy: StrategyKind::Liquidity,
        detected_at: Utc::now(),
    };

    let opinion = Arc::new(MockVenue::new(VenueId::Opinion));
    let polymarket = Arc::new(MockVenue::new(VenueId::Polymarket));
    let (deficit_tx, _deficit_rx) = mpsc::channel::<DeficitEvent>(8);
    let mut manager = LiquidityManager::new(
        opinion.clone(),
        polymarket.clone(),
        trade_log(&dir),
        deficit_tx,
        &cfg,
    );

    let scan_frame = frame(vec![book(VenueId::Opinion, "oy", 0.25, 0.30, 600.0)]);
    let shutdown = CancellationToken::new();

    manager
        .on_frame(&scan_frame, std::slice::from_ref(&opportunity), &shutdown)
        .await;
    let rest_id = opinion.placed_orders()[0].order_id.clone();

    // A fill lands between the last frame and the shutdown signal.
    opinion.fill_gtc(&rest_id, 80.0);
    manager.drain(&shutdown).await;

    // The late fill was observed during cancel confirmation and hedged.
    let hedges = polymarket.placed_orders();
    assert_eq!(hedges.len(), 1);
    assert!((hedges[0].qty - 80.0).abs() < 1e-9);
    assert_eq!(
        opinion.order_state(&rest_id),
        Some(cross_venue_arbitrage::types::OrderState::Canceled)
    );
}

/// One venue erroring on every book leaves opportunities from the other
/// side alone: nothing is emitted for the broken pair, and no error
/// propagates out of the scan.
#[tokio::test]
async fn test_one_venue_down_is_isolated() {
    let cfg = live_config();
    let pairs = PairSet { pairs: vec![pair()] };

    // Frame contains only the Polymarket book: Opinion 429'd all scan.
    let scan_frame = frame(vec![book(VenueId::Polymarket, "py", 0.60, 0.62, 500.0)]);
    let scanner = Scanner::new(&cfg);
    let opportunities = scanner.scan(&pairs, &scan_frame);
    assert!(opportunities.is_empty());
}
