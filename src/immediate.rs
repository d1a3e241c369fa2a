//! Immediate crossing strategy.
//!
//! Fires when an opportunity's effective edge clears the immediate
//! threshold: cross the shallower side first with an IOC, confirm the
//! terminal fill, then hedge exactly the received quantity on the other
//! venue with a second IOC priced up to a few ticks worse than scanned.
//! Any hedge shortfall becomes a deficit event for reconciliation.
//!
//! A hedge order is submitted only after the first-leg fill is observed,
//! never before, so `hedged_qty <= first_filled_qty` holds at all times.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::fees::FeeModel;
use crate::orders::poll_until_terminal;
use crate::trade_log::{TradeLog, TradeRecord};
use crate::types::{
    round_price, Combination, DeficitEvent, Opportunity, OrderTicket, PositionInFlight, Side, Tif,
    VenueId,
};
use crate::venue::{VenueApi, VenueError};

/// Why an immediate execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEnd {
    /// Both legs filled (deficit, if any, handed to reconciliation).
    Hedged,
    /// First leg filled below the minimum worth hedging.
    AbortedTinyFill,
    /// First leg failed outright; nothing to hedge.
    AbortedFirstLeg(String),
    /// Another execution already in flight for this (pair, combination).
    Duplicate,
    /// Dry-run mode: logged only.
    DryRun,
    /// Shutdown arrived before the first leg was submitted.
    Shutdown,
}

/// Summary of one immediate execution, for logs and tests.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub opportunity_id: String,
    pub end: ExecutionEnd,
    pub first_filled: f64,
    pub hedged: f64,
    pub deficit: f64,
}

/// Executes immediate opportunities, one call per opportunity.
pub struct ImmediateExecutor {
    opinion: Arc<dyn VenueApi>,
    polymarket: Arc<dyn VenueApi>,
    fees: FeeModel,
    trade_log: Arc<TradeLog>,
    deficit_tx: mpsc::Sender<DeficitEvent>,
    min_hedge_size: f64,
    slippage_cap_ticks: u32,
    order_poll_interval: Duration,
    order_poll_timeout: Duration,
    dry_run: bool,
    in_flight: Mutex<HashSet<(String, Combination)>>,
}

impl ImmediateExecutor {
    pub fn new(
        opinion: Arc<dyn VenueApi>,
        polymarket: Arc<dyn VenueApi>,
        trade_log: Arc<TradeLog>,
        deficit_tx: mpsc::Sender<DeficitEvent>,
        cfg: &Config,
    ) -> Self {
        Self {
            opinion,
            polymarket,
            fees: FeeModel::from_config(cfg),
            trade_log,
            deficit_tx,
            min_hedge_size: cfg.min_hedge_size,
            slippage_cap_ticks: cfg.slippage_cap_ticks,
            order_poll_interval: cfg.order_poll_interval,
            order_poll_timeout: cfg.order_poll_timeout,
            dry_run: cfg.dry_run,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn venue_for(&self, venue: VenueId) -> &Arc<dyn VenueApi> {
        match venue {
            VenueId::Opinion => &self.opinion,
            VenueId::Polymarket => &self.polymarket,
        }
    }

    /// Execute one opportunity end to end.
    pub async fn execute(&self, opp: &Opportunity, shutdown: &CancellationToken) -> ExecutionReport {
        let key = (opp.pair.pair_id.clone(), opp.combination);
        {
            let mut guard = self.in_flight.lock().unwrap();
            if !guard.insert(key.clone()) {
                return self.report(opp, ExecutionEnd::Duplicate, 0.0, 0.0);
            }
        }
        let result = self.execute_inner(opp, shutdown).await;
        self.in_flight.lock().unwrap().remove(&key);
        result
    }

    async fn execute_inner(
        &self,
        opp: &Opportunity,
        shutdown: &CancellationToken,
    ) -> ExecutionReport {
        if shutdown.is_cancelled() {
            return self.report(opp, ExecutionEnd::Shutdown, 0.0, 0.0);
        }

        let target_qty = opp.size_cap;

        // First venue: the one with shallower depth at the best ask, to
        // reduce cancellation risk on the deeper side.
        let opinion_first = opp.opinion_depth <= opp.poly_depth;
        let (first_token, first_price, second_token, second_price) = if opinion_first {
            (
                &opp.opinion_token,
                opp.opinion_price,
                &opp.poly_token,
                opp.poly_price,
            )
        } else {
            (
                &opp.poly_token,
                opp.poly_price,
                &opp.opinion_token,
                opp.opinion_price,
            )
        };

        let first_sized =
            self.fees
                .size_for_platform(first_token.venue, first_price, target_qty, false);

        info!(
            event = "immediate_attempt",
            opportunity_id = %opp.id,
            pair_id = %opp.pair.pair_id,
            combination = %opp.combination,
            first_venue = %first_token.venue,
            first_price,
            second_price,
            target_qty,
            order_qty = first_sized.order_qty,
            effective_edge = opp.effective_edge,
            annualized_pct = opp.annualized_pct,
            "immediate execution"
        );

        if self.dry_run {
            info!(
                opportunity_id = %opp.id,
                "dry run: would cross {:.2} shares at {:.3}/{:.3}",
                target_qty, first_price, second_price
            );
            return self.report(opp, ExecutionEnd::DryRun, 0.0, 0.0);
        }

        // === First leg ===
        let first_ticket = OrderTicket::new(
            first_token.clone(),
            Side::Buy,
            first_sized.effective_qty,
            first_sized.order_qty,
            first_price,
            Tif::Ioc,
        );

        let ack = match self.venue_for(first_token.venue).place_order(&first_ticket).await {
            Ok(ack) => ack,
            Err(e) => {
                // Nothing filled, nothing to hedge.
                warn!(
                    opportunity_id = %opp.id,
                    error = %e,
                    "first leg rejected, aborting opportunity"
                );
                if matches!(e, VenueError::InsufficientBalance) {
                    warn!(
                        event = "balance_paused",
                        venue = %first_token.venue,
                        "insufficient balance on first leg"
                    );
                }
                return self.report(opp, ExecutionEnd::AbortedFirstLeg(e.to_string()), 0.0, 0.0);
            }
        };

        let mut position = PositionInFlight::new(&opp.id, first_ticket.clone());
        position.first_leg.order_id = Some(ack.order_id.clone());

        let first_result = poll_until_terminal(
            self.venue_for(first_token.venue),
            &ack.order_id,
            self.order_poll_interval,
            self.order_poll_timeout,
            shutdown,
        )
        .await;

        let gross_filled = first_result.filled_qty();
        // Net of the fee withheld when the first venue charges one.
        let first_filled =
            self.fees
                .received_for_fill(first_token.venue, first_price, gross_filled, false);
        position.first_filled_qty = first_filled;

        self.log_leg(opp, &first_ticket, gross_filled, first_result.avg_fill_price(), "immediate");

        if first_filled < self.min_hedge_size {
            // Fee losses dominate below this size; book the loss and exit.
            if gross_filled > 0.0 {
                warn!(
                    opportunity_id = %opp.id,
                    gross_filled,
                    first_filled,
                    "first-leg fill below min hedge size, abandoning"
                );
            }
            return self.report(opp, ExecutionEnd::AbortedTinyFill, first_filled, 0.0);
        }

        // === Second leg: hedge exactly what the first leg received ===
        let hedge_limit = round_price(
            (second_price + second_token.tick_size * self.slippage_cap_ticks as f64).min(0.99),
        );
        let second_sized =
            self.fees
                .size_for_platform(second_token.venue, second_price, first_filled, false);
        let second_ticket = OrderTicket::new(
            second_token.clone(),
            Side::Buy,
            second_sized.effective_qty,
            second_sized.order_qty,
            hedge_limit,
            Tif::Ioc,
        );

        let hedged = match self
            .venue_for(second_token.venue)
            .place_order(&second_ticket)
            .await
        {
            Ok(ack) => {
                let result = poll_until_terminal(
                    self.venue_for(second_token.venue),
                    &ack.order_id,
                    self.order_poll_interval,
                    self.order_poll_timeout,
                    shutdown,
                )
                .await;
                let gross = result.filled_qty();
                self.log_leg(opp, &second_ticket, gross, result.avg_fill_price(), "hedge");
                self.fees
                    .received_for_fill(second_token.venue, second_price, gross, false)
            }
            Err(e) => {
                warn!(
                    opportunity_id = %opp.id,
                    error = %e,
                    "hedge leg failed, routing full fill to reconciliation"
                );
                0.0
            }
        };
        position.hedged_qty = hedged;

        let deficit = position.deficit();
        if deficit > 1e-9 {
            let event = DeficitEvent {
                opportunity_id: opp.id.clone(),
                pair_id: opp.pair.pair_id.clone(),
                hedge_token: second_token.clone(),
                deficit_qty: deficit,
                scanned_price: second_price,
                raw_edge: opp.raw_edge,
                detected_at: std::time::Instant::now(),
            };
            if let Err(e) = self.deficit_tx.send(event).await {
                warn!(
                    opportunity_id = %opp.id,
                    deficit,
                    error = %e,
                    "reconciler unavailable; deficit remains open"
                );
            }
        }

        info!(
            event = "immediate_result",
            opportunity_id = %opp.id,
            first_filled,
            hedged,
            deficit,
            "immediate execution finished"
        );
        self.report(opp, ExecutionEnd::Hedged, first_filled, hedged)
    }

    fn log_leg(
        &self,
        opp: &Opportunity,
        ticket: &OrderTicket,
        filled_qty: f64,
        avg_fill_price: f64,
        kind: &str,
    ) {
        let fee = match ticket.venue {
            VenueId::Opinion if filled_qty > 0.0 => {
                self.fees.fee_paid(ticket.limit_price, filled_qty)
            }
            _ => 0.0,
        };
        self.trade_log.record(&TradeRecord {
            timestamp: Utc::now(),
            opportunity_id: opp.id.clone(),
            venue: ticket.venue,
            token_id: ticket.token.token_id.clone(),
            side: ticket.side,
            order_qty: ticket.order_qty,
            limit_price: ticket.limit_price,
            filled_qty,
            avg_fill_price,
            fee,
            kind: kind.to_string(),
        });
    }

    fn report(
        &self,
        opp: &Opportunity,
        end: ExecutionEnd,
        first_filled: f64,
        hedged: f64,
    ) -> ExecutionReport {
        ExecutionReport {
            opportunity_id: opp.id.clone(),
            end,
            first_filled,
            hedged,
            deficit: (first_filled - hedged).max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockVenue;
    use crate::types::{Outcome, StrategyKind, Token};

    fn opportunity(opinion_depth: f64, poly_depth: f64) -> Opportunity {
        let pair = crate::types::MarketPair {
            pair_id: "op-1:pm-1".to_string(),
            question: "Will it happen?".to_string(),
            opinion_yes: Token::new(VenueId::Opinion, "op-1", "oy", Outcome::Yes),
            opinion_no: Token::new(VenueId::Opinion, "op-1", "on", Outcome::No),
            polymarket_yes: Token::new(VenueId::Polymarket, "pm-1", "py", Outcome::Yes),
            polymarket_no: Token::new(VenueId::Polymarket, "pm-1", "pn", Outcome::No),
            resolution_time: None,
            similarity: 1.0,
        };
        Opportunity {
            id: "opp-test".to_string(),
            opinion_token: pair.opinion_yes.clone(),
            opinion_price: 0.55,
            opinion_depth,
            poly_token: pair.polymarket_no.clone(),
            poly_price: 0.40,
            poly_depth,
            pair,
            combination: Combination::OpinionYesPolyNo,
            raw_edge: 0.05,
            effective_edge: 0.045,
            size_cap: 500.0,
            annualized_pct: 40.0,
            strategy: StrategyKind::Immediate,
            detected_at: Utc::now(),
        }
    }

    struct Harness {
        executor: ImmediateExecutor,
        opinion: Arc<MockVenue>,
        polymarket: Arc<MockVenue>,
        deficit_rx: mpsc::Receiver<DeficitEvent>,
        _dir: tempfile::TempDir,
    }

    fn harness(opinion: MockVenue, polymarket: MockVenue) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.dry_run = false;
        let (tx, rx) = mpsc::channel(16);
        let opinion = Arc::new(opinion);
        let polymarket = Arc::new(polymarket);
        let executor = ImmediateExecutor::new(
            opinion.clone(),
            polymarket.clone(),
            Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap()),
            tx,
            &cfg,
        );
        Harness {
            executor,
            opinion,
            polymarket,
            deficit_rx: rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_full_cross_and_hedge() {
        let mut h = harness(
            MockVenue::new(VenueId::Opinion),
            MockVenue::new(VenueId::Polymarket),
        );
        // Opinion is shallower: first leg goes there.
        let opp = opportunity(500.0, 800.0);

        let report = h
            .executor
            .execute(&opp, &CancellationToken::new())
            .await;

        assert_eq!(report.end, ExecutionEnd::Hedged);
        // Oversized first leg nets back to ~500 after the fee.
        assert!((report.first_filled - 500.0).abs() < 0.5);
        assert!((report.hedged - report.first_filled).abs() < 1e-6);
        assert!(report.deficit < 1e-9);

        let first = &h.opinion.placed_orders()[0];
        assert!(first.qty > 500.0, "Opinion leg must be oversized for fees");
        assert_eq!(first.tif, Tif::Ioc);

        let second = &h.polymarket.placed_orders()[0];
        assert!((second.qty - report.first_filled).abs() < 1e-6);

        // Hedge covered everything: no deficit event.
        assert!(h.deficit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deeper_side_goes_second() {
        let h = harness(
            MockVenue::new(VenueId::Opinion),
            MockVenue::new(VenueId::Polymarket),
        );
        // Polymarket shallower this time.
        let opp = opportunity(900.0, 300.0);

        h.executor.execute(&opp, &CancellationToken::new()).await;

        assert_eq!(h.polymarket.placed_orders().len(), 1);
        assert_eq!(h.opinion.placed_orders().len(), 1);
        // Poly first (identity sizing at the cap), Opinion second.
        assert_eq!(h.polymarket.placed_orders()[0].qty, 500.0);
    }

    #[tokio::test]
    async fn test_first_leg_error_aborts() {
        let h = harness(
            MockVenue::new(VenueId::Opinion).failing(),
            MockVenue::new(VenueId::Polymarket),
        );
        let opp = opportunity(500.0, 800.0);

        let report = h.executor.execute(&opp, &CancellationToken::new()).await;

        assert!(matches!(report.end, ExecutionEnd::AbortedFirstLeg(_)));
        assert!(h.polymarket.placed_orders().is_empty(), "no hedge without a fill");
    }

    #[tokio::test]
    async fn test_partial_hedge_emits_deficit() {
        let mut h = harness(
            MockVenue::new(VenueId::Opinion),
            // Hedge only fills 90%.
            MockVenue::new(VenueId::Polymarket).with_ioc_fills("pn", vec![0.9]),
        );
        let opp = opportunity(500.0, 800.0);

        let report = h.executor.execute(&opp, &CancellationToken::new()).await;

        assert_eq!(report.end, ExecutionEnd::Hedged);
        assert!(report.deficit > 0.0);

        let event = h.deficit_rx.try_recv().expect("deficit event expected");
        assert!((event.deficit_qty - report.deficit).abs() < 1e-6);
        assert_eq!(event.hedge_token.token_id, "pn");
        assert_eq!(event.scanned_price, 0.40);
    }

    #[tokio::test]
    async fn test_tiny_fill_abandoned() {
        let mut h = harness(
            // First leg fills a dust amount.
            MockVenue::new(VenueId::Opinion).with_ioc_fills("oy", vec![0.001]),
            MockVenue::new(VenueId::Polymarket),
        );
        let opp = opportunity(500.0, 800.0);

        let report = h.executor.execute(&opp, &CancellationToken::new()).await;

        assert_eq!(report.end, ExecutionEnd::AbortedTinyFill);
        assert!(h.polymarket.placed_orders().is_empty());
        assert!(h.deficit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dry_run_places_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let opinion = Arc::new(MockVenue::new(VenueId::Opinion));
        let polymarket = Arc::new(MockVenue::new(VenueId::Polymarket));
        let cfg = Config::default(); // dry_run defaults to true
        let executor = ImmediateExecutor::new(
            opinion.clone(),
            polymarket.clone(),
            Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap()),
            tx,
            &cfg,
        );

        let report = executor
            .execute(&opportunity(500.0, 800.0), &CancellationToken::new())
            .await;

        assert_eq!(report.end, ExecutionEnd::DryRun);
        assert!(opinion.placed_orders().is_empty());
        assert!(polymarket.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_hedge_never_exceeds_first_fill() {
        let mut h = harness(
            // First leg fills 60% only.
            MockVenue::new(VenueId::Opinion).with_ioc_fills("oy", vec![0.6]),
            MockVenue::new(VenueId::Polymarket),
        );
        let opp = opportunity(500.0, 800.0);

        let report = h.executor.execute(&opp, &CancellationToken::new()).await;

        assert!(report.hedged <= report.first_filled + 1e-9);
        // Hedge sized to the net first-leg fill, not the target.
        let hedge = &h.polymarket.placed_orders()[0];
        assert!((hedge.qty - report.first_filled).abs() < 1e-6);
        assert!(h.deficit_rx.try_recv().is_err());
    }
}
