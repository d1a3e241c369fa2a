//! Deficit reconciliation.
//!
//! Both strategies can end up with shares filled on the first leg that
//! the hedge leg failed to cover. Each such deficit is sent here, and the
//! reconciler walks a deterministic price ladder of progressively more
//! aggressive IOC hedges: scanned price + k * tick for k = 0, 1, 2, ...
//! until the deficit is closed, the ladder price would eat the remaining
//! edge, or the attempt budget runs out. Whatever is left is an open
//! position, surfaced to the operator and recorded in the trade log.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::orders::{poll_until_terminal, PollEnd};
use crate::trade_log::{TradeLog, TradeRecord};
use crate::types::{round_price, DeficitEvent, OrderTicket, Side, Tif, VenueId};
use crate::venue::VenueApi;

/// Slack subtracted from the raw edge when bounding ladder slippage:
/// chasing a fill is pointless once it would consume the edge itself.
const EDGE_SLACK: f64 = 0.005;

/// Build the ladder of hedge prices.
///
/// Prices start at the scanned price and step one tick worse at a time,
/// clamped to the price that would exhaust `raw_edge - EDGE_SLACK`, and
/// never beyond 0.99. No duplicates; deterministic order.
pub fn build_hedge_ladder(
    scanned_price: f64,
    tick: f64,
    raw_edge: f64,
    max_attempts: u32,
) -> Vec<f64> {
    let ceiling = round_price((scanned_price + (raw_edge - EDGE_SLACK).max(0.0)).min(0.99));
    let mut prices = Vec::with_capacity(max_attempts as usize);

    for k in 0..max_attempts {
        let price = round_price(scanned_price + tick * k as f64);
        let clamped = price.min(ceiling);
        if prices.last() == Some(&clamped) {
            break;
        }
        prices.push(clamped);
        if clamped >= ceiling {
            break;
        }
    }
    prices
}

/// Dedicated consumer of deficit events.
pub struct Reconciler {
    opinion: Arc<dyn VenueApi>,
    polymarket: Arc<dyn VenueApi>,
    trade_log: Arc<TradeLog>,
    max_hedge_attempts: u32,
    order_poll_interval: Duration,
    order_poll_timeout: Duration,
    dry_run: bool,
}

impl Reconciler {
    pub fn new(
        opinion: Arc<dyn VenueApi>,
        polymarket: Arc<dyn VenueApi>,
        trade_log: Arc<TradeLog>,
        cfg: &Config,
    ) -> Self {
        Self {
            opinion,
            polymarket,
            trade_log,
            max_hedge_attempts: cfg.max_hedge_attempts,
            order_poll_interval: cfg.order_poll_interval,
            order_poll_timeout: cfg.order_poll_timeout,
            dry_run: cfg.dry_run,
        }
    }

    fn venue_for(&self, venue: VenueId) -> &Arc<dyn VenueApi> {
        match venue {
            VenueId::Opinion => &self.opinion,
            VenueId::Polymarket => &self.polymarket,
        }
    }

    /// Event loop; runs until the channel closes or shutdown is signaled.
    pub async fn run(self, mut rx: mpsc::Receiver<DeficitEvent>, shutdown: CancellationToken) {
        info!("reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Some(event) => self.close_deficit(event, &shutdown).await,
                        None => break,
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// Walk the ladder for one deficit.
    pub async fn close_deficit(&self, event: DeficitEvent, shutdown: &CancellationToken) {
        let mut remaining = event.deficit_qty;
        if remaining <= 0.0 {
            return;
        }

        info!(
            opportunity_id = %event.opportunity_id,
            pair_id = %event.pair_id,
            deficit = remaining,
            scanned_price = event.scanned_price,
            "reconciling deficit"
        );

        if self.dry_run {
            info!(
                opportunity_id = %event.opportunity_id,
                "dry run: would reconcile {:.2} shares",
                remaining
            );
            return;
        }

        let ladder = build_hedge_ladder(
            event.scanned_price,
            event.hedge_token.tick_size,
            event.raw_edge,
            self.max_hedge_attempts,
        );
        let venue = self.venue_for(event.hedge_token.venue);

        for (step, price) in ladder.iter().enumerate() {
            if shutdown.is_cancelled() || remaining <= 0.0 {
                break;
            }
            if remaining < event.hedge_token.min_order_size {
                // Below the venue minimum there is nothing more we can send.
                break;
            }

            let ticket = OrderTicket::new(
                event.hedge_token.clone(),
                Side::Buy,
                remaining,
                remaining,
                *price,
                Tif::Ioc,
            );

            let ack = match venue.place_order(&ticket).await {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(
                        opportunity_id = %event.opportunity_id,
                        step,
                        price,
                        error = %e,
                        "ladder step rejected"
                    );
                    continue;
                }
            };

            let result = poll_until_terminal(
                venue,
                &ack.order_id,
                self.order_poll_interval,
                self.order_poll_timeout,
                shutdown,
            )
            .await;

            let filled = result.filled_qty().min(remaining);
            if filled > 0.0 {
                remaining -= filled;
                self.trade_log.record(&TradeRecord {
                    timestamp: Utc::now(),
                    opportunity_id: event.opportunity_id.clone(),
                    venue: event.hedge_token.venue,
                    token_id: event.hedge_token.token_id.clone(),
                    side: Side::Buy,
                    order_qty: ticket.order_qty,
                    limit_price: *price,
                    filled_qty: filled,
                    avg_fill_price: result.avg_fill_price(),
                    fee: 0.0,
                    kind: "reconcile".to_string(),
                });
                info!(
                    opportunity_id = %event.opportunity_id,
                    step,
                    price,
                    filled,
                    remaining,
                    "ladder step filled"
                );
            }

            if result.end == PollEnd::Canceled {
                break;
            }
        }

        if remaining > 0.0 {
            // Residual exposure stays open; the operator owns it from here.
            error!(
                event = "unhedged_exposure",
                opportunity_id = %event.opportunity_id,
                pair_id = %event.pair_id,
                token = %event.hedge_token.token_id,
                remaining,
                "deficit could not be fully reconciled"
            );
            self.trade_log.record(&TradeRecord {
                timestamp: Utc::now(),
                opportunity_id: event.opportunity_id.clone(),
                venue: event.hedge_token.venue,
                token_id: event.hedge_token.token_id.clone(),
                side: Side::Buy,
                order_qty: remaining,
                limit_price: 0.0,
                filled_qty: 0.0,
                avg_fill_price: 0.0,
                fee: 0.0,
                kind: "deficit".to_string(),
            });
        } else {
            info!(
                opportunity_id = %event.opportunity_id,
                "deficit fully reconciled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockVenue;
    use crate::types::{Outcome, Token};
    use std::time::Instant;

    #[test]
    fn test_ladder_steps_by_tick() {
        // Plenty of edge: five distinct steps.
        let ladder = build_hedge_ladder(0.40, 0.01, 0.10, 5);
        assert_eq!(ladder, vec![0.40, 0.41, 0.42, 0.43, 0.44]);
    }

    #[test]
    fn test_ladder_clamped_by_edge() {
        // raw edge 2%: ceiling = 0.40 + 0.015 = 0.415 -> steps clamp there.
        let ladder = build_hedge_ladder(0.40, 0.01, 0.02, 5);
        assert_eq!(ladder, vec![0.40, 0.41, 0.415]);
    }

    #[test]
    fn test_ladder_degenerate_edge_single_step() {
        // No edge to give away: only the scanned price is acceptable.
        let ladder = build_hedge_ladder(0.40, 0.01, 0.0, 5);
        assert_eq!(ladder, vec![0.40]);
    }

    #[test]
    fn test_ladder_never_exceeds_99_cents() {
        let ladder = build_hedge_ladder(0.97, 0.01, 0.50, 10);
        assert!(ladder.iter().all(|&p| p <= 0.99));
        assert_eq!(*ladder.last().unwrap(), 0.99);
    }

    fn deficit(qty: f64) -> DeficitEvent {
        DeficitEvent {
            opportunity_id: "opp-1".to_string(),
            pair_id: "op-1:pm-1".to_string(),
            hedge_token: Token::new(VenueId::Polymarket, "pm-1", "pn", Outcome::No),
            deficit_qty: qty,
            scanned_price: 0.40,
            raw_edge: 0.05,
            detected_at: Instant::now(),
        }
    }

    fn reconciler(poly: Arc<MockVenue>, dir: &tempfile::TempDir) -> Reconciler {
        let mut cfg = Config::default();
        cfg.dry_run = false;
        Reconciler::new(
            Arc::new(MockVenue::new(VenueId::Opinion)),
            poly,
            Arc::new(TradeLog::open(dir.path().to_str().unwrap()).unwrap()),
            &cfg,
        )
    }

    #[tokio::test]
    async fn test_deficit_closed_on_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let poly = Arc::new(MockVenue::new(VenueId::Polymarket));
        let r = reconciler(poly.clone(), &dir);

        r.close_deficit(deficit(50.0), &CancellationToken::new()).await;

        let placed = poly.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].qty, 50.0);
        assert_eq!(placed[0].price, 0.40);
        assert_eq!(placed[0].tif, Tif::Ioc);
    }

    #[tokio::test]
    async fn test_deficit_walks_ladder_on_partial_fills() {
        let dir = tempfile::tempdir().unwrap();
        // First step fills 60%, second step fills the rest.
        let poly = Arc::new(
            MockVenue::new(VenueId::Polymarket).with_ioc_fills("pn", vec![0.6, 1.0]),
        );
        let r = reconciler(poly.clone(), &dir);

        r.close_deficit(deficit(100.0), &CancellationToken::new()).await;

        let placed = poly.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].price, 0.40);
        assert_eq!(placed[1].price, 0.41);
        assert!((placed[1].qty - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_residual_recorded_when_ladder_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let poly = Arc::new(MockVenue::new(VenueId::Polymarket).with_default_fill_ratio(0.0));
        let r = reconciler(poly.clone(), &dir);

        r.close_deficit(deficit(100.0), &CancellationToken::new()).await;

        let contents =
            std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
        assert!(contents.contains("\"kind\":\"deficit\""));
    }
}
