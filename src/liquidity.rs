//! Liquidity-making strategy.
//!
//! For opportunities whose effective edge is below the immediate bar but
//! whose annualized return clears the liquidity threshold, the engine
//! rests a fee-free maker order on Opinion one tick better than the best
//! ask and hedges each observed fill on Polymarket with an IOC at the
//! pre-computed price.
//!
//! Ticket lifecycle:
//!
//! ```text
//! IDLE -> RESTING -> PARTIALLY_FILLED <-> RESTING -> FILLED -> HEDGING -> DONE
//!                          |
//!                     REPRICING -> RESTING
//!                          |
//!                      CANCELING -> IDLE (on exit)
//! ```
//!
//! All ticket mutations happen on the supervisor's task; nothing here is
//! shared mutably across tasks. Invariants: `hedged_qty <= filled_qty` at
//! all times, at most one resting order per (pair, combination), hedge
//! orders are always IOC, and a cancel is confirmed before any re-submit.

use chrono::Utc;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fees::FeeModel;
use crate::orders::cancel_and_confirm;
use crate::orders::poll_until_terminal;
use crate::trade_log::{TradeLog, TradeRecord};
use crate::types::{
    round_price, BookSnapshot, Combination, DeficitEvent, Opportunity, OrderState, OrderTicket,
    ScanFrame, Side, StrategyKind, Tif, Token, VenueId,
};
use crate::venue::VenueApi;

/// Ticket lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Resting,
    PartiallyFilled,
    Hedging,
    Done,
}

/// One live resting order plus its hedge bookkeeping.
#[derive(Debug)]
pub struct LiquidityTicket {
    pub pair_id: String,
    pub combination: Combination,
    pub opportunity_id: String,
    pub rest_token: Token,
    pub hedge_token: Token,
    pub rest_price: f64,
    pub hedge_price: f64,
    pub order_id: String,
    /// Quantity of the currently working order.
    pub order_qty: f64,
    /// Fills observed on the currently working order.
    pub order_filled_qty: f64,
    /// Cumulative fills across this ticket's orders (reprices included).
    pub filled_qty: f64,
    pub hedged_qty: f64,
    pub state: TicketState,
    pub last_reprice: Instant,
    pub raw_edge: f64,
}

impl LiquidityTicket {
    fn hedge_due(&self) -> f64 {
        (self.filled_qty - self.hedged_qty).max(0.0)
    }
}

/// Where a retired ticket ended up, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Filled,
    EdgeCollapsed,
    OpportunityGone,
    RemainderBelowMin,
    Shutdown,
}

/// Compute the resting price for a book: one tick better than the best
/// ask, but never below one tick above the best bid, and strictly inside
/// the spread. `None` when the book leaves no room to rest.
pub fn rest_price(book: &BookSnapshot, scanned_ask: f64, tick: f64) -> Option<f64> {
    let best_ask = book.best_ask()?.price;
    let best_bid = book.best_bid().map(|l| l.price).unwrap_or(0.0);

    let candidate = round_price((best_bid + tick).max(scanned_ask - tick));
    if candidate >= best_ask || candidate <= 0.0 {
        return None;
    }
    Some(candidate)
}

/// Owner of all liquidity tickets. Driven by the supervisor, one frame at
/// a time.
pub struct LiquidityManager {
    opinion: Arc<dyn VenueApi>,
    polymarket: Arc<dyn VenueApi>,
    fees: FeeModel,
    trade_log: Arc<TradeLog>,
    deficit_tx: mpsc::Sender<DeficitEvent>,
    target_size: f64,
    max_tickets: usize,
    exit_annualized_pct: f64,
    min_annualized_pct: f64,
    reprice_interval: Duration,
    slippage_cap_ticks: u32,
    order_poll_interval: Duration,
    order_poll_timeout: Duration,
    cancel_timeout: Duration,
    dry_run: bool,
    tickets: FxHashMap<(String, Combination), LiquidityTicket>,
}

impl LiquidityManager {
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
            target_size: cfg.liquidity_target_size,
            max_tickets: cfg.max_liquidity_tickets,
            exit_annualized_pct: cfg.liquidity_exit_annualized_pct(),
            min_annualized_pct: cfg.liquidity_min_annualized_pct,
            reprice_interval: cfg.liquidity_reprice_interval,
            slippage_cap_ticks: cfg.slippage_cap_ticks,
            order_poll_interval: cfg.order_poll_interval,
            order_poll_timeout: cfg.order_poll_timeout,
            cancel_timeout: cfg.cancel_timeout,
            dry_run: cfg.dry_run,
            tickets: FxHashMap::default(),
        }
    }

    pub fn active_tickets(&self) -> usize {
        self.tickets.len()
    }

    /// Drive every ticket one step against a fresh frame, then open
    /// tickets for new liquidity opportunities while capacity remains.
    pub async fn on_frame(
        &mut self,
        frame: &ScanFrame,
        opportunities: &[Opportunity],
        shutdown: &CancellationToken,
    ) {
        if shutdown.is_cancelled() {
            return;
        }

        // Latest view of each (pair, combination) we might act on.
        let mut live: FxHashMap<(String, Combination), &Opportunity> = FxHashMap::default();
        for opp in opportunities {
            if opp.strategy == StrategyKind::Liquidity {
                live.insert((opp.pair.pair_id.clone(), opp.combination), opp);
            }
        }

        // Step 1: observe fills, retire or reprice existing tickets.
        let keys: Vec<(String, Combination)> = self.tickets.keys().cloned().collect();
        for key in keys {
            if shutdown.is_cancelled() {
                return;
            }
            if let Some(ticket) = self.tickets.remove(&key) {
                if let Some(ticket) = self
                    .step_ticket(ticket, frame, live.get(&key).copied(), shutdown)
                    .await
                {
                    self.tickets.insert(key, ticket);
                }
            }
        }

        // Step 2: open new tickets.
        for (key, opp) in live {
            if self.tickets.contains_key(&key) {
                continue;
            }
            if self.tickets.len() >= self.max_tickets {
                debug!(max = self.max_tickets, "liquidity ticket cap reached");
                break;
            }
            if shutdown.is_cancelled() {
                return;
            }
            self.open_ticket(opp, frame).await;
        }
    }

    /// Cancel everything, observe pending fills, hedge what exists.
    pub async fn drain(&mut self, shutdown: &CancellationToken) {
        let keys: Vec<(String, Combination)> = self.tickets.keys().cloned().collect();
        for key in keys {
            if let Some(ticket) = self.tickets.remove(&key) {
                self.cancel_and_settle(ticket, RetireReason::Shutdown, shutdown)
                    .await;
            }
        }
    }

    /// One step of a ticket's state machine. Returns the ticket if it is
    /// still alive, or `None` once retired.
    async fn step_ticket(
        &mut self,
        mut ticket: LiquidityTicket,
        frame: &ScanFrame,
        opp: Option<&Opportunity>,
        shutdown: &CancellationToken,
    ) -> Option<LiquidityTicket> {
        // Observe venue-reported state first: fills always take priority.
        match self.opinion.poll_order(&ticket.order_id).await {
            Ok(status) => {
                let delta = (status.filled_qty - ticket.order_filled_qty).max(0.0);
                if delta > 0.0 {
                    ticket.order_filled_qty = status.filled_qty;
                    ticket.filled_qty += delta;
                    info!(
                        event = "liquidity_fill",
                        pair_id = %ticket.pair_id,
                        combination = %ticket.combination,
                        delta,
                        filled = ticket.filled_qty,
                        order_qty = ticket.order_qty,
                        "resting order filled"
                    );
                    self.log_rest_fill(&ticket, delta);
                    ticket.state = TicketState::Hedging;
                    self.hedge(&mut ticket, shutdown).await;
                }

                match status.state {
                    OrderState::Filled => {
                        self.retire(ticket, RetireReason::Filled, shutdown).await;
                        return None;
                    }
                    OrderState::Canceled | OrderState::Rejected => {
                        // Out of the book; settle whatever filled.
                        self.retire(ticket, RetireReason::OpportunityGone, shutdown)
                            .await;
                        return None;
                    }
                    OrderState::PartiallyFilled => {
                        ticket.state = TicketState::PartiallyFilled;
                        let remainder = ticket.order_qty - ticket.order_filled_qty;
                        if remainder < ticket.rest_token.min_order_size {
                            self.cancel_and_settle(
                                ticket,
                                RetireReason::RemainderBelowMin,
                                shutdown,
                            )
                            .await;
                            return None;
                        }
                    }
                    _ => {
                        if ticket.state != TicketState::PartiallyFilled {
                            ticket.state = TicketState::Resting;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(
                    order_id = %ticket.order_id,
                    error = %e,
                    "liquidity order poll failed; keeping ticket"
                );
            }
        }

        // Exit check: opportunity vanished or its edge collapsed.
        let collapsed = match opp {
            None => true,
            Some(o) => o.annualized_pct < self.exit_annualized_pct,
        };
        if collapsed {
            self.cancel_and_settle(ticket, RetireReason::EdgeCollapsed, shutdown)
                .await;
            return None;
        }
        let opp = opp.expect("checked above");

        // Keep the hedge price current while the opportunity is live.
        ticket.hedge_price = opp.poly_price;
        ticket.raw_edge = opp.raw_edge;

        // Reprice check, rate-limited per ticket.
        if ticket.last_reprice.elapsed() >= self.reprice_interval {
            if let Some(book) = frame.book(&opp.pair.opinion_yes.token_id) {
                let book = self.rest_side_book(book, &ticket);
                if let Some(desired) =
                    rest_price(&book, opp.opinion_price, ticket.rest_token.tick_size)
                {
                    let outbid = book
                        .best_bid()
                        .map(|b| b.price > ticket.rest_price + 1e-9)
                        .unwrap_or(false);
                    if outbid || (desired - ticket.rest_price).abs() > 1e-9 {
                        info!(
                            event = "liquidity_reprice",
                            pair_id = %ticket.pair_id,
                            combination = %ticket.combination,
                            old_price = ticket.rest_price,
                            new_price = desired,
                            outbid,
                            "repricing resting order"
                        );
                        return self.reprice(ticket, desired, shutdown).await;
                    }
                }
            }
        }

        Some(ticket)
    }

    /// The frame carries the YES-side book; reflect when the ticket rests
    /// on the NO token.
    fn rest_side_book(&self, book: &BookSnapshot, ticket: &LiquidityTicket) -> BookSnapshot {
        if book.token_id == ticket.rest_token.token_id {
            book.clone()
        } else {
            book.derive_complement(&ticket.rest_token.token_id)
        }
    }

    async fn open_ticket(&mut self, opp: &Opportunity, frame: &ScanFrame) {
        // The frame holds the YES book for the opinion market; derive the
        // NO book when this combination rests on the NO side.
        let rest_book = match opp.combination {
            Combination::OpinionYesPolyNo => frame.book(&opp.opinion_token.token_id).cloned(),
            Combination::OpinionNoPolyYes => frame
                .book(&opp.pair.opinion_yes.token_id)
                .map(|b| b.derive_complement(&opp.opinion_token.token_id)),
        };
        let Some(book) = rest_book else {
            return;
        };

        let tick = opp.opinion_token.tick_size;
        let Some(price) = rest_price(&book, opp.opinion_price, tick) else {
            debug!(
                pair_id = %opp.pair.pair_id,
                combination = %opp.combination,
                "no room inside the spread to rest"
            );
            return;
        };

        // Re-check the return at the actual resting price; maker orders
        // are fee-free so the raw sum is the cost.
        let cost = price + opp.poly_price;
        if cost <= 0.0 || cost >= 1.0 {
            return;
        }
        let edge = 1.0 - cost;
        let days = opp.pair.days_to_resolution(Utc::now());
        let annualized = edge / cost * (365.0 / days) * 100.0;
        if annualized < self.min_annualized_pct {
            return;
        }

        let qty = self.target_size.min(opp.size_cap);
        if qty < opp.opinion_token.min_order_size {
            return;
        }

        if self.dry_run {
            info!(
                pair_id = %opp.pair.pair_id,
                combination = %opp.combination,
                price,
                qty,
                annualized,
                "dry run: would rest liquidity order"
            );
            return;
        }

        // Maker sizing is the identity: no fee is withheld on Opinion makers.
        let sized = self
            .fees
            .size_for_platform(VenueId::Opinion, price, qty, true);
        let order = OrderTicket::new(
            opp.opinion_token.clone(),
            Side::Buy,
            sized.effective_qty,
            sized.order_qty,
            price,
            Tif::Gtc,
        );

        match self.opinion.place_order(&order).await {
            Ok(ack) => {
                info!(
                    event = "liquidity_rest",
                    pair_id = %opp.pair.pair_id,
                    combination = %opp.combination,
                    price,
                    qty = sized.order_qty,
                    hedge_price = opp.poly_price,
                    annualized,
                    "resting order placed"
                );
                self.tickets.insert(
                    (opp.pair.pair_id.clone(), opp.combination),
                    LiquidityTicket {
                        pair_id: opp.pair.pair_id.clone(),
                        combination: opp.combination,
                        opportunity_id: opp.id.clone(),
                        rest_token: opp.opinion_token.clone(),
                        hedge_token: opp.poly_token.clone(),
                        rest_price: price,
                        hedge_price: opp.poly_price,
                        order_id: ack.order_id,
                        order_qty: sized.order_qty,
                        order_filled_qty: 0.0,
                        filled_qty: 0.0,
                        hedged_qty: 0.0,
                        state: TicketState::Resting,
                        last_reprice: Instant::now(),
                        raw_edge: opp.raw_edge,
                    },
                );
            }
            Err(e) => {
                warn!(
                    pair_id = %opp.pair.pair_id,
                    combination = %opp.combination,
                    error = %e,
                    "failed to rest liquidity order"
                );
            }
        }
    }

    /// Hedge whatever has filled but not yet been hedged. Always IOC,
    /// never resting, and never more than the first leg's fill.
    async fn hedge(&self, ticket: &mut LiquidityTicket, shutdown: &CancellationToken) {
        let due = ticket.hedge_due();
        if due <= 0.0 {
            return;
        }
        if due < ticket.hedge_token.min_order_size {
            // Too small to send; accumulates until the next fill or settle.
            debug!(
                pair_id = %ticket.pair_id,
                due,
                "hedge delta below venue minimum, deferring"
            );
            return;
        }

        let limit = round_price(
            (ticket.hedge_price + ticket.hedge_token.tick_size * self.slippage_cap_ticks as f64)
                .min(0.99),
        );
        let sized =
            self.fees
                .size_for_platform(ticket.hedge_token.venue, ticket.hedge_price, due, false);
        let order = OrderTicket::new(
            ticket.hedge_token.clone(),
            Side::Buy,
            sized.effective_qty,
            sized.order_qty,
            limit,
            Tif::Ioc,
        );

        match self.polymarket.place_order(&order).await {
            Ok(ack) => {
                let result = poll_until_terminal(
                    &self.polymarket,
                    &ack.order_id,
                    self.order_poll_interval,
                    self.order_poll_timeout,
                    shutdown,
                )
                .await;
                let filled = result.filled_qty().min(due);
                ticket.hedged_qty += filled;
                self.trade_log.record(&TradeRecord {
                    timestamp: Utc::now(),
                    opportunity_id: ticket.opportunity_id.clone(),
                    venue: ticket.hedge_token.venue,
                    token_id: ticket.hedge_token.token_id.clone(),
                    side: Side::Buy,
                    order_qty: sized.order_qty,
                    limit_price: limit,
                    filled_qty: filled,
                    avg_fill_price: result.avg_fill_price(),
                    fee: 0.0,
                    kind: "hedge".to_string(),
                });
                info!(
                    event = "liquidity_hedge",
                    pair_id = %ticket.pair_id,
                    hedged = filled,
                    total_hedged = ticket.hedged_qty,
                    filled = ticket.filled_qty,
                    "hedge executed"
                );
            }
            Err(e) => {
                warn!(
                    pair_id = %ticket.pair_id,
                    error = %e,
                    "hedge order failed"
                );
            }
        }
    }

    /// Cancel the resting order, confirm, observe any fills that landed
    /// during cancellation, then retire the ticket.
    async fn cancel_and_settle(
        &mut self,
        mut ticket: LiquidityTicket,
        reason: RetireReason,
        shutdown: &CancellationToken,
    ) {
        match cancel_and_confirm(
            &self.opinion,
            &ticket.order_id,
            self.order_poll_interval,
            self.cancel_timeout,
            shutdown,
        )
        .await
        {
            Ok(result) => {
                let final_filled = result.filled_qty().max(ticket.order_filled_qty);
                let delta = final_filled - ticket.order_filled_qty;
                if delta > 0.0 {
                    ticket.order_filled_qty = final_filled;
                    ticket.filled_qty += delta;
                    self.log_rest_fill(&ticket, delta);
                }
            }
            Err(e) => {
                warn!(
                    order_id = %ticket.order_id,
                    error = %e,
                    "cancel failed; settling with last known fill"
                );
            }
        }
        self.retire(ticket, reason, shutdown).await;
    }

    /// Final hedge pass, deficit hand-off, and removal.
    async fn retire(
        &mut self,
        mut ticket: LiquidityTicket,
        reason: RetireReason,
        shutdown: &CancellationToken,
    ) {
        ticket.state = TicketState::Hedging;
        self.hedge(&mut ticket, shutdown).await;

        let residual = ticket.hedge_due();
        if residual > 1e-9 {
            let event = DeficitEvent {
                opportunity_id: ticket.opportunity_id.clone(),
                pair_id: ticket.pair_id.clone(),
                hedge_token: ticket.hedge_token.clone(),
                deficit_qty: residual,
                scanned_price: ticket.hedge_price,
                raw_edge: ticket.raw_edge,
                detected_at: Instant::now(),
            };
            if let Err(e) = self.deficit_tx.send(event).await {
                warn!(
                    pair_id = %ticket.pair_id,
                    residual,
                    error = %e,
                    "reconciler unavailable; liquidity deficit remains open"
                );
            }
        }

        ticket.state = TicketState::Done;
        info!(
            event = "liquidity_retired",
            pair_id = %ticket.pair_id,
            combination = %ticket.combination,
            reason = ?reason,
            filled = ticket.filled_qty,
            hedged = ticket.hedged_qty,
            "ticket retired"
        );
    }

    /// Cancel and re-rest at a new price. The cancel is confirmed before
    /// the re-submit, so duplicate exposure is impossible. Returns the
    /// ticket if it is still alive.
    async fn reprice(
        &mut self,
        mut ticket: LiquidityTicket,
        new_price: f64,
        shutdown: &CancellationToken,
    ) -> Option<LiquidityTicket> {
        match cancel_and_confirm(
            &self.opinion,
            &ticket.order_id,
            self.order_poll_interval,
            self.cancel_timeout,
            shutdown,
        )
        .await
        {
            Ok(result) => {
                let final_filled = result.filled_qty().max(ticket.order_filled_qty);
                let delta = final_filled - ticket.order_filled_qty;
                if delta > 0.0 {
                    ticket.order_filled_qty = final_filled;
                    ticket.filled_qty += delta;
                    self.log_rest_fill(&ticket, delta);
                    self.hedge(&mut ticket, shutdown).await;
                }
            }
            Err(e) => {
                warn!(
                    order_id = %ticket.order_id,
                    error = %e,
                    "reprice cancel failed; keeping old order"
                );
                return Some(ticket);
            }
        }

        let remainder = ticket.order_qty - ticket.order_filled_qty;
        if remainder < ticket.rest_token.min_order_size {
            self.retire(ticket, RetireReason::RemainderBelowMin, shutdown)
                .await;
            return None;
        }

        let order = OrderTicket::new(
            ticket.rest_token.clone(),
            Side::Buy,
            remainder,
            remainder,
            new_price,
            Tif::Gtc,
        );
        match self.opinion.place_order(&order).await {
            Ok(ack) => {
                ticket.order_id = ack.order_id;
                ticket.order_qty = remainder;
                ticket.order_filled_qty = 0.0;
                ticket.rest_price = new_price;
                ticket.state = TicketState::Resting;
                ticket.last_reprice = Instant::now();
                Some(ticket)
            }
            Err(e) => {
                warn!(
                    pair_id = %ticket.pair_id,
                    error = %e,
                    "re-rest after cancel failed"
                );
                self.retire(ticket, RetireReason::OpportunityGone, shutdown)
                    .await;
                None
            }
        }
    }

    fn log_rest_fill(&self, ticket: &LiquidityTicket, delta: f64) {
        self.trade_log.record(&TradeRecord {
            timestamp: Utc::now(),
            opportunity_id: ticket.opportunity_id.clone(),
            venue: ticket.rest_token.venue,
            token_id: ticket.rest_token.token_id.clone(),
            side: Side::Buy,
            order_qty: ticket.order_qty,
            limit_price: ticket.rest_price,
            filled_qty: delta,
            avg_fill_price: ticket.rest_price,
            fee: 0.0,
            kind: "liquidity".to_string(),
        });
    }
}
