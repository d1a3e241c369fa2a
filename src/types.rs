//! Core data model shared across the engine.
//!
//! Prices are rational numbers in [0, 1] held as `f64` and normalized to
//! at most `PRICE_DECIMALS` decimal places. Quantities are share counts
//! held as `f64` because fee deduction on the fee-charging venue yields
//! fractional received quantities.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Maximum decimal places a normalized price carries.
pub const PRICE_DECIMALS: u32 = 3;

/// Round a price to the normalized decimal grid.
pub fn round_price(value: f64) -> f64 {
    let factor = 10f64.powi(PRICE_DECIMALS as i32);
    (value * factor).round() / factor
}

/// Check that a price sits on the given tick grid (within float tolerance).
pub fn on_tick_grid(price: f64, tick: f64) -> bool {
    if tick <= 0.0 {
        return false;
    }
    let ticks = price / tick;
    (ticks - ticks.round()).abs() < 1e-6
}

/// Trading venue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueId {
    Opinion,
    Polymarket,
}

impl VenueId {
    pub fn as_str(self) -> &'static str {
        match self {
            VenueId::Opinion => "opinion",
            VenueId::Polymarket => "polymarket",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn complement(self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    /// Immediate-or-cancel; partial fills accepted, remainder canceled.
    Ioc,
    /// Good-till-cancel resting order.
    Gtc,
}

/// One outcome token on one venue for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub venue: VenueId,
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    /// Minimum price increment.
    pub tick_size: f64,
    /// Minimum order size in shares.
    pub min_order_size: f64,
}

impl Token {
    pub fn new(venue: VenueId, market_id: &str, token_id: &str, outcome: Outcome) -> Self {
        Self {
            venue,
            market_id: market_id.to_string(),
            token_id: token_id.to_string(),
            outcome,
            tick_size: 0.01,
            min_order_size: 5.0,
        }
    }
}

/// Market summary returned by a venue's listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub venue: VenueId,
    pub market_id: String,
    pub title: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub resolution_time: Option<DateTime<Utc>>,
    pub tick_size: f64,
    pub min_order_size: f64,
    pub closed: bool,
}

impl MarketSummary {
    pub fn token(&self, outcome: Outcome) -> Token {
        let token_id = match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        };
        Token {
            venue: self.venue,
            market_id: self.market_id.clone(),
            token_id: token_id.clone(),
            outcome,
            tick_size: self.tick_size,
            min_order_size: self.min_order_size,
        }
    }
}

/// A bound pair of markets trading the same real-world question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPair {
    /// Stable identifier: `{opinion_market_id}:{polymarket_market_id}`.
    pub pair_id: String,
    pub question: String,
    pub opinion_yes: Token,
    pub opinion_no: Token,
    pub polymarket_yes: Token,
    pub polymarket_no: Token,
    pub resolution_time: Option<DateTime<Utc>>,
    pub similarity: f64,
}

impl MarketPair {
    /// All four token ids watched for this pair.
    pub fn token_ids(&self) -> [&str; 4] {
        [
            &self.opinion_yes.token_id,
            &self.opinion_no.token_id,
            &self.polymarket_yes.token_id,
            &self.polymarket_no.token_id,
        ]
    }

    /// Days until resolution, floored at 1.0 when past or unknown.
    pub fn days_to_resolution(&self, now: DateTime<Utc>) -> f64 {
        match self.resolution_time {
            Some(t) => {
                let secs = (t - now).num_seconds() as f64;
                (secs / 86_400.0).max(1.0)
            }
            None => 1.0,
        }
    }
}

/// One price level of an order book, cumulative size at that price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Order book snapshot for a single token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub venue: VenueId,
    pub token_id: String,
    /// Descending price.
    pub bids: Vec<BookLevel>,
    /// Ascending price.
    pub asks: Vec<BookLevel>,
    pub fetched_at: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Derive the complement token's book by reflecting prices around 1.00:
    /// asks on YES become bids on NO and vice versa.
    pub fn derive_complement(&self, complement_token_id: &str) -> BookSnapshot {
        let mut bids: Vec<BookLevel> = self
            .asks
            .iter()
            .map(|l| BookLevel {
                price: round_price(1.0 - l.price),
                size: l.size,
            })
            .collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));

        let mut asks: Vec<BookLevel> = self
            .bids
            .iter()
            .map(|l| BookLevel {
                price: round_price(1.0 - l.price),
                size: l.size,
            })
            .collect();
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        BookSnapshot {
            venue: self.venue,
            token_id: complement_token_id.to_string(),
            bids,
            asks,
            fetched_at: self.fetched_at,
        }
    }
}

/// One consistent view of all watched books, gathered in a single scan cycle.
#[derive(Debug, Clone)]
pub struct ScanFrame {
    pub frame_time: DateTime<Utc>,
    pub books: FxHashMap<String, BookSnapshot>,
}

impl ScanFrame {
    pub fn empty(frame_time: DateTime<Utc>) -> Self {
        Self {
            frame_time,
            books: FxHashMap::default(),
        }
    }

    pub fn book(&self, token_id: &str) -> Option<&BookSnapshot> {
        self.books.get(token_id)
    }
}

/// Which venue carries the YES leg of a crossing combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combination {
    /// Buy YES on Opinion, buy NO on Polymarket.
    OpinionYesPolyNo,
    /// Buy NO on Opinion, buy YES on Polymarket.
    OpinionNoPolyYes,
}

impl Combination {
    pub const ALL: [Combination; 2] = [Combination::OpinionYesPolyNo, Combination::OpinionNoPolyYes];

    pub fn as_str(self) -> &'static str {
        match self {
            Combination::OpinionYesPolyNo => "opinion_yes_poly_no",
            Combination::OpinionNoPolyYes => "opinion_no_poly_yes",
        }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy classification assigned by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Immediate,
    Liquidity,
}

/// An apparent arbitrage between complementary tokens across venues.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: String,
    pub pair: MarketPair,
    pub combination: Combination,
    /// Token bought on Opinion and its best ask.
    pub opinion_token: Token,
    pub opinion_price: f64,
    pub opinion_depth: f64,
    /// Token bought on Polymarket and its best ask.
    pub poly_token: Token,
    pub poly_price: f64,
    pub poly_depth: f64,
    /// `1 - (p_opinion + p_poly)` before fees.
    pub raw_edge: f64,
    /// Edge after replacing the Opinion price with its effective per-share cost.
    pub effective_edge: f64,
    pub size_cap: f64,
    /// Effective-edge return annualized over days to resolution, percent.
    pub annualized_pct: f64,
    pub strategy: StrategyKind,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    /// Total ask cost per share before fees.
    pub fn gross_cost(&self) -> f64 {
        self.opinion_price + self.poly_price
    }
}

/// Lifecycle state of a placed order, as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    PendingSubmit,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// A placed or intended order.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub venue: VenueId,
    pub token: Token,
    pub side: Side,
    /// Shares the operator wants to end up holding after fees.
    pub target_fill_qty: f64,
    /// Shares actually submitted; differs from target when a per-unit fee
    /// is withheld from the received quantity.
    pub order_qty: f64,
    pub limit_price: f64,
    pub tif: Tif,
    pub state: OrderState,
    pub order_id: Option<String>,
}

impl OrderTicket {
    pub fn new(
        token: Token,
        side: Side,
        target_fill_qty: f64,
        order_qty: f64,
        limit_price: f64,
        tif: Tif,
    ) -> Self {
        Self {
            venue: token.venue,
            token,
            side,
            target_fill_qty,
            order_qty,
            limit_price,
            tif,
            state: OrderState::PendingSubmit,
            order_id: None,
        }
    }
}

/// Bookkeeping for one in-progress arbitrage: the first leg and its hedge.
#[derive(Debug, Clone)]
pub struct PositionInFlight {
    pub opportunity_id: String,
    pub first_leg: OrderTicket,
    pub second_leg: Option<OrderTicket>,
    pub first_filled_qty: f64,
    pub hedged_qty: f64,
}

impl PositionInFlight {
    pub fn new(opportunity_id: &str, first_leg: OrderTicket) -> Self {
        Self {
            opportunity_id: opportunity_id.to_string(),
            first_leg,
            second_leg: None,
            first_filled_qty: 0.0,
            hedged_qty: 0.0,
        }
    }

    /// Shares filled on the first leg but not yet hedged on the second.
    pub fn deficit(&self) -> f64 {
        (self.first_filled_qty - self.hedged_qty).max(0.0)
    }
}

/// Shares filled on a first leg that the hedge leg failed to cover.
/// Consumed by the reconciliation task.
#[derive(Debug, Clone)]
pub struct DeficitEvent {
    pub opportunity_id: String,
    pub pair_id: String,
    /// Token still needing to be bought to balance the position.
    pub hedge_token: Token,
    pub deficit_qty: f64,
    /// Price the hedge was scanned at; the ladder starts here.
    pub scanned_price: f64,
    /// Raw edge of the originating opportunity; bounds acceptable slippage.
    pub raw_edge: f64,
    pub detected_at: Instant,
}
