//! Test support: a scriptable in-memory venue.
//!
//! `MockVenue` implements [`VenueApi`] without any network, with
//! builder-style configuration for books, latency, failure injection,
//! and fill behavior. Used by the unit tests here and the integration
//! tests under `tests/`.

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::{BookSnapshot, MarketSummary, OrderState, OrderTicket, Side, Tif, VenueId};
use crate::venue::{
    Balance, Balances, CancelOutcome, MarketStatusFilter, OrderAck, OrderStatus, VenueApi,
    VenueError, VenueResult,
};

/// A record of one order the mock accepted, for assertions.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub tif: Tif,
}

#[derive(Debug, Clone)]
struct MockOrder {
    qty: f64,
    price: f64,
    state: OrderState,
    filled_qty: f64,
}

/// Scriptable venue double.
pub struct MockVenue {
    venue: VenueId,
    latency: Duration,
    fail_all: bool,
    books: Mutex<FxHashMap<String, BookSnapshot>>,
    markets: Mutex<Vec<MarketSummary>>,
    /// Per-token queue of fill ratios applied to incoming IOC orders;
    /// falls back to `default_fill_ratio` when empty.
    ioc_fill_ratios: Mutex<FxHashMap<String, VecDeque<f64>>>,
    default_fill_ratio: f64,
    orders: Mutex<FxHashMap<String, MockOrder>>,
    placed: Mutex<Vec<PlacedOrder>>,
    balances: Mutex<Balances>,
    next_id: AtomicU64,
}

impl MockVenue {
    pub fn new(venue: VenueId) -> Self {
        Self {
            venue,
            latency: Duration::ZERO,
            fail_all: false,
            books: Mutex::new(FxHashMap::default()),
            markets: Mutex::new(Vec::new()),
            ioc_fill_ratios: Mutex::new(FxHashMap::default()),
            default_fill_ratio: 1.0,
            orders: Mutex::new(FxHashMap::default()),
            placed: Mutex::new(Vec::new()),
            balances: Mutex::new(Balances::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_book(self, book: BookSnapshot) -> Self {
        self.books.lock().unwrap().insert(book.token_id.clone(), book);
        self
    }

    pub fn with_markets(self, markets: Vec<MarketSummary>) -> Self {
        *self.markets.lock().unwrap() = markets;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call fails with a transport error.
    pub fn failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Fraction of each IOC order that fills when no per-token script is set.
    pub fn with_default_fill_ratio(mut self, ratio: f64) -> Self {
        self.default_fill_ratio = ratio;
        self
    }

    /// Queue fill ratios for successive IOC orders on one token.
    pub fn with_ioc_fills(self, token_id: &str, ratios: Vec<f64>) -> Self {
        self.ioc_fill_ratios
            .lock()
            .unwrap()
            .insert(token_id.to_string(), ratios.into());
        self
    }

    pub fn with_balance(self, asset: &str, available: f64) -> Self {
        self.balances.lock().unwrap().insert(
            asset.to_string(),
            Balance {
                available,
                reserved: 0.0,
            },
        );
        self
    }

    /// Replace a book after construction (e.g. to move the market mid-test).
    pub fn set_book(&self, book: BookSnapshot) {
        self.books.lock().unwrap().insert(book.token_id.clone(), book);
    }

    /// Apply a fill to a resting GTC order, as if the venue matched it.
    pub fn fill_gtc(&self, order_id: &str, qty: f64) {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(order_id) {
            if order.state.is_terminal() {
                return;
            }
            order.filled_qty = (order.filled_qty + qty).min(order.qty);
            order.state = if order.filled_qty >= order.qty - 1e-9 {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            };
        }
    }

    /// All orders this venue accepted, in placement order.
    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    /// Current state of one order.
    pub fn order_state(&self, order_id: &str) -> Option<OrderState> {
        self.orders.lock().unwrap().get(order_id).map(|o| o.state)
    }

    async fn simulate(&self) -> VenueResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_all {
            return Err(VenueError::Transport("simulated outage".to_string()));
        }
        Ok(())
    }

    fn next_fill_ratio(&self, token_id: &str) -> f64 {
        let mut scripts = self.ioc_fill_ratios.lock().unwrap();
        scripts
            .get_mut(token_id)
            .and_then(|q| q.pop_front())
            .unwrap_or(self.default_fill_ratio)
    }
}

#[async_trait]
impl VenueApi for MockVenue {
    fn venue_id(&self) -> VenueId {
        self.venue
    }

    async fn list_markets(&self, _status: MarketStatusFilter) -> VenueResult<Vec<MarketSummary>> {
        self.simulate().await?;
        Ok(self.markets.lock().unwrap().clone())
    }

    async fn get_book(&self, token_id: &str) -> VenueResult<BookSnapshot> {
        self.simulate().await?;
        self.books
            .lock()
            .unwrap()
            .get(token_id)
            .cloned()
            .map(|mut b| {
                b.fetched_at = Utc::now();
                b
            })
            .ok_or_else(|| VenueError::Stale(token_id.to_string()))
    }

    async fn get_books_batch(&self, token_ids: &[String]) -> VenueResult<Vec<BookSnapshot>> {
        self.simulate().await?;
        let books = self.books.lock().unwrap();
        Ok(token_ids
            .iter()
            .filter_map(|id| books.get(id).cloned())
            .map(|mut b| {
                b.fetched_at = Utc::now();
                b
            })
            .collect())
    }

    async fn place_order(&self, ticket: &OrderTicket) -> VenueResult<OrderAck> {
        self.simulate().await?;

        let order_id = format!(
            "{}-order-{}",
            self.venue.as_str(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );

        self.placed.lock().unwrap().push(PlacedOrder {
            order_id: order_id.clone(),
            token_id: ticket.token.token_id.clone(),
            side: ticket.side,
            qty: ticket.order_qty,
            price: ticket.limit_price,
            tif: ticket.tif,
        });

        let (state, filled_qty) = match ticket.tif {
            Tif::Ioc => {
                let ratio = self.next_fill_ratio(&ticket.token.token_id).clamp(0.0, 1.0);
                let filled = ticket.order_qty * ratio;
                // IOC terminates at the venue: full fill or canceled remainder.
                let state = if ratio >= 1.0 - 1e-9 {
                    OrderState::Filled
                } else {
                    OrderState::Canceled
                };
                (state, filled)
            }
            Tif::Gtc => (OrderState::Open, 0.0),
        };

        self.orders.lock().unwrap().insert(
            order_id.clone(),
            MockOrder {
                qty: ticket.order_qty,
                price: ticket.limit_price,
                state,
                filled_qty,
            },
        );

        Ok(OrderAck { order_id, state })
    }

    async fn cancel_order(&self, order_id: &str) -> VenueResult<CancelOutcome> {
        self.simulate().await?;
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) if order.state.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            Some(order) => {
                order.state = OrderState::Canceled;
                Ok(CancelOutcome::Acked)
            }
            None => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    async fn poll_order(&self, order_id: &str) -> VenueResult<OrderStatus> {
        self.simulate().await?;
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(order_id)
            .ok_or_else(|| VenueError::NotFound(order_id.to_string()))?;
        Ok(OrderStatus {
            order_id: order_id.to_string(),
            state: order.state,
            filled_qty: order.filled_qty,
            avg_fill_price: order.price,
            fee_paid: 0.0,
        })
    }

    async fn get_balances(&self) -> VenueResult<Balances> {
        self.simulate().await?;
        Ok(self.balances.lock().unwrap().clone())
    }

    fn is_degraded(&self) -> bool {
        self.fail_all
    }
}

/// Convenience: a one-level book for tests.
pub fn book_with_ask(venue: VenueId, token_id: &str, ask: f64, size: f64) -> BookSnapshot {
    BookSnapshot {
        venue,
        token_id: token_id.to_string(),
        bids: vec![crate::types::BookLevel {
            price: crate::types::round_price(ask - 0.02),
            size,
        }],
        asks: vec![crate::types::BookLevel { price: ask, size }],
        fetched_at: Utc::now(),
    }
}
