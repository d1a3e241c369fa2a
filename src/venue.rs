//! Uniform venue adapter surface.
//!
//! Every venue-facing operation the engine needs is expressed through the
//! [`VenueApi`] trait; each response variant has a known shape and every
//! failure is one of the classified [`VenueError`] kinds so callers branch
//! explicitly instead of string-matching. Schema drift surfaces as exactly
//! one error kind and is treated as fatal by the supervisor.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::types::{BookSnapshot, MarketSummary, OrderState, OrderTicket, VenueId};

/// Classified failure from a venue adapter.
#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    /// Transient network / 5xx failure; retried inside the adapter.
    #[error("transport error: {0}")]
    Transport(String),

    /// Venue rejected the request for rate; retried with backoff.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Token or order unknown to the venue.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response did not match the expected shape. Fatal: unsafe to continue.
    #[error("schema error: {0}")]
    Schema(String),

    /// Order rejected for insufficient balance.
    #[error("insufficient balance")]
    InsufficientBalance,

    /// Order failed local or venue-side validation (off-grid price,
    /// size below minimum, notional below minimum).
    #[error("validation: {0}")]
    Validation(String),

    /// Venue reported no book for the token.
    #[error("stale book for {0}")]
    Stale(String),
}

impl VenueError {
    /// Whether the adapter retry loop may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::Transport(_) | VenueError::RateLimited { .. }
        )
    }

    /// Venue-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            VenueError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
}

/// Current status of a placed order.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    /// Cumulative filled quantity in shares (gross, before fee deduction).
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    /// Fee charged by the venue so far, quote units.
    pub fee_paid: f64,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Acked,
    /// The order had already reached a terminal state.
    AlreadyTerminal,
}

/// One asset's balance on a venue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub available: f64,
    pub reserved: f64,
}

/// Balances keyed by asset (collateral symbol or outcome token id).
pub type Balances = std::collections::HashMap<String, Balance>;

/// Status filter for market listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatusFilter {
    Active,
    All,
}

/// Uniform operation set over a venue, independent of which venue it wraps.
///
/// Implementations normalize prices between venue-native strings and the
/// engine's rational form, retry transient failures internally, and mark
/// themselves degraded after repeated failures so the supervisor can pause
/// strategies against them.
#[async_trait]
pub trait VenueApi: Send + Sync {
    fn venue_id(&self) -> VenueId;

    /// Full market listing, pagination handled internally.
    async fn list_markets(&self, status: MarketStatusFilter) -> VenueResult<Vec<MarketSummary>>;

    /// Order book snapshot for one token, or `Stale` if the venue reports
    /// no book.
    async fn get_book(&self, token_id: &str) -> VenueResult<BookSnapshot>;

    /// Snapshots for a set of tokens; partial results allowed. Tokens the
    /// venue could not serve are simply absent from the result.
    async fn get_books_batch(&self, token_ids: &[String]) -> VenueResult<Vec<BookSnapshot>>;

    /// Submit an order; returns the venue order id and initial state.
    async fn place_order(&self, ticket: &OrderTicket) -> VenueResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> VenueResult<CancelOutcome>;

    async fn poll_order(&self, order_id: &str) -> VenueResult<OrderStatus>;

    async fn get_balances(&self) -> VenueResult<Balances>;

    /// Whether repeated failures have marked this venue degraded.
    fn is_degraded(&self) -> bool;

    /// Whether a response failed to decode against the expected shape.
    /// Schema drift is fatal: the supervisor stops the engine on it.
    fn schema_drift(&self) -> bool {
        false
    }
}

/// Consecutive-failure tracker shared by the venue clients.
///
/// Any success resets the counter; `DEGRADED_AFTER_FAILURES` consecutive
/// failures flips the degraded flag until the next success.
#[derive(Debug, Default)]
pub struct HealthTracker {
    consecutive_failures: AtomicU32,
    schema_drift: std::sync::atomic::AtomicBool,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Schema drift latches; it never resets within a process lifetime.
    pub fn record_schema_drift(&self) {
        self.schema_drift.store(true, Ordering::Release);
    }

    pub fn schema_drift(&self) -> bool {
        self.schema_drift.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures.load(Ordering::Acquire) >= crate::config::DEGRADED_AFTER_FAILURES
    }
}
