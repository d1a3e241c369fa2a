//! Polymarket CLOB REST client.
//!
//! Flat JSON responses (no envelope), string-encoded prices and sizes,
//! and a true batch books endpoint. No order-side fee in this model, so
//! sizing against this venue is the identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::{Config, POLYMARKET_API_BASE};
use crate::retry::{retry_venue_call, RetryPolicy};
use crate::types::{
    on_tick_grid, round_price, BookLevel, BookSnapshot, MarketSummary, OrderState, OrderTicket,
    Side, Tif, VenueId,
};
use crate::venue::{
    Balance, Balances, CancelOutcome, HealthTracker, MarketStatusFilter, OrderAck, OrderStatus,
    VenueApi, VenueError, VenueResult,
};

/// Page size for the markets listing.
const LIST_PAGE_LIMIT: u32 = 100;

/// Hard stop on pagination cursor walks.
const LIST_MAX_PAGES: u32 = 100;

/// Credentials for the Polymarket API.
#[derive(Debug, Clone)]
pub struct PolymarketConfig {
    pub host: String,
    pub api_key: String,
    pub api_secret: String,
}

impl PolymarketConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("PM_HOST").unwrap_or_else(|_| POLYMARKET_API_BASE.to_string());
        let api_key =
            std::env::var("PM_API_KEY").map_err(|_| anyhow::anyhow!("PM_API_KEY not set"))?;
        let api_secret =
            std::env::var("PM_API_SECRET").map_err(|_| anyhow::anyhow!("PM_API_SECRET not set"))?;
        Ok(Self {
            host,
            api_key,
            api_secret,
        })
    }
}

// === Wire DTOs ===

#[derive(Debug, Deserialize)]
struct RawMarketsPage {
    #[serde(default)]
    data: Vec<RawMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    condition_id: String,
    question: String,
    #[serde(default)]
    tokens: Vec<RawMarketToken>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default = "default_tick")]
    minimum_tick_size: f64,
    #[serde(default = "default_min_size")]
    minimum_order_size: f64,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    active: bool,
}

fn default_tick() -> f64 {
    0.01
}

fn default_min_size() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
struct RawMarketToken {
    token_id: String,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    #[serde(rename = "orderID")]
    order_id: Option<String>,
    #[serde(default)]
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOrderStatus {
    id: String,
    status: String,
    #[serde(default)]
    size_matched: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBalanceEntry {
    asset: String,
    balance: String,
    #[serde(default)]
    reserved: Option<String>,
}

/// Render a normalized price as the decimal string Polymarket expects.
pub fn format_price(price: f64) -> String {
    format!("{:.3}", round_price(price))
}

/// Parse a venue-native price string into normalized form.
pub fn parse_price(raw: &str) -> VenueResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map(round_price)
        .map_err(|_| VenueError::Schema(format!("unparseable price '{}'", raw)))
}

fn parse_qty(raw: &str) -> VenueResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| VenueError::Schema(format!("unparseable quantity '{}'", raw)))
}

fn map_order_state(status: &str) -> OrderState {
    match status.to_lowercase().as_str() {
        "live" | "open" => OrderState::Open,
        "matched" | "filled" => OrderState::Filled,
        "partially_matched" | "partial" => OrderState::PartiallyFilled,
        "canceled" | "cancelled" | "expired" | "unmatched" => OrderState::Canceled,
        "rejected" | "invalid" => OrderState::Rejected,
        _ => OrderState::Open,
    }
}

/// Polymarket venue client. Owns its own HTTP connection pool.
pub struct PolymarketClient {
    http: reqwest::Client,
    host: String,
    api_key: String,
    api_secret: String,
    retry: RetryPolicy,
    health: HealthTracker,
}

impl PolymarketClient {
    pub fn new(config: PolymarketConfig, engine_cfg: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(engine_cfg.order_place_timeout.max(Duration::from_secs(5)))
            .build()?;
        Ok(Self {
            http,
            host: config.host,
            api_key: config.api_key,
            api_secret: config.api_secret,
            retry: RetryPolicy::from_env(),
            health: HealthTracker::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> VenueResult<T> {
        let resp = req
            .header("POLY-API-KEY", &self.api_key)
            .header("POLY-SECRET", &self.api_secret)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body, retry_after));
        }

        resp.json::<T>()
            .await
            .map_err(|e| VenueError::Schema(format!("response decode failed: {}", e)))
    }

    fn observe<T>(&self, result: VenueResult<T>) -> VenueResult<T> {
        match &result {
            Ok(_) => self.health.record_success(),
            Err(VenueError::Schema(msg)) => {
                warn!(venue = "polymarket", "schema drift: {}", msg);
                self.health.record_schema_drift();
            }
            Err(e) if e.is_retryable() => {
                let failures = self.health.record_failure();
                if self.health.is_degraded() {
                    warn!(
                        venue = "polymarket",
                        consecutive_failures = failures,
                        "venue marked degraded"
                    );
                }
            }
            Err(_) => self.health.record_success(),
        }
        result
    }

    fn normalize_book(raw: RawBook, fallback_token: &str) -> VenueResult<BookSnapshot> {
        let token_id = raw
            .asset_id
            .clone()
            .unwrap_or_else(|| fallback_token.to_string());

        let mut bids = Vec::with_capacity(raw.bids.len());
        for level in &raw.bids {
            let price = parse_price(&level.price)?;
            let size = parse_qty(&level.size)?;
            if size > 0.0 {
                bids.push(BookLevel { price, size });
            }
        }
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));

        let mut asks = Vec::with_capacity(raw.asks.len());
        for level in &raw.asks {
            let price = parse_price(&level.price)?;
            let size = parse_qty(&level.size)?;
            if size > 0.0 {
                asks.push(BookLevel { price, size });
            }
        }
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        Ok(BookSnapshot {
            venue: VenueId::Polymarket,
            token_id,
            bids,
            asks,
            fetched_at: Utc::now(),
        })
    }

    fn market_summary(raw: RawMarket) -> Option<MarketSummary> {
        let mut yes_token = None;
        let mut no_token = None;
        for token in &raw.tokens {
            match token.outcome.to_lowercase().as_str() {
                "yes" => yes_token = Some(token.token_id.clone()),
                "no" => no_token = Some(token.token_id.clone()),
                _ => {}
            }
        }
        let (yes_token_id, no_token_id) = (yes_token?, no_token?);

        let resolution_time: Option<DateTime<Utc>> = raw
            .end_date_iso
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Some(MarketSummary {
            venue: VenueId::Polymarket,
            market_id: raw.condition_id,
            title: raw.question,
            yes_token_id,
            no_token_id,
            resolution_time,
            tick_size: raw.minimum_tick_size,
            min_order_size: raw.minimum_order_size,
            closed: raw.closed || !raw.active,
        })
    }

    fn validate_ticket(&self, ticket: &OrderTicket) -> VenueResult<()> {
        if !on_tick_grid(ticket.limit_price, ticket.token.tick_size) {
            return Err(VenueError::Validation(format!(
                "price {} off tick grid {}",
                ticket.limit_price, ticket.token.tick_size
            )));
        }
        if ticket.order_qty < ticket.token.min_order_size {
            return Err(VenueError::Validation(format!(
                "size {} below venue minimum {}",
                ticket.order_qty, ticket.token.min_order_size
            )));
        }
        Ok(())
    }
}

fn classify_reqwest(err: reqwest::Error) -> VenueError {
    if err.is_timeout() || err.is_connect() {
        VenueError::Transport(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), err.to_string(), None)
    } else {
        VenueError::Transport(err.to_string())
    }
}

fn classify_status(status: u16, message: String, retry_after: Option<Duration>) -> VenueError {
    match status {
        429 => VenueError::RateLimited { retry_after },
        404 => VenueError::NotFound(message),
        500..=599 | 408 => VenueError::Transport(message),
        _ => VenueError::Schema(format!("unexpected HTTP {}: {}", status, message)),
    }
}

#[async_trait]
impl VenueApi for PolymarketClient {
    fn venue_id(&self) -> VenueId {
        VenueId::Polymarket
    }

    async fn list_markets(&self, status: MarketStatusFilter) -> VenueResult<Vec<MarketSummary>> {
        let mut markets = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        let result = loop {
            let cursor_param = cursor.clone().unwrap_or_default();
            let fetch = retry_venue_call(&self.retry, "polymarket_list_markets", || {
                let mut query = vec![("limit", LIST_PAGE_LIMIT.to_string())];
                if !cursor_param.is_empty() {
                    query.push(("next_cursor", cursor_param.clone()));
                }
                self.send_json::<RawMarketsPage>(
                    self.http.get(self.url("/markets")).query(&query),
                )
            })
            .await;

            match fetch {
                Ok(page) => {
                    for raw in page.data {
                        if status == MarketStatusFilter::Active && (raw.closed || !raw.active) {
                            continue;
                        }
                        if let Some(summary) = Self::market_summary(raw) {
                            markets.push(summary);
                        }
                    }
                    pages += 1;
                    cursor = page.next_cursor.filter(|c| !c.is_empty() && c != "LTE=");
                    if cursor.is_none() || pages >= LIST_MAX_PAGES {
                        if pages >= LIST_MAX_PAGES {
                            warn!(
                                "polymarket market listing hit page cap at {} markets",
                                markets.len()
                            );
                        }
                        break Ok(std::mem::take(&mut markets));
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.observe(result)
    }

    async fn get_book(&self, token_id: &str) -> VenueResult<BookSnapshot> {
        let result = retry_venue_call(&self.retry, "polymarket_get_book", || async {
            let raw: RawBook = self
                .send_json(
                    self.http
                        .get(self.url("/book"))
                        .query(&[("token_id", token_id)]),
                )
                .await?;
            if raw.bids.is_empty() && raw.asks.is_empty() {
                return Err(VenueError::Stale(token_id.to_string()));
            }
            Self::normalize_book(raw, token_id)
        })
        .await;
        self.observe(result)
    }

    async fn get_books_batch(&self, token_ids: &[String]) -> VenueResult<Vec<BookSnapshot>> {
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<serde_json::Value> = token_ids
            .iter()
            .map(|id| serde_json::json!({ "token_id": id }))
            .collect();
        let body = serde_json::Value::Array(params);

        let result = retry_venue_call(&self.retry, "polymarket_get_books_batch", || async {
            let raw_books: Vec<RawBook> = self
                .send_json(self.http.post(self.url("/books")).json(&body))
                .await?;
            let mut books = Vec::with_capacity(raw_books.len());
            for (idx, raw) in raw_books.into_iter().enumerate() {
                if raw.bids.is_empty() && raw.asks.is_empty() {
                    continue;
                }
                let fallback = token_ids.get(idx).map(|s| s.as_str()).unwrap_or("");
                books.push(Self::normalize_book(raw, fallback)?);
            }
            Ok(books)
        })
        .await;
        self.observe(result)
    }

    async fn place_order(&self, ticket: &OrderTicket) -> VenueResult<OrderAck> {
        self.validate_ticket(ticket)?;

        let body = serde_json::json!({
            "token_id": ticket.token.token_id,
            "side": match ticket.side { Side::Buy => "BUY", Side::Sell => "SELL" },
            "price": format_price(ticket.limit_price),
            "size": format!("{:.4}", ticket.order_qty),
            "order_type": match ticket.tif { Tif::Ioc => "FAK", Tif::Gtc => "GTC" },
        });

        let result = retry_venue_call(&self.retry, "polymarket_place_order", || async {
            let raw: RawOrderResponse = self
                .send_json(self.http.post(self.url("/order")).json(&body))
                .await?;

            if !raw.success {
                let msg = raw.error_msg.unwrap_or_else(|| "order rejected".to_string());
                if msg.to_lowercase().contains("not enough balance") {
                    return Err(VenueError::InsufficientBalance);
                }
                return Err(VenueError::Validation(msg));
            }

            let order_id = raw
                .order_id
                .ok_or_else(|| VenueError::Schema("order response missing orderID".to_string()))?;
            Ok(OrderAck {
                order_id,
                state: raw
                    .status
                    .as_deref()
                    .map(map_order_state)
                    .unwrap_or(OrderState::Open),
            })
        })
        .await;
        self.observe(result)
    }

    async fn cancel_order(&self, order_id: &str) -> VenueResult<CancelOutcome> {
        let body = serde_json::json!({ "orderID": order_id });
        let result = retry_venue_call(&self.retry, "polymarket_cancel_order", || async {
            match self
                .send_json::<serde_json::Value>(
                    self.http.delete(self.url("/order")).json(&body),
                )
                .await
            {
                Ok(_) => Ok(CancelOutcome::Acked),
                Err(VenueError::NotFound(_)) => Ok(CancelOutcome::AlreadyTerminal),
                Err(e) => Err(e),
            }
        })
        .await;
        self.observe(result)
    }

    async fn poll_order(&self, order_id: &str) -> VenueResult<OrderStatus> {
        let result = retry_venue_call(&self.retry, "polymarket_poll_order", || async {
            let raw: RawOrderStatus = self
                .send_json(self.http.get(self.url(&format!("/data/order/{}", order_id))))
                .await?;
            let filled_qty = match raw.size_matched.as_deref() {
                Some(s) if !s.is_empty() => parse_qty(s)?,
                _ => 0.0,
            };
            let avg_fill_price = match raw.price.as_deref() {
                Some(s) if !s.is_empty() => parse_price(s)?,
                _ => 0.0,
            };
            let mut state = map_order_state(&raw.status);
            // The venue reports "live" with a partial match; reflect that.
            if state == OrderState::Open && filled_qty > 0.0 {
                state = OrderState::PartiallyFilled;
            }
            Ok(OrderStatus {
                order_id: raw.id,
                state,
                filled_qty,
                avg_fill_price,
                fee_paid: 0.0,
            })
        })
        .await;
        self.observe(result)
    }

    async fn get_balances(&self) -> VenueResult<Balances> {
        let result = retry_venue_call(&self.retry, "polymarket_get_balances", || async {
            let raw: Vec<RawBalanceEntry> = self
                .send_json(self.http.get(self.url("/balances")))
                .await?;
            let mut balances = Balances::new();
            for entry in raw {
                let available = parse_qty(&entry.balance)?;
                let reserved = match entry.reserved.as_deref() {
                    Some(s) if !s.is_empty() => parse_qty(s)?,
                    _ => 0.0,
                };
                balances.insert(
                    entry.asset,
                    Balance {
                        available,
                        reserved,
                    },
                );
            }
            Ok(balances)
        })
        .await;
        self.observe(result)
    }

    fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    fn schema_drift(&self) -> bool {
        self.health.schema_drift()
    }
}
