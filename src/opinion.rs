//! Opinion REST client.
//!
//! Wraps the Opinion proxy API behind the uniform [`VenueApi`] surface.
//! Every response arrives in an `{errno, errmsg, result}` envelope; a
//! non-zero `errno` is mapped onto the classified error kinds so nothing
//! upstream ever string-matches venue messages.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, OPINION_API_BASE, OPINION_MIN_NOTIONAL};
use crate::retry::{retry_venue_call, RetryPolicy};
use crate::types::{
    on_tick_grid, round_price, BookLevel, BookSnapshot, MarketSummary, OrderState, OrderTicket,
    Side, Tif, VenueId,
};
use crate::venue::{
    Balance, Balances, CancelOutcome, HealthTracker, MarketStatusFilter, OrderAck, OrderStatus,
    VenueApi, VenueError, VenueResult,
};

/// Page size for market listing.
const LIST_PAGE_LIMIT: u32 = 100;

/// Hard stop on pagination to bound a single refresh.
const LIST_MAX_PAGES: u32 = 50;

/// Opinion-side errno values with engine-visible meaning.
const ERRNO_INSUFFICIENT_BALANCE: i64 = 4001;
const ERRNO_PRICE_OFF_GRID: i64 = 4102;
const ERRNO_SIZE_BELOW_MIN: i64 = 4103;
const ERRNO_NOT_FOUND: i64 = 4040;

/// Credentials for the Opinion API, read from the environment.
#[derive(Debug, Clone)]
pub struct OpinionConfig {
    pub host: String,
    pub api_key: String,
}

impl OpinionConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("OP_HOST").unwrap_or_else(|_| OPINION_API_BASE.to_string());
        let api_key = std::env::var("OP_API_KEY")
            .map_err(|_| anyhow::anyhow!("OP_API_KEY not set"))?;
        Ok(Self { host, api_key })
    }
}

// === Wire DTOs ===

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    errno: i64,
    #[serde(default)]
    errmsg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct MarketPage {
    #[serde(default)]
    list: Vec<RawMarket>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    market_id: i64,
    title: String,
    yes_token_id: String,
    no_token_id: String,
    /// Unix seconds when trading cuts off.
    cutoff_at: Option<i64>,
    #[serde(default = "default_tick")]
    tick_size: f64,
    #[serde(default = "default_min_size")]
    min_order_size: f64,
    #[serde(default)]
    status: String,
}

fn default_tick() -> f64 {
    0.01
}

fn default_min_size() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
struct RawBook {
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
struct RawOrderAck {
    order_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderStatus {
    order_id: String,
    status: String,
    #[serde(default)]
    filled_amount: f64,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    fee: f64,
}

#[derive(Debug, Deserialize)]
struct RawBalanceList {
    #[serde(default)]
    list: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    available: f64,
    #[serde(default)]
    frozen: f64,
}

// === Price codec ===

/// Render a normalized price as the decimal string Opinion expects.
pub fn format_price(price: f64) -> String {
    format!("{:.3}", round_price(price))
}

/// Parse a venue-native price string into the normalized form.
pub fn parse_price(raw: &str) -> VenueResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map(round_price)
        .map_err(|_| VenueError::Schema(format!("unparseable price '{}'", raw)))
}

fn parse_size(raw: &str) -> VenueResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| VenueError::Schema(format!("unparseable size '{}'", raw)))
}

fn map_order_state(status: &str) -> OrderState {
    match status.to_lowercase().as_str() {
        "pending" | "open" | "new" => OrderState::Open,
        "partial" | "partially_filled" => OrderState::PartiallyFilled,
        "filled" | "finished" | "completed" => OrderState::Filled,
        "canceled" | "cancelled" | "cancelinprogress" | "expired" => OrderState::Canceled,
        "rejected" | "failed" => OrderState::Rejected,
        _ => OrderState::Open,
    }
}

/// Opinion venue client. Owns its own HTTP connection pool.
pub struct OpinionClient {
    http: reqwest::Client,
    host: String,
    api_key: String,
    retry: RetryPolicy,
    health: HealthTracker,
}

impl OpinionClient {
    pub fn new(config: OpinionConfig, engine_cfg: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(engine_cfg.order_place_timeout.max(Duration::from_secs(5)))
            .build()?;
        Ok(Self {
            http,
            host: config.host,
            api_key: config.api_key,
            retry: RetryPolicy::from_env(),
            health: HealthTracker::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> VenueResult<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Api-Key", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode_envelope(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> VenueResult<T> {
        let resp = self
            .http
            .post(self.url(path))
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode_envelope(resp).await
    }

    /// Track the outcome of one logical operation for degraded marking.
    fn observe<T>(&self, result: VenueResult<T>) -> VenueResult<T> {
        match &result {
            Ok(_) => self.health.record_success(),
            Err(VenueError::Schema(msg)) => {
                warn!(venue = "opinion", "schema drift: {}", msg);
                self.health.record_schema_drift();
            }
            Err(e) if e.is_retryable() => {
                let failures = self.health.record_failure();
                if self.health.is_degraded() {
                    warn!(
                        venue = "opinion",
                        consecutive_failures = failures,
                        "venue marked degraded"
                    );
                }
            }
            // Classified rejections say the venue is up and answering.
            Err(_) => self.health.record_success(),
        }
        result
    }

    fn normalize_levels(raw: &[RawLevel], descending: bool) -> VenueResult<Vec<BookLevel>> {
        let mut levels = Vec::with_capacity(raw.len());
        for entry in raw {
            let price = parse_price(&entry.price)?;
            let size = parse_size(&entry.size)?;
            if size <= 0.0 {
                continue;
            }
            levels.push(BookLevel { price, size });
        }
        levels.sort_by(|a, b| {
            let ord = a
                .price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok(levels)
    }

    fn market_summary(raw: RawMarket) -> MarketSummary {
        let resolution_time: Option<DateTime<Utc>> = raw
            .cutoff_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        MarketSummary {
            venue: VenueId::Opinion,
            market_id: raw.market_id.to_string(),
            title: raw.title,
            yes_token_id: raw.yes_token_id,
            no_token_id: raw.no_token_id,
            resolution_time,
            tick_size: raw.tick_size,
            min_order_size: raw.min_order_size,
            closed: !raw.status.eq_ignore_ascii_case("activated"),
        }
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
        let notional = ticket.order_qty * ticket.limit_price;
        if notional < OPINION_MIN_NOTIONAL {
            return Err(VenueError::Validation(format!(
                "notional {:.4} below venue minimum {}",
                notional, OPINION_MIN_NOTIONAL
            )));
        }
        Ok(())
    }
}

/// Map reqwest failures onto the classified kinds.
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

async fn decode_envelope<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> VenueResult<T> {
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

    let envelope: Envelope<T> = resp
        .json()
        .await
        .map_err(|e| VenueError::Schema(format!("envelope decode failed: {}", e)))?;

    if envelope.errno != 0 {
        return Err(classify_errno(envelope.errno, &envelope.errmsg));
    }

    envelope
        .result
        .ok_or_else(|| VenueError::Schema("envelope missing result".to_string()))
}

fn classify_errno(errno: i64, errmsg: &str) -> VenueError {
    match errno {
        ERRNO_INSUFFICIENT_BALANCE => VenueError::InsufficientBalance,
        ERRNO_PRICE_OFF_GRID | ERRNO_SIZE_BELOW_MIN => {
            VenueError::Validation(format!("errno {}: {}", errno, errmsg))
        }
        ERRNO_NOT_FOUND => VenueError::NotFound(errmsg.to_string()),
        _ if errmsg.to_lowercase().contains("insufficient balance") => {
            VenueError::InsufficientBalance
        }
        _ => VenueError::Transport(format!("errno {}: {}", errno, errmsg)),
    }
}

#[async_trait]
impl VenueApi for OpinionClient {
    fn venue_id(&self) -> VenueId {
        VenueId::Opinion
    }

    async fn list_markets(&self, status: MarketStatusFilter) -> VenueResult<Vec<MarketSummary>> {
        let status_param = match status {
            MarketStatusFilter::Active => "activated",
            MarketStatusFilter::All => "all",
        };

        let mut markets = Vec::new();
        let mut page = 1u32;
        let result = loop {
            let query = [
                ("status", status_param.to_string()),
                ("page", page.to_string()),
                ("limit", LIST_PAGE_LIMIT.to_string()),
            ];
            let fetch = retry_venue_call(&self.retry, "opinion_list_markets", || {
                self.get_json::<MarketPage>("/openapi/market/list", &query)
            })
            .await;

            match fetch {
                Ok(page_data) => {
                    let count = page_data.list.len();
                    markets.extend(page_data.list.into_iter().map(Self::market_summary));
                    if count < LIST_PAGE_LIMIT as usize || page >= LIST_MAX_PAGES {
                        if page >= LIST_MAX_PAGES {
                            warn!(
                                "opinion market listing hit page cap ({} markets of {})",
                                markets.len(),
                                page_data.total
                            );
                        }
                        break Ok(std::mem::take(&mut markets));
                    }
                    page += 1;
                }
                Err(e) => break Err(e),
            }
        };
        self.observe(result)
    }

    async fn get_book(&self, token_id: &str) -> VenueResult<BookSnapshot> {
        let result = retry_venue_call(&self.retry, "opinion_get_book", || async {
            let raw: RawBook = self
                .get_json(
                    "/openapi/token/orderbook",
                    &[("token_id", token_id.to_string())],
                )
                .await?;
            if raw.bids.is_empty() && raw.asks.is_empty() {
                return Err(VenueError::Stale(token_id.to_string()));
            }
            Ok(BookSnapshot {
                venue: VenueId::Opinion,
                token_id: token_id.to_string(),
                bids: Self::normalize_levels(&raw.bids, true)?,
                asks: Self::normalize_levels(&raw.asks, false)?,
                fetched_at: Utc::now(),
            })
        })
        .await;
        self.observe(result)
    }

    async fn get_books_batch(&self, token_ids: &[String]) -> VenueResult<Vec<BookSnapshot>> {
        // No bulk endpoint on Opinion; fetch per token, partial results allowed.
        let mut books = Vec::with_capacity(token_ids.len());
        for token_id in token_ids {
            match self.get_book(token_id).await {
                Ok(book) => books.push(book),
                Err(VenueError::Stale(_)) | Err(VenueError::NotFound(_)) => continue,
                Err(e) => {
                    debug!("opinion batch fetch failed for {}: {}", token_id, e);
                    continue;
                }
            }
        }
        Ok(books)
    }

    async fn place_order(&self, ticket: &OrderTicket) -> VenueResult<OrderAck> {
        self.validate_ticket(ticket)?;

        let body = serde_json::json!({
            "market_id": ticket.token.market_id,
            "token_id": ticket.token.token_id,
            "side": match ticket.side { Side::Buy => "buy", Side::Sell => "sell" },
            "order_type": "limit",
            "time_in_force": match ticket.tif { Tif::Ioc => "IOC", Tif::Gtc => "GTC" },
            "price": format_price(ticket.limit_price),
            "amount": format!("{:.4}", ticket.order_qty),
        });

        let result = retry_venue_call(&self.retry, "opinion_place_order", || {
            self.post_json::<RawOrderAck>("/openapi/trade/order", &body)
        })
        .await
        .map(|ack| OrderAck {
            state: map_order_state(&ack.status),
            order_id: ack.order_id,
        });
        self.observe(result)
    }

    async fn cancel_order(&self, order_id: &str) -> VenueResult<CancelOutcome> {
        let body = serde_json::json!({ "order_id": order_id });
        let result = retry_venue_call(&self.retry, "opinion_cancel_order", || async {
            match self
                .post_json::<serde_json::Value>("/openapi/trade/cancel", &body)
                .await
            {
                Ok(_) => Ok(CancelOutcome::Acked),
                Err(VenueError::NotFound(_)) => Ok(CancelOutcome::AlreadyTerminal),
                Err(VenueError::Validation(_)) => Ok(CancelOutcome::AlreadyTerminal),
                Err(e) => Err(e),
            }
        })
        .await;
        self.observe(result)
    }

    async fn poll_order(&self, order_id: &str) -> VenueResult<OrderStatus> {
        let result = retry_venue_call(&self.retry, "opinion_poll_order", || async {
            let raw: RawOrderStatus = self
                .get_json("/openapi/trade/order", &[("order_id", order_id.to_string())])
                .await?;
            let avg_fill_price = match raw.avg_price.as_deref() {
                Some(s) if !s.is_empty() => parse_price(s)?,
                _ => 0.0,
            };
            Ok(OrderStatus {
                order_id: raw.order_id,
                state: map_order_state(&raw.status),
                filled_qty: raw.filled_amount,
                avg_fill_price,
                fee_paid: raw.fee,
            })
        })
        .await;
        self.observe(result)
    }

    async fn get_balances(&self) -> VenueResult<Balances> {
        let result = retry_venue_call(&self.retry, "opinion_get_balances", || async {
            let raw: RawBalanceList = self.get_json("/openapi/account/balance", &[]).await?;
            let mut balances = Balances::new();
            for entry in raw.list {
                balances.insert(
                    entry.asset,
                    Balance {
                        available: entry.available,
                        reserved: entry.frozen,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, Token};

    #[test]
    fn test_price_codec_round_trip() {
        for &p in &[0.001, 0.01, 0.1, 0.25, 0.555, 0.95, 0.999] {
            let formatted = format_price(p);
            let parsed = parse_price(&formatted).unwrap();
            assert_eq!(parsed, p, "round trip failed for {}", p);
        }
    }

    #[test]
    fn test_parse_price_rejects_garbage() {
        assert!(parse_price("abc").is_err());
        assert!(parse_price("").is_err());
        assert!(parse_price("0.55").is_ok());
        assert!(parse_price(" 0.55 ").is_ok());
    }

    #[test]
    fn test_map_order_state() {
        assert_eq!(map_order_state("pending"), OrderState::Open);
        assert_eq!(map_order_state("Partial"), OrderState::PartiallyFilled);
        assert_eq!(map_order_state("FILLED"), OrderState::Filled);
        assert_eq!(map_order_state("cancelinprogress"), OrderState::Canceled);
        assert_eq!(map_order_state("rejected"), OrderState::Rejected);
    }

    #[test]
    fn test_classify_errno() {
        assert!(matches!(
            classify_errno(ERRNO_INSUFFICIENT_BALANCE, ""),
            VenueError::InsufficientBalance
        ));
        assert!(matches!(
            classify_errno(ERRNO_PRICE_OFF_GRID, "bad price"),
            VenueError::Validation(_)
        ));
        assert!(matches!(
            classify_errno(9999, "Insufficient Balance for order"),
            VenueError::InsufficientBalance
        ));
        assert!(matches!(
            classify_errno(9999, "internal"),
            VenueError::Transport(_)
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, "slow down".into(), None),
            VenueError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(503, "down".into(), None),
            VenueError::Transport(_)
        ));
        assert!(matches!(
            classify_status(404, "missing".into(), None),
            VenueError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(418, "teapot".into(), None),
            VenueError::Schema(_)
        ));
    }

    #[test]
    fn test_normalize_levels_sorts_and_drops_empty() {
        let raw = vec![
            RawLevel {
                price: "0.44".into(),
                size: "100".into(),
            },
            RawLevel {
                price: "0.46".into(),
                size: "0".into(),
            },
            RawLevel {
                price: "0.45".into(),
                size: "50".into(),
            },
        ];

        let bids = OpinionClient::normalize_levels(&raw, true).unwrap();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, 0.45);
        assert_eq!(bids[1].price, 0.44);

        let asks = OpinionClient::normalize_levels(&raw, false).unwrap();
        assert_eq!(asks[0].price, 0.44);
    }

    #[test]
    fn test_market_summary_mapping() {
        let raw = RawMarket {
            market_id: 42,
            title: "Will it rain tomorrow?".into(),
            yes_token_id: "y-42".into(),
            no_token_id: "n-42".into(),
            cutoff_at: Some(1_750_000_000),
            tick_size: 0.01,
            min_order_size: 5.0,
            status: "activated".into(),
        };
        let summary = OpinionClient::market_summary(raw);
        assert_eq!(summary.market_id, "42");
        assert_eq!(summary.venue, VenueId::Opinion);
        assert!(!summary.closed);
        assert!(summary.resolution_time.is_some());
    }

    #[test]
    fn test_validate_ticket_rules() {
        let cfg = Config::default();
        let client = OpinionClient::new(
            OpinionConfig {
                host: "http://localhost:0".into(),
                api_key: "test".into(),
            },
            &cfg,
        )
        .unwrap();

        let token = Token::new(VenueId::Opinion, "m", "t", Outcome::Yes);

        // Off-grid price
        let bad_price = OrderTicket::new(token.clone(), Side::Buy, 100.0, 100.0, 0.555, Tif::Ioc);
        assert!(matches!(
            client.validate_ticket(&bad_price),
            Err(VenueError::Validation(_))
        ));

        // Below minimum size
        let tiny = OrderTicket::new(token.clone(), Side::Buy, 1.0, 1.0, 0.50, Tif::Ioc);
        assert!(matches!(
            client.validate_ticket(&tiny),
            Err(VenueError::Validation(_))
        ));

        // Below minimum notional: 10 shares at 0.10 = 1.0 < 1.3
        let thin = OrderTicket::new(token.clone(), Side::Buy, 10.0, 10.0, 0.10, Tif::Ioc);
        assert!(matches!(
            client.validate_ticket(&thin),
            Err(VenueError::Validation(_))
        ));

        let ok = OrderTicket::new(token, Side::Buy, 100.0, 100.0, 0.50, Tif::Ioc);
        assert!(client.validate_ticket(&ok).is_ok());
    }
}
