//! Rate-limited, batched order-book acquisition.
//!
//! Given the token set derived from the current pair snapshot, fetches
//! books under two budgets: a per-venue token bucket (requests per
//! second) and a batch limit (tokens per batch request). Fetch fan-out is
//! bounded per venue and the whole sweep is cut off at the scan deadline;
//! whatever arrived in time forms one consistent [`ScanFrame`].

use chrono::Utc;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter,
};
use rustc_hash::FxHashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::matcher::PairSet;
use crate::types::{BookSnapshot, ScanFrame, VenueId};
use crate::venue::VenueApi;

type VenueRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

struct VenueLane {
    client: Arc<dyn VenueApi>,
    limiter: Arc<VenueRateLimiter>,
    /// At most ceil(rate) requests in flight at once.
    concurrency: Arc<Semaphore>,
}

impl VenueLane {
    fn new(client: Arc<dyn VenueApi>, rps: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rps.max(1)).expect("rps >= 1"));
        Self {
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            concurrency: Arc::new(Semaphore::new(rps.max(1) as usize)),
        }
    }
}

/// Fetches one scan frame's worth of books per call.
pub struct BookFetcher {
    opinion: VenueLane,
    polymarket: VenueLane,
    batch_size: usize,
    max_book_age: Duration,
    fetch_timeout: Duration,
}

impl BookFetcher {
    pub fn new(
        opinion: Arc<dyn VenueApi>,
        polymarket: Arc<dyn VenueApi>,
        cfg: &Config,
    ) -> Self {
        Self {
            opinion: VenueLane::new(opinion, cfg.opinion_max_rps),
            polymarket: VenueLane::new(polymarket, cfg.polymarket_max_rps),
            batch_size: cfg.orderbook_batch_size.max(1),
            max_book_age: cfg.max_book_age,
            fetch_timeout: cfg.book_fetch_timeout,
        }
    }

    /// Fetch books for every watched token of the pair set, bounded by
    /// `deadline`. Stragglers past the deadline are abandoned; snapshots
    /// older than the max book age are dropped before the frame is built.
    pub async fn fetch_frame(&self, pairs: &PairSet, deadline: Duration) -> ScanFrame {
        let watched = pairs.watched_tokens();
        let opinion_tokens = watched.get(&VenueId::Opinion).cloned().unwrap_or_default();
        let poly_tokens = watched
            .get(&VenueId::Polymarket)
            .cloned()
            .unwrap_or_default();

        if opinion_tokens.is_empty() && poly_tokens.is_empty() {
            return ScanFrame::empty(Utc::now());
        }

        let mut in_flight: FuturesUnordered<
            std::pin::Pin<Box<dyn std::future::Future<Output = Vec<BookSnapshot>> + Send>>,
        > = FuturesUnordered::new();

        // Opinion has no bulk endpoint: one request per token under the bucket.
        for token_id in opinion_tokens {
            let lane = &self.opinion;
            let client = lane.client.clone();
            let limiter = lane.limiter.clone();
            let semaphore = lane.concurrency.clone();
            let timeout = self.fetch_timeout;
            in_flight.push(Box::pin(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return Vec::new(),
                };
                limiter.until_ready().await;
                match tokio::time::timeout(timeout, client.get_book(&token_id)).await {
                    Ok(Ok(book)) => vec![book],
                    Ok(Err(e)) => {
                        debug!("opinion book fetch failed for {}: {}", token_id, e);
                        Vec::new()
                    }
                    Err(_) => {
                        debug!("opinion book fetch timed out for {}", token_id);
                        Vec::new()
                    }
                }
            }));
        }

        // Polymarket serves batches; one bucket slot per batch request.
        for chunk in poly_tokens.chunks(self.batch_size) {
            let lane = &self.polymarket;
            let client = lane.client.clone();
            let limiter = lane.limiter.clone();
            let semaphore = lane.concurrency.clone();
            let timeout = self.fetch_timeout;
            let batch: Vec<String> = chunk.to_vec();
            in_flight.push(Box::pin(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return Vec::new(),
                };
                limiter.until_ready().await;
                match tokio::time::timeout(timeout, client.get_books_batch(&batch)).await {
                    Ok(Ok(books)) => books,
                    Ok(Err(e)) => {
                        debug!("polymarket batch fetch failed ({} tokens): {}", batch.len(), e);
                        Vec::new()
                    }
                    Err(_) => {
                        debug!("polymarket batch fetch timed out ({} tokens)", batch.len());
                        Vec::new()
                    }
                }
            }));
        }

        let mut books: FxHashMap<String, BookSnapshot> = FxHashMap::default();
        let cutoff = tokio::time::sleep(deadline);
        tokio::pin!(cutoff);

        loop {
            tokio::select! {
                biased;
                _ = &mut cutoff => {
                    let remaining = in_flight.len();
                    if remaining > 0 {
                        warn!(
                            abandoned_requests = remaining,
                            "scan deadline reached, abandoning stragglers"
                        );
                    }
                    break;
                }
                next = in_flight.next() => {
                    match next {
                        Some(batch) => {
                            for book in batch {
                                books.insert(book.token_id.clone(), book);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let frame_time = Utc::now();
        let max_age = chrono::Duration::from_std(self.max_book_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(2));
        let before = books.len();
        books.retain(|_, book| frame_time - book.fetched_at <= max_age);
        if books.len() < before {
            debug!(dropped = before - books.len(), "dropped stale snapshots");
        }

        ScanFrame { frame_time, books }
    }
}
