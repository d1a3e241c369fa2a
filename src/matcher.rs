//! Cross-venue market matching.
//!
//! Binds Opinion and Polymarket markets trading the same real-world
//! question into [`MarketPair`]s. Equivalence is decided by normalized
//! title similarity plus resolution-date proximity. Once bound, a pair is
//! sticky: it is re-verified on each refresh but not re-matched unless
//! either side's market closes.
//!
//! The registry is published as immutable `Arc<PairSet>` snapshots;
//! readers hold a snapshot for the duration of a scan and never observe a
//! partially refreshed set.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{MarketPair, MarketSummary, Outcome, VenueId};
use crate::venue::{MarketStatusFilter, VenueApi};

/// Immutable snapshot of the current pair registry.
#[derive(Debug, Default, Clone)]
pub struct PairSet {
    pub pairs: Vec<MarketPair>,
}

impl PairSet {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// All token ids the book fetcher should watch, grouped by venue.
    pub fn watched_tokens(&self) -> FxHashMap<VenueId, Vec<String>> {
        let mut by_venue: FxHashMap<VenueId, Vec<String>> = FxHashMap::default();
        let mut seen: HashSet<&str> = HashSet::new();
        for pair in &self.pairs {
            // One book per market suffices: the complement side is derived.
            for token in [&pair.opinion_yes, &pair.polymarket_yes] {
                if seen.insert(token.token_id.as_str()) {
                    by_venue
                        .entry(token.venue)
                        .or_default()
                        .push(token.token_id.clone());
                }
            }
        }
        by_venue
    }
}

/// Normalize a market title for comparison: case-folded, punctuation
/// stripped to spaces, whitespace collapsed. Numeric tokens survive
/// unchanged ("$3,000" becomes "3 000"; "250k" stays "250k").
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Jaccard word-set similarity between two normalized titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn resolution_within(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    max_delta_hours: i64,
) -> bool {
    match (a, b) {
        (Some(ta), Some(tb)) => (ta - tb).num_hours().abs() <= max_delta_hours,
        // A side without a resolution date cannot satisfy the proximity rule.
        _ => false,
    }
}

fn build_pair(opinion: &MarketSummary, poly: &MarketSummary, similarity: f64) -> MarketPair {
    MarketPair {
        pair_id: format!("{}:{}", opinion.market_id, poly.market_id),
        question: opinion.title.clone(),
        opinion_yes: opinion.token(Outcome::Yes),
        opinion_no: opinion.token(Outcome::No),
        polymarket_yes: poly.token(Outcome::Yes),
        polymarket_no: poly.token(Outcome::No),
        resolution_time: opinion.resolution_time.or(poly.resolution_time),
        similarity,
    }
}

/// Pure matching pass: verify sticky pairs against the fresh listings,
/// then bind the best candidate for each still-unmatched Opinion market.
pub fn match_markets(
    opinion_markets: &[MarketSummary],
    poly_markets: &[MarketSummary],
    existing: &PairSet,
    similarity_threshold: f64,
    max_delta_hours: i64,
) -> PairSet {
    let opinion_by_id: FxHashMap<&str, &MarketSummary> = opinion_markets
        .iter()
        .map(|m| (m.market_id.as_str(), m))
        .collect();
    let poly_by_id: FxHashMap<&str, &MarketSummary> = poly_markets
        .iter()
        .map(|m| (m.market_id.as_str(), m))
        .collect();

    let mut pairs = Vec::new();
    let mut bound_opinion: HashSet<String> = HashSet::new();
    let mut bound_poly: HashSet<String> = HashSet::new();

    // Sticky pass: keep existing pairs whose both sides are still open.
    for pair in &existing.pairs {
        let opinion_open = opinion_by_id
            .get(pair.opinion_yes.market_id.as_str())
            .map(|m| !m.closed)
            .unwrap_or(false);
        let poly_open = poly_by_id
            .get(pair.polymarket_yes.market_id.as_str())
            .map(|m| !m.closed)
            .unwrap_or(false);

        if opinion_open && poly_open {
            bound_opinion.insert(pair.opinion_yes.market_id.clone());
            bound_poly.insert(pair.polymarket_yes.market_id.clone());
            pairs.push(pair.clone());
        } else {
            info!(
                pair_id = %pair.pair_id,
                opinion_open,
                poly_open,
                "pair dropped: market closed"
            );
        }
    }

    // Matching pass for the remaining Opinion markets.
    let poly_normalized: Vec<(usize, String)> = poly_markets
        .iter()
        .enumerate()
        .map(|(i, m)| (i, normalize_title(&m.title)))
        .collect();

    for opinion in opinion_markets {
        if opinion.closed || bound_opinion.contains(&opinion.market_id) {
            continue;
        }
        let opinion_title = normalize_title(&opinion.title);

        let mut best: Option<(&MarketSummary, f64)> = None;
        for (idx, poly_title) in &poly_normalized {
            let poly = &poly_markets[*idx];
            if poly.closed || bound_poly.contains(&poly.market_id) {
                continue;
            }
            if !resolution_within(
                opinion.resolution_time,
                poly.resolution_time,
                max_delta_hours,
            ) {
                continue;
            }
            let score = title_similarity(&opinion_title, poly_title);
            if score < similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_poly, best_score)) => {
                    score > best_score
                        || (score == best_score
                            && poly.resolution_time < best_poly.resolution_time)
                }
            };
            if better {
                best = Some((poly, score));
            }
        }

        if let Some((poly, score)) = best {
            debug!(
                opinion = %opinion.title,
                poly = %poly.title,
                score,
                "bound new pair"
            );
            bound_opinion.insert(opinion.market_id.clone());
            bound_poly.insert(poly.market_id.clone());
            pairs.push(build_pair(opinion, poly, score));
        }
    }

    PairSet { pairs }
}

/// Outcome of one refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Both listings fetched; registry rebuilt.
    Refreshed,
    /// Called again before the refresh cadence elapsed.
    Throttled,
    /// At least one venue failed; existing pairs kept as-is.
    VenueUnavailable,
}

/// Owner of the pair registry and its refresh protocol.
pub struct Matcher {
    opinion: Arc<dyn VenueApi>,
    polymarket: Arc<dyn VenueApi>,
    similarity_threshold: f64,
    max_delta_hours: i64,
    min_refresh_interval: std::time::Duration,
    current: RwLock<Arc<PairSet>>,
    last_refresh: RwLock<Option<Instant>>,
}

impl Matcher {
    pub fn new(opinion: Arc<dyn VenueApi>, polymarket: Arc<dyn VenueApi>, cfg: &Config) -> Self {
        Self {
            opinion,
            polymarket,
            similarity_threshold: cfg.title_similarity_threshold,
            max_delta_hours: cfg.max_resolution_date_delta_hours,
            min_refresh_interval: cfg.matcher_refresh,
            current: RwLock::new(Arc::new(PairSet::default())),
            last_refresh: RwLock::new(None),
        }
    }

    /// Current registry snapshot. Consumers treat it as immutable.
    pub async fn pairs(&self) -> Arc<PairSet> {
        self.current.read().await.clone()
    }

    /// Refresh the registry, no more often than the configured cadence.
    /// A venue returning an error does not invalidate existing pairs.
    pub async fn refresh(&self) -> RefreshOutcome {
        {
            let last = self.last_refresh.read().await;
            if let Some(t) = *last {
                if t.elapsed() < self.min_refresh_interval {
                    return RefreshOutcome::Throttled;
                }
            }
        }

        let (opinion_res, poly_res) = tokio::join!(
            self.opinion.list_markets(MarketStatusFilter::Active),
            self.polymarket.list_markets(MarketStatusFilter::Active),
        );

        let (opinion_markets, poly_markets) = match (opinion_res, poly_res) {
            (Ok(o), Ok(p)) => (o, p),
            (o, p) => {
                if let Err(e) = &o {
                    warn!("opinion market listing failed: {}", e);
                }
                if let Err(e) = &p {
                    warn!("polymarket market listing failed: {}", e);
                }
                return RefreshOutcome::VenueUnavailable;
            }
        };

        let existing = self.pairs().await;
        let next = match_markets(
            &opinion_markets,
            &poly_markets,
            &existing,
            self.similarity_threshold,
            self.max_delta_hours,
        );

        info!(
            opinion_markets = opinion_markets.len(),
            polymarket_markets = poly_markets.len(),
            pairs = next.len(),
            previously = existing.len(),
            "pair registry refreshed"
        );

        *self.current.write().await = Arc::new(next);
        *self.last_refresh.write().await = Some(Instant::now());
        RefreshOutcome::Refreshed
    }
}
