//! Opportunity detection over a scan frame.
//!
//! Joins the pair registry with one frame of books and emits ranked
//! opportunities. For each pair both crossing combinations are
//! considered: buy YES on Opinion + NO on Polymarket, and the reverse.
//! At most two records per pair per frame.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::fees::FeeModel;
use crate::matcher::PairSet;
use crate::types::{
    BookSnapshot, Combination, MarketPair, Opportunity, ScanFrame, StrategyKind, Token,
};

/// Scanner over frames; pure computation, no I/O.
pub struct Scanner {
    fees: FeeModel,
    immediate_min_edge: f64,
    immediate_max_edge: f64,
    liquidity_min_annualized: f64,
    max_per_trade: f64,
    max_notional: f64,
}

impl Scanner {
    pub fn new(cfg: &Config) -> Self {
        Self {
            fees: FeeModel::from_config(cfg),
            immediate_min_edge: cfg.immediate_min_edge_pct / 100.0,
            immediate_max_edge: cfg.immediate_max_edge_pct / 100.0,
            liquidity_min_annualized: cfg.liquidity_min_annualized_pct,
            max_per_trade: cfg.max_per_trade_shares,
            max_notional: cfg.max_notional,
        }
    }

    /// Scan one frame against the pair snapshot.
    ///
    /// Returned opportunities are sorted: immediates first by annualized
    /// return descending, then liquidity candidates by raw edge descending.
    pub fn scan(&self, pairs: &PairSet, frame: &ScanFrame) -> Vec<Opportunity> {
        let mut found = Vec::new();

        for pair in &pairs.pairs {
            let opinion_yes_book = frame.book(&pair.opinion_yes.token_id);
            let poly_yes_book = frame.book(&pair.polymarket_yes.token_id);

            let (Some(opinion_yes_book), Some(poly_yes_book)) =
                (opinion_yes_book, poly_yes_book)
            else {
                continue;
            };

            // Complement books are derived, not fetched.
            let opinion_no_book = opinion_yes_book.derive_complement(&pair.opinion_no.token_id);
            let poly_no_book = poly_yes_book.derive_complement(&pair.polymarket_no.token_id);

            for combination in Combination::ALL {
                let (opinion_token, opinion_book, poly_token, poly_book) = match combination {
                    Combination::OpinionYesPolyNo => (
                        &pair.opinion_yes,
                        opinion_yes_book,
                        &pair.polymarket_no,
                        &poly_no_book,
                    ),
                    Combination::OpinionNoPolyYes => (
                        &pair.opinion_no,
                        &opinion_no_book,
                        &pair.polymarket_yes,
                        poly_yes_book,
                    ),
                };

                if let Some(opp) = self.evaluate(
                    pair,
                    combination,
                    opinion_token,
                    opinion_book,
                    poly_token,
                    poly_book,
                ) {
                    found.push(opp);
                }
            }
        }

        found.sort_by(|a, b| {
            use std::cmp::Ordering;
            match (a.strategy, b.strategy) {
                (StrategyKind::Immediate, StrategyKind::Liquidity) => Ordering::Less,
                (StrategyKind::Liquidity, StrategyKind::Immediate) => Ordering::Greater,
                (StrategyKind::Immediate, StrategyKind::Immediate) => b
                    .annualized_pct
                    .partial_cmp(&a.annualized_pct)
                    .unwrap_or(Ordering::Equal),
                (StrategyKind::Liquidity, StrategyKind::Liquidity) => b
                    .raw_edge
                    .partial_cmp(&a.raw_edge)
                    .unwrap_or(Ordering::Equal),
            }
        });

        found
    }

    fn evaluate(
        &self,
        pair: &MarketPair,
        combination: Combination,
        opinion_token: &Token,
        opinion_book: &BookSnapshot,
        poly_token: &Token,
        poly_book: &BookSnapshot,
    ) -> Option<Opportunity> {
        let opinion_ask = opinion_book.best_ask()?;
        let poly_ask = poly_book.best_ask()?;
        if opinion_ask.size <= 0.0 || poly_ask.size <= 0.0 {
            return None;
        }

        let gross = opinion_ask.price + poly_ask.price;
        if gross <= 0.0 {
            return None;
        }
        let raw_edge = 1.0 - gross;

        let size_cap = opinion_ask
            .size
            .min(poly_ask.size)
            .min(self.max_per_trade)
            .min(self.max_notional / gross);
        if size_cap < opinion_token.min_order_size.max(poly_token.min_order_size) {
            return None;
        }

        // Cost-adjusted edge: the Opinion leg pays the fee curve.
        let opinion_effective = self
            .fees
            .effective_cost_per_share(opinion_ask.price, size_cap)?;
        let effective_edge = 1.0 - (opinion_effective + poly_ask.price);
        if effective_edge <= 0.0 {
            return None;
        }

        let days = pair.days_to_resolution(Utc::now());
        let annualized_pct =
            effective_edge / (opinion_effective + poly_ask.price) * (365.0 / days) * 100.0;

        let strategy = if effective_edge >= self.immediate_min_edge {
            if effective_edge > self.immediate_max_edge {
                // Almost certainly stale data or a misprint.
                info!(
                    pair_id = %pair.pair_id,
                    combination = %combination,
                    effective_edge,
                    reason = "edge > immediate_max_edge_pct",
                    "suspicious opportunity skipped"
                );
                return None;
            }
            StrategyKind::Immediate
        } else if annualized_pct >= self.liquidity_min_annualized {
            StrategyKind::Liquidity
        } else {
            debug!(
                pair_id = %pair.pair_id,
                combination = %combination,
                effective_edge,
                annualized_pct,
                "below both thresholds, discarded"
            );
            return None;
        };

        Some(Opportunity {
            id: format!("opp-{}", Uuid::new_v4()),
            pair: pair.clone(),
            combination,
            opinion_token: opinion_token.clone(),
            opinion_price: opinion_ask.price,
            opinion_depth: opinion_ask.size,
            poly_token: poly_token.clone(),
            poly_price: poly_ask.price,
            poly_depth: poly_ask.size,
            raw_edge,
            effective_edge,
            size_cap,
            annualized_pct,
            strategy,
            detected_at: Utc::now(),
        })
    }
}
