//! Fee and sizing model.
//!
//! Opinion charges a per-trade taker fee derived from a fitted curve:
//!
//! ```text
//! fee_rate(p) = a * p * (1 - p) + c
//! nominal_fee = price * order_qty * fee_rate(price)
//! actual_fee  = max(nominal_fee, min_fee)
//! ```
//!
//! The fee is withheld from the received quantity at `actual_fee / price`
//! shares, so an order must be oversized to end up holding a target
//! quantity. Maker (resting) orders on Opinion are fee-free. Polymarket
//! charges no order-side fee in this model, so its sizing is the identity.
//!
//! The curve coefficients and the minimum fee were fitted from a handful
//! of observations and are configuration, not constants: if the true
//! schedule changes, config is the single point of update.

use crate::config::Config;
use crate::types::VenueId;

/// Sizing result: what to submit and what we expect to end up holding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedOrder {
    /// Quantity to submit to the venue.
    pub order_qty: f64,
    /// Quantity expected to be held after fee deduction, on full fill.
    pub effective_qty: f64,
    /// Effective cost per share held, including the fee.
    pub cost_per_share: f64,
}

/// Fee model for both venues, parameterized by the Opinion curve.
#[derive(Debug, Clone)]
pub struct FeeModel {
    curve_a: f64,
    curve_c: f64,
    min_fee: f64,
}

impl FeeModel {
    pub fn new(curve_a: f64, curve_c: f64, min_fee: f64) -> Self {
        Self {
            curve_a,
            curve_c,
            min_fee,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.fee_curve_a, cfg.fee_curve_c, cfg.opinion_min_fee)
    }

    /// Opinion taker fee rate at the given price.
    pub fn fee_rate(&self, price: f64) -> f64 {
        self.curve_a * price * (1.0 - price) + self.curve_c
    }

    /// Fee charged for an Opinion taker order, quote units.
    pub fn fee_paid(&self, price: f64, order_qty: f64) -> f64 {
        let nominal = price * order_qty * self.fee_rate(price);
        nominal.max(self.min_fee)
    }

    /// Order quantity needed on Opinion so that, after the fee is withheld,
    /// the filled position equals `target_qty`.
    pub fn order_qty_for_target(&self, price: f64, target_qty: f64) -> SizedOrder {
        let f = self.fee_rate(price);
        let provisional = target_qty / (1.0 - f);
        let nominal_fee = price * provisional * f;

        if nominal_fee > self.min_fee {
            SizedOrder {
                order_qty: provisional,
                effective_qty: target_qty,
                cost_per_share: price / (1.0 - f),
            }
        } else {
            // Flat fee: total spend is p * target + min_fee, spread over the
            // target quantity actually held.
            SizedOrder {
                order_qty: target_qty + self.min_fee / price,
                effective_qty: target_qty,
                cost_per_share: price + self.min_fee / target_qty,
            }
        }
    }

    /// Inverse of [`order_qty_for_target`]: shares actually held after an
    /// Opinion taker order of `order_qty` fills completely.
    pub fn received_for_order(&self, price: f64, order_qty: f64) -> f64 {
        let fee = self.fee_paid(price, order_qty);
        (order_qty - fee / price).max(0.0)
    }

    /// Effective per-share cost of acquiring `target_qty` net shares on
    /// Opinion at `price`. Returns `None` when the inputs are degenerate.
    pub fn effective_cost_per_share(&self, price: f64, target_qty: f64) -> Option<f64> {
        if price <= 0.0 || !price.is_finite() {
            return None;
        }
        let qty = target_qty.max(1e-6);
        let f = self.fee_rate(price);
        if f >= 0.999 {
            return None;
        }

        let order_qty = qty / (1.0 - f);
        let nominal_fee = price * order_qty * f;

        let effective = if nominal_fee >= self.min_fee {
            price / (1.0 - f)
        } else {
            price + self.min_fee / qty
        };
        Some(effective)
    }

    /// Translate a target fill into an order for the given venue.
    ///
    /// Opinion taker orders are oversized per the fee curve; Opinion maker
    /// (resting) orders and all Polymarket orders are the identity.
    pub fn size_for_platform(
        &self,
        venue: VenueId,
        price: f64,
        target_qty: f64,
        is_maker: bool,
    ) -> SizedOrder {
        match venue {
            VenueId::Opinion if !is_maker => self.order_qty_for_target(price, target_qty),
            _ => SizedOrder {
                order_qty: target_qty,
                effective_qty: target_qty,
                cost_per_share: price,
            },
        }
    }

    /// Shares held after a fill of `filled_qty` at `price`, net of any fee
    /// the venue withholds. Used to compute hedge sizing after first-leg
    /// fills.
    pub fn received_for_fill(
        &self,
        venue: VenueId,
        price: f64,
        filled_qty: f64,
        is_maker: bool,
    ) -> f64 {
        match venue {
            VenueId::Opinion if !is_maker => self.received_for_order(price, filled_qty),
            _ => filled_qty,
        }
    }
}
