//! Fee model and sizing validation.
//!
//! Exercises the Opinion fee curve and the sizing round-trip law across
//! the price grid: an order sized for a target fill must, when fed back
//! through the fee model, return the target within a hundredth of a
//! share.

use cross_venue_arbitrage::config::Config;
use cross_venue_arbitrage::fees::FeeModel;
use cross_venue_arbitrage::types::VenueId;

fn default_model() -> FeeModel {
    FeeModel::from_config(&Config::default())
}

#[test]
fn test_sizing_round_trip_law() {
    let model = default_model();
    let prices = [0.01, 0.02, 0.05, 0.10, 0.25, 0.40, 0.50, 0.60, 0.75, 0.90, 0.95, 0.99];
    let targets = [5.0, 10.0, 50.0, 100.0, 200.0, 250.0, 500.0, 1000.0];

    let mut violations = Vec::new();
    for &price in &prices {
        for &target in &targets {
            let sized = model.order_qty_for_target(price, target);
            let received = model.received_for_order(price, sized.order_qty);
            if (received - target).abs() >= 0.01 {
                violations.push((price, target, sized.order_qty, received));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "round-trip law violated at {:?}",
        violations
    );
}

#[test]
fn test_min_fee_branch_dominates_at_low_price() {
    // At p=0.01 for 200 target shares the nominal fee is far below the
    // 0.50 minimum, so the flat-fee branch adds exactly min_fee / price
    // shares: 200 + 0.50/0.01 = 250.
    let model = default_model();
    let sized = model.order_qty_for_target(0.01, 200.0);

    assert!(
        (sized.order_qty - 250.0).abs() < 1e-9,
        "expected ~250 shares, got {}",
        sized.order_qty
    );

    let received = model.received_for_order(0.01, sized.order_qty);
    assert!(
        (received - 200.0).abs() < 0.01,
        "effective received {} != 200",
        received
    );
}

#[test]
fn test_percentage_branch_effective_cost() {
    let model = default_model();
    // Large notional: percentage fee applies, cost per share = p / (1-f).
    let sized = model.order_qty_for_target(0.55, 500.0);
    let f = model.fee_rate(0.55);
    assert!((sized.cost_per_share - 0.55 / (1.0 - f)).abs() < 1e-9);
    assert!(sized.cost_per_share > 0.55);
}

#[test]
fn test_fee_curve_shape() {
    let model = default_model();
    // Quadratic peak at p = 0.5 with the constant floor at the ends.
    assert!(model.fee_rate(0.5) > model.fee_rate(0.1));
    assert!(model.fee_rate(0.5) > model.fee_rate(0.9));
    assert!((model.fee_rate(0.25) - model.fee_rate(0.75)).abs() < 1e-12);
    assert!(model.fee_rate(0.0) >= 0.0025 - 1e-12);
}

#[test]
fn test_polymarket_and_maker_orders_are_identity() {
    let model = default_model();
    for &price in &[0.05, 0.50, 0.95] {
        let poly = model.size_for_platform(VenueId::Polymarket, price, 300.0, false);
        assert_eq!(poly.order_qty, 300.0);
        assert_eq!(poly.effective_qty, 300.0);

        let maker = model.size_for_platform(VenueId::Opinion, price, 300.0, true);
        assert_eq!(maker.order_qty, 300.0);
        assert_eq!(maker.effective_qty, 300.0);
    }
}

#[test]
fn test_configurable_curve_coefficients() {
    // The curve is configuration, not a constant: doubling `a` must move
    // mid-price fees without touching the boundary behavior.
    let base = FeeModel::new(0.06, 0.0025, 0.50);
    let steep = FeeModel::new(0.12, 0.0025, 0.50);

    assert!(steep.fee_rate(0.5) > base.fee_rate(0.5));
    assert!((steep.fee_rate(0.0) - base.fee_rate(0.0)).abs() < 1e-12);

    // The round-trip law holds for any coefficients.
    let sized = steep.order_qty_for_target(0.5, 400.0);
    let received = steep.received_for_order(0.5, sized.order_qty);
    assert!((received - 400.0).abs() < 0.01);
}

#[test]
fn test_cross_venue_cost_accounting() {
    // Buying 500 YES at 0.55 on Opinion plus 500 NO at 0.40 on Polymarket
    // costs about 0.955 per share pair once the Opinion fee is included,
    // leaving roughly 22.5 profit on a 500-share resolution payout.
    let model = default_model();

    let opinion = model.order_qty_for_target(0.55, 500.0);
    let opinion_cost = opinion.order_qty * 0.55;
    let poly_cost = 500.0 * 0.40;
    let total = opinion_cost + poly_cost;

    let payoff = 500.0;
    let profit = payoff - total;

    assert!(
        (total / 500.0 - 0.955).abs() < 0.01,
        "cost per pair {:.4} out of range",
        total / 500.0
    );
    assert!(
        profit > 18.0 && profit < 25.0,
        "profit {:.2} not in the expected band",
        profit
    );
}
