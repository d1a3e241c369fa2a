//! Cross-venue arbitrage engine for complementary binary-outcome tokens.
//!
//! Detects and executes two-legged arbitrage between the Opinion and
//! Polymarket order books: when the best asks of complementary outcomes
//! sum below 1.00, buying one of each locks in the difference at
//! resolution. The engine continuously re-discovers matched markets,
//! samples books under per-venue rate budgets, ranks opportunities by a
//! fee-adjusted profitability metric, and executes either an immediate
//! crossing or a resting liquidity order with a cross-venue hedge.

pub mod books;
pub mod config;
pub mod fees;
pub mod immediate;
pub mod liquidity;
pub mod logging;
pub mod matcher;
pub mod opinion;
pub mod orders;
pub mod polymarket;
pub mod reconcile;
pub mod retry;
pub mod scanner;
pub mod supervisor;
pub mod testkit;
pub mod trade_log;
pub mod types;
pub mod venue;
