//! Shared order lifecycle helpers.
//!
//! Both strategies wait on venue-reported order state the same way: poll
//! on a fixed tick until the order reaches a terminal state or a timeout
//! elapses, checking for shutdown at every suspension point.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::venue::{OrderStatus, VenueApi, VenueError, VenueResult};

/// Why a poll loop ended without a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEnd {
    Terminal,
    TimedOut,
    Canceled,
}

/// Final observation of an order after waiting.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub end: PollEnd,
    /// Last status successfully observed, if any.
    pub status: Option<OrderStatus>,
}

impl PollResult {
    /// Cumulative filled quantity from the last observation.
    pub fn filled_qty(&self) -> f64 {
        self.status.as_ref().map(|s| s.filled_qty).unwrap_or(0.0)
    }

    pub fn avg_fill_price(&self) -> f64 {
        self.status
            .as_ref()
            .map(|s| s.avg_fill_price)
            .unwrap_or(0.0)
    }
}

/// Poll `order_id` until the venue reports a terminal state.
///
/// IOC orders auto-terminate at the venue; this still polls to
/// terminal-confirm before the caller proceeds. Transient poll failures
/// are tolerated (the retry budget lives inside the adapter); the loop
/// keeps the last good observation.
pub async fn poll_until_terminal(
    venue: &Arc<dyn VenueApi>,
    order_id: &str,
    poll_interval: Duration,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> PollResult {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_status: Option<OrderStatus> = None;

    loop {
        if shutdown.is_cancelled() {
            return PollResult {
                end: PollEnd::Canceled,
                status: last_status,
            };
        }

        match venue.poll_order(order_id).await {
            Ok(status) => {
                let terminal = status.state.is_terminal();
                last_status = Some(status);
                if terminal {
                    return PollResult {
                        end: PollEnd::Terminal,
                        status: last_status,
                    };
                }
            }
            Err(VenueError::NotFound(_)) => {
                // Order unknown: treat as rejected-before-booking.
                warn!(order_id, "order vanished while polling");
                return PollResult {
                    end: PollEnd::Terminal,
                    status: last_status,
                };
            }
            Err(e) => {
                debug!(order_id, error = %e, "order poll failed, will retry");
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return PollResult {
                end: PollEnd::TimedOut,
                status: last_status,
            };
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                return PollResult { end: PollEnd::Canceled, status: last_status };
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Cancel an order and wait for the venue to confirm it is out of the
/// book, observing any fills that landed during cancellation. Returns the
/// last observed status so callers can hedge late fills.
pub async fn cancel_and_confirm(
    venue: &Arc<dyn VenueApi>,
    order_id: &str,
    poll_interval: Duration,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> VenueResult<PollResult> {
    venue.cancel_order(order_id).await?;
    Ok(poll_until_terminal(venue, order_id, poll_interval, timeout, shutdown).await)
}
