//! Append-only trade log.
//!
//! One JSON line per executed leg, plus deficit records from
//! reconciliation. The engine is otherwise stateless across restarts;
//! this file is the only persisted artifact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::types::{Side, VenueId};

/// One executed leg (or residual deficit) of an arbitrage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub opportunity_id: String,
    pub venue: VenueId,
    pub token_id: String,
    pub side: Side,
    pub order_qty: f64,
    pub limit_price: f64,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub fee: f64,
    /// "immediate", "liquidity", "hedge", "reconcile", or "deficit".
    pub kind: String,
}

/// Serialized writer over the JSON-lines trade log.
pub struct TradeLog {
    path: PathBuf,
    writer: Mutex<std::fs::File>,
}

impl TradeLog {
    /// Open (creating if needed) `trades.jsonl` under the given directory.
    pub fn open(dir: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating trade log directory {}", dir))?;
        let path = Path::new(dir).join("trades.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening trade log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Log failures are reported but never fail the
    /// trading path.
    pub fn record(&self, record: &TradeRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                warn!("trade log serialization failed: {}", e);
                return;
            }
        };
        let mut file = match self.writer.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("trade log write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, VenueId};

    fn sample_record(kind: &str) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            opportunity_id: "opp-123".to_string(),
            venue: VenueId::Opinion,
            token_id: "tok-yes".to_string(),
            side: Side::Buy,
            order_qty: 510.2,
            limit_price: 0.55,
            filled_qty: 500.0,
            avg_fill_price: 0.55,
            fee: 4.91,
            kind: kind.to_string(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::open(dir.path().to_str().unwrap()).unwrap();

        log.record(&sample_record("immediate"));
        log.record(&sample_record("hedge"));

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TradeRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.opportunity_id, "opp-123");
        assert_eq!(first.kind, "immediate");
        assert_eq!(first.filled_qty, 500.0);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        {
            let log = TradeLog::open(dir_str).unwrap();
            log.record(&sample_record("immediate"));
        }
        {
            let log = TradeLog::open(dir_str).unwrap();
            log.record(&sample_record("deficit"));
        }

        let path = dir.path().join("trades.jsonl");
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
