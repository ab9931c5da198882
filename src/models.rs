//! Core market-data model shared by the feed and sync layers.
//!
//! Plain data plus the pure merge rules:
//! - `OrderBook::apply_diff` folds a depth diff into sorted bid/ask levels
//! - `TradeHistory::merge_batch` prepends fresh trades, capped at capacity
//!
//! No I/O happens here. All mutation goes through the engine that owns the
//! state, so none of these types need interior mutability.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A pair of currencies such as `BNB` / `BTC`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketPair {
    pub base: String,
    pub quote: String,
}

impl MarketPair {
    /// Parse `"BNB/BTC"` into a validated pair.
    ///
    /// Anything the exchange would reject fails here, synchronously, before
    /// any connection is attempted.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut parts = s.splitn(2, '/');
        let base = parts.next().unwrap_or("").trim();
        let quote = parts.next().unwrap_or("").trim();

        for part in [base, quote] {
            if part.is_empty() {
                return Err(ConfigError::InvalidPair {
                    value: s.to_string(),
                    reason: "expected BASE/QUOTE".to_string(),
                });
            }
            if !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::InvalidPair {
                    value: s.to_string(),
                    reason: format!("`{part}` contains non-alphanumeric characters"),
                });
            }
        }

        Ok(Self {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    /// Symbol format used by the REST API, e.g. `BNBBTC`.
    pub fn api_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote).to_uppercase()
    }

    /// Symbol format used in stream names, e.g. `bnbbtc`.
    pub fn ws_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote).to_lowercase()
    }
}

impl fmt::Display for MarketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.base.to_uppercase(),
            self.quote.to_uppercase()
        )
    }
}

/// One price level of an order book side.
///
/// Amounts are absolute quantities. A level with amount 0 is never stored;
/// it only appears inside diffs, where it means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub amount: f64,
}

impl PriceLevel {
    pub fn new(price: f64, amount: f64) -> Self {
        Self { price, amount }
    }
}

/// Full depth state for one market pair.
///
/// Invariants held by every constructor and by `apply_diff`:
/// - bids sorted by price descending, asks ascending
/// - no duplicate price within a side
/// - no level with amount 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn new(last_update_id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        let mut book = Self {
            last_update_id,
            bids,
            asks,
        };
        book.sort();
        book
    }

    /// Re-sort both sides and drop empty levels. Snapshot payloads arrive
    /// pre-sorted; this guards against a misbehaving endpoint.
    pub fn sort(&mut self) {
        self.bids.retain(|l| l.amount > 0.0);
        self.asks.retain(|l| l.amount > 0.0);
        self.bids.sort_by(|a, b| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.asks.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Fold one depth diff into the book.
    ///
    /// Per-level rules of the exchange protocol:
    /// - amounts are absolute, an existing level is replaced in place
    /// - amount 0 removes the level
    /// - amount 0 for a level we never had is a no-op (normal, not an error)
    /// - new levels are inserted at the position that keeps the side sorted
    ///
    /// Sequence validation is the engine's job; this applies unconditionally
    /// and records the diff's final update id.
    pub fn apply_diff(&mut self, diff: &DepthDiff) {
        Self::apply_side(&mut self.bids, &diff.bids, |existing, price| {
            existing.price < price
        });
        Self::apply_side(&mut self.asks, &diff.asks, |existing, price| {
            existing.price > price
        });
        self.last_update_id = diff.last_update_id;
    }

    fn apply_side(
        levels: &mut Vec<PriceLevel>,
        updates: &[PriceLevel],
        displaces: fn(&PriceLevel, f64) -> bool,
    ) {
        for update in updates {
            match levels.iter().position(|l| l.price == update.price) {
                Some(i) if update.amount == 0.0 => {
                    levels.remove(i);
                }
                Some(i) => levels[i].amount = update.amount,
                None if update.amount > 0.0 => {
                    let at = levels
                        .iter()
                        .position(|l| displaces(l, update.price))
                        .unwrap_or(levels.len());
                    levels.insert(at, *update);
                }
                None => {}
            }
        }
    }
}

/// Incremental depth update covering the sequence range
/// `first_update_id..=last_update_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthDiff {
    pub event_time_ms: i64,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// One aggregate trade, from the REST history or the live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub price: f64,
    pub amount: f64,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    pub timestamp_ms: i64,
    pub is_buyer_maker: bool,
    pub is_best_match: bool,
}

impl Trade {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

/// Rolling trade history, newest first, capped at a fixed capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistory {
    trades: VecDeque<Trade>,
    capacity: usize,
}

impl TradeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build from a REST history page. The endpoint returns oldest-first;
    /// ordering here is normalized to newest-first regardless.
    pub fn from_snapshot(mut trades: Vec<Trade>, capacity: usize) -> Self {
        trades.sort_by(|a, b| b.id.cmp(&a.id));
        trades.truncate(capacity);
        Self {
            trades: trades.into(),
            capacity,
        }
    }

    /// Id of the most recent underlying trade, 0 for an empty history.
    pub fn latest_id(&self) -> u64 {
        self.trades.front().map(|t| t.last_trade_id).unwrap_or(0)
    }

    pub fn latest(&self) -> Option<&Trade> {
        self.trades.front()
    }

    pub fn records(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Merge a batch of trades in arrival order (oldest first).
    ///
    /// A record whose `first_trade_id` is not beyond the current head has
    /// already been seen and is skipped. Returns how many were applied.
    pub fn merge_batch<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = Trade>,
    {
        let mut applied = 0;
        for trade in batch {
            if trade.first_trade_id <= self.latest_id() {
                continue;
            }
            self.trades.push_front(trade);
            self.trades.truncate(self.capacity);
            applied += 1;
        }
        applied
    }
}
