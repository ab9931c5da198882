//! bookbot
//!
//! Keeps a faithful local replica of exchange market data for one market
//! pair: a sorted order book built from snapshot + diff reconciliation, and
//! a rolling trade history, both resynced from scratch whenever sequence
//! continuity cannot be guaranteed.

pub mod config;
pub mod feed;
pub mod models;
pub mod sync;

pub use config::{ConfigError, SyncConfig, UpdateSpeed};
pub use models::{DepthDiff, MarketPair, OrderBook, PriceLevel, Trade, TradeHistory};
pub use sync::{spawn_depth_engine, spawn_trade_engine, EngineHandle, EngineMetrics, SyncState};
