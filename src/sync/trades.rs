//! Trade-history instantiation of the reconciliation engine.
//!
//! Aggregate trades carry contiguous underlying trade-id ranges per symbol,
//! so adjacency is exact: the next record's `first_trade_id` is the current
//! marker plus one. An empty market (marker 0) accepts any first record.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::engine::{self, EngineHandle, Reconcile, SnapshotSource};
use crate::config::SyncConfig;
use crate::feed::binance_rest::{FetchError, TradeSnapshotSource};
use crate::feed::binance_ws::MarketStream;
use crate::feed::messages::FeedMessage;
use crate::models::{MarketPair, Trade, TradeHistory};

pub struct TradeSync;

impl Reconcile for TradeSync {
    type State = TradeHistory;
    type Update = Trade;

    const KIND: &'static str = "trades";

    fn accept(msg: FeedMessage) -> Option<Trade> {
        match msg {
            FeedMessage::Trade(trade) => Some(trade),
            _ => None,
        }
    }

    fn marker(state: &TradeHistory) -> u64 {
        state.latest_id()
    }

    fn range(update: &Trade) -> (u64, u64) {
        (update.first_trade_id, update.last_trade_id)
    }

    fn is_stale(update: &Trade, marker: u64) -> bool {
        update.first_trade_id <= marker
    }

    fn bridges(update: &Trade, marker: u64) -> bool {
        marker == 0 || update.first_trade_id == marker + 1
    }

    fn follows(update: &Trade, marker: u64) -> bool {
        marker == 0 || update.first_trade_id == marker + 1
    }

    fn apply(state: &mut TradeHistory, update: Trade) {
        state.merge_batch(std::iter::once(update));
    }
}

/// Trade-history baseline bound to one pair.
pub struct TradeBaseline {
    client: Arc<dyn TradeSnapshotSource>,
    pair: MarketPair,
    limit: u32,
    capacity: usize,
}

impl TradeBaseline {
    pub fn new(
        client: Arc<dyn TradeSnapshotSource>,
        pair: MarketPair,
        limit: u32,
        capacity: usize,
    ) -> Self {
        Self {
            client,
            pair,
            limit,
            capacity,
        }
    }
}

#[async_trait]
impl SnapshotSource for TradeBaseline {
    type State = TradeHistory;

    async fn fetch(&self) -> Result<TradeHistory, FetchError> {
        let trades = self.client.recent_trades(&self.pair, self.limit).await?;
        Ok(TradeHistory::from_snapshot(trades, self.capacity))
    }
}

/// Wire up one trade-history engine instance for `pair`.
pub fn spawn_trade_engine<S>(
    stream: S,
    client: Arc<dyn TradeSnapshotSource>,
    pair: MarketPair,
    reachability: watch::Receiver<bool>,
    config: SyncConfig,
) -> EngineHandle<TradeHistory>
where
    S: MarketStream + 'static,
{
    let label = format!("{}@aggTrade", pair.ws_symbol());
    let baseline = Arc::new(TradeBaseline::new(
        client,
        pair,
        config.trade_limit,
        config.trade_capacity,
    ));
    engine::spawn::<TradeSync, S, TradeBaseline>(label, stream, baseline, reachability, config)
}
