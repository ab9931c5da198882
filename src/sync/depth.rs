//! Depth (order book) instantiation of the reconciliation engine.
//!
//! Continuity rules of the depth stream:
//! - a diff with `last_update_id <= marker` is already in the snapshot
//! - the first applied diff must straddle `marker + 1`
//! - afterwards every diff's `first_update_id` must be exactly `marker + 1`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::engine::{self, EngineHandle, Reconcile, SnapshotSource};
use crate::config::SyncConfig;
use crate::feed::binance_rest::{DepthSnapshotSource, FetchError};
use crate::feed::binance_ws::MarketStream;
use crate::feed::messages::FeedMessage;
use crate::models::{DepthDiff, MarketPair, OrderBook};

pub struct DepthSync;

impl Reconcile for DepthSync {
    type State = OrderBook;
    type Update = DepthDiff;

    const KIND: &'static str = "depth";

    fn accept(msg: FeedMessage) -> Option<DepthDiff> {
        match msg {
            FeedMessage::Depth(diff) => Some(diff),
            _ => None,
        }
    }

    fn marker(state: &OrderBook) -> u64 {
        state.last_update_id
    }

    fn range(update: &DepthDiff) -> (u64, u64) {
        (update.first_update_id, update.last_update_id)
    }

    fn is_stale(update: &DepthDiff, marker: u64) -> bool {
        update.last_update_id <= marker
    }

    fn bridges(update: &DepthDiff, marker: u64) -> bool {
        update.first_update_id <= marker + 1 && update.last_update_id >= marker + 1
    }

    fn follows(update: &DepthDiff, marker: u64) -> bool {
        update.first_update_id == marker + 1
    }

    fn apply(state: &mut OrderBook, update: DepthDiff) {
        state.apply_diff(&update);
    }
}

/// Depth baseline bound to one pair, ready for the engine to call.
pub struct DepthBaseline {
    client: Arc<dyn DepthSnapshotSource>,
    pair: MarketPair,
    limit: u32,
}

impl DepthBaseline {
    pub fn new(client: Arc<dyn DepthSnapshotSource>, pair: MarketPair, limit: u32) -> Self {
        Self {
            client,
            pair,
            limit,
        }
    }
}

#[async_trait]
impl SnapshotSource for DepthBaseline {
    type State = OrderBook;

    async fn fetch(&self) -> Result<OrderBook, FetchError> {
        self.client.depth_snapshot(&self.pair, self.limit).await
    }
}

/// Wire up one order-book engine instance for `pair`.
pub fn spawn_depth_engine<S>(
    stream: S,
    client: Arc<dyn DepthSnapshotSource>,
    pair: MarketPair,
    reachability: watch::Receiver<bool>,
    config: SyncConfig,
) -> EngineHandle<OrderBook>
where
    S: MarketStream + 'static,
{
    let label = format!("{}@depth", pair.ws_symbol());
    let baseline = Arc::new(DepthBaseline::new(client, pair, config.depth_limit));
    engine::spawn::<DepthSync, S, DepthBaseline>(label, stream, baseline, reachability, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(first: u64, last: u64) -> DepthDiff {
        DepthDiff {
            event_time_ms: 0,
            first_update_id: first,
            last_update_id: last,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    #[test]
    fn test_stale_when_entirely_behind_marker() {
        assert!(DepthSync::is_stale(&diff(995, 999), 1000));
        assert!(DepthSync::is_stale(&diff(995, 1000), 1000));
        assert!(!DepthSync::is_stale(&diff(995, 1001), 1000));
    }

    #[test]
    fn test_bridge_must_straddle_marker() {
        // 1005..1010 starts beyond marker+1: unrecoverable gap.
        assert!(!DepthSync::bridges(&diff(1005, 1010), 1000));
        // 998..1003 straddles 1001.
        assert!(DepthSync::bridges(&diff(998, 1003), 1000));
        // Exact adjacency bridges too.
        assert!(DepthSync::bridges(&diff(1001, 1002), 1000));
    }

    #[test]
    fn test_follows_requires_exact_adjacency() {
        assert!(DepthSync::follows(&diff(1003, 1004), 1002));
        assert!(!DepthSync::follows(&diff(1004, 1005), 1002));
        assert!(!DepthSync::follows(&diff(1002, 1003), 1002));
    }
}
