pub mod binance_rest; // baseline snapshot fetches (REST)
pub mod binance_ws; // live stream adapter (raw streams)
pub mod messages; // wire types + frame decoding
pub mod reachability; // de-duplicated connectivity signal

pub use binance_rest::{BinanceRestClient, DepthSnapshotSource, FetchError, TradeSnapshotSource};
pub use binance_ws::{
    agg_trade_stream_url, depth_stream_url, BinanceWsStream, MarketStream, StreamEvent, WsParams,
};
pub use messages::{decode_frame, DecodeError, FeedMessage, ServerError};
pub use reachability::ReachabilityMonitor;
