//! bookbot - local order book & trade history replica for one market pair.
//!
//! Thin CLI around the sync engines: picks a pair and update speed, wires
//! the real REST/stream adapters, and logs published states until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bookbot::config::SyncConfig;
use bookbot::feed::{
    agg_trade_stream_url, depth_stream_url, BinanceRestClient, BinanceWsStream,
    DepthSnapshotSource, ReachabilityMonitor, TradeSnapshotSource, WsParams,
};
use bookbot::models::{MarketPair, OrderBook, TradeHistory};
use bookbot::sync::{spawn_depth_engine, spawn_trade_engine};

#[derive(Parser, Debug)]
#[command(
    name = "bookbot",
    about = "Synchronized order book and trade history for one market pair"
)]
struct Args {
    /// Market pair, e.g. BNB/BTC
    #[arg(long, default_value = "BNB/BTC", env = "BOOKBOT_PAIR")]
    pair: String,

    /// Depth stream cadence: 1000ms or 100ms
    #[arg(long, default_value = "1000ms", env = "BOOKBOT_UPDATE_SPEED")]
    speed: String,

    /// Depth snapshot size (5, 10, 20, 50, 100, 500, 1000 or 5000)
    #[arg(long, env = "BOOKBOT_DEPTH_LIMIT")]
    depth_limit: Option<u32>,

    /// Book levels to show per side when logging
    #[arg(long, default_value_t = 5)]
    show_levels: usize,
}

/// Probe target derived from the REST endpoint.
fn probe_target(rest_base_url: &str) -> (String, u16) {
    let trimmed = rest_base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = trimmed.split('/').next().unwrap_or(trimmed);
    match host.split_once(':') {
        Some((name, port)) => (name.to_string(), port.parse().unwrap_or(443)),
        None => (host.to_string(), 443),
    }
}

fn log_book(pair: &MarketPair, book: &OrderBook, levels: usize) {
    let bid = book.best_bid().map(|l| l.price).unwrap_or(0.0);
    let ask = book.best_ask().map(|l| l.price).unwrap_or(0.0);
    info!(
        pair = %pair,
        sequence = book.last_update_id,
        best_bid = bid,
        best_ask = ask,
        spread = ask - bid,
        bids = book.bids.len().min(levels),
        asks = book.asks.len().min(levels),
        "book"
    );
}

fn log_trades(pair: &MarketPair, history: &TradeHistory) {
    if let Some(trade) = history.latest() {
        info!(
            pair = %pair,
            id = trade.id,
            price = trade.price,
            amount = trade.amount,
            seller_side = trade.is_buyer_maker,
            time = %trade.time().map(|t| t.to_rfc3339()).unwrap_or_default(),
            "trade"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bookbot=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = SyncConfig::from_env();
    config.update_speed = args.speed.parse()?;
    if let Some(limit) = args.depth_limit {
        config.depth_limit = limit;
    }
    config.validate()?;
    let pair = MarketPair::parse(&args.pair)?;

    let rest = Arc::new(
        BinanceRestClient::new(config.rest_base_url.clone(), Duration::from_secs(30))
            .context("building REST client")?,
    );

    let params = WsParams::from_config(&config);
    let depth_stream = BinanceWsStream::new(
        depth_stream_url(&config.ws_base_url, &pair, config.update_speed),
        params.clone(),
    );
    let trade_stream = BinanceWsStream::new(
        agg_trade_stream_url(&config.ws_base_url, &pair),
        params,
    );

    let (probe_host, probe_port) = probe_target(&config.rest_base_url);
    let reachability = ReachabilityMonitor::spawn_probe(
        probe_host,
        probe_port,
        config.probe_interval(),
        config.connect_timeout(),
    );

    let depth = spawn_depth_engine(
        depth_stream,
        Arc::clone(&rest) as Arc<dyn DepthSnapshotSource>,
        pair.clone(),
        reachability.subscribe(),
        config.clone(),
    );
    let trades = spawn_trade_engine(
        trade_stream,
        rest as Arc<dyn TradeSnapshotSource>,
        pair.clone(),
        reachability.subscribe(),
        config.clone(),
    );

    depth.start();
    trades.start();
    info!(pair = %pair, speed = ?config.update_speed, "bookbot_started");

    let mut book_rx = depth.state();
    let mut trades_rx = trades.state();
    let mut connecting_rx = depth.is_connecting();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            res = book_rx.changed() => {
                if res.is_err() {
                    warn!("depth engine gone");
                    break;
                }
                if let Some(book) = book_rx.borrow_and_update().as_ref() {
                    log_book(&pair, book, args.show_levels);
                }
            }

            res = trades_rx.changed() => {
                if res.is_err() {
                    warn!("trade engine gone");
                    break;
                }
                if let Some(history) = trades_rx.borrow_and_update().as_ref() {
                    log_trades(&pair, history);
                }
            }

            res = connecting_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let connecting = *connecting_rx.borrow_and_update();
                info!(pair = %pair, connecting, "connection_state");
            }
        }
    }

    info!("shutting down");
    depth.stop().await;
    trades.stop().await;
    info!(depth = %depth.metrics().summary(), "depth_session");
    info!(trades = %trades.metrics().summary(), "trades_session");

    Ok(())
}
