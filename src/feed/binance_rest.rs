//! REST client for baseline snapshots.
//!
//! Point-in-time fetches only; the live feed comes from the stream. The
//! client never retries on its own, the engine owns the retry cadence.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::messages::{self, RawAggTrade};
use crate::models::{MarketPair, OrderBook, Trade};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Baseline source for the depth engine.
#[async_trait]
pub trait DepthSnapshotSource: Send + Sync {
    async fn depth_snapshot(&self, pair: &MarketPair, limit: u32) -> Result<OrderBook, FetchError>;
}

/// Baseline source for the trade-history engine.
#[async_trait]
pub trait TradeSnapshotSource: Send + Sync {
    async fn recent_trades(&self, pair: &MarketPair, limit: u32) -> Result<Vec<Trade>, FetchError>;
}

/*
GET /api/v3/depth?symbol=BNBBTC&limit=500
{
  "lastUpdateId": 4405135474,
  "bids": [["9728.18000000", "0.12808100"], ...],
  "asks": [["9728.99000000", "0.25704700"], ...]
}
*/
#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Clone)]
pub struct BinanceRestClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FetchError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self.client.get(self.url(path)).query(query).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl DepthSnapshotSource for BinanceRestClient {
    async fn depth_snapshot(&self, pair: &MarketPair, limit: u32) -> Result<OrderBook, FetchError> {
        let raw: RawDepthSnapshot = self
            .get_json(
                "/api/v3/depth",
                &[
                    ("symbol", pair.api_symbol()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let bids = messages::parse_levels(&raw.bids, "bids")
            .map_err(|e| FetchError::Payload(e.to_string()))?;
        let asks = messages::parse_levels(&raw.asks, "asks")
            .map_err(|e| FetchError::Payload(e.to_string()))?;

        Ok(OrderBook::new(raw.last_update_id, bids, asks))
    }
}

#[async_trait]
impl TradeSnapshotSource for BinanceRestClient {
    async fn recent_trades(&self, pair: &MarketPair, limit: u32) -> Result<Vec<Trade>, FetchError> {
        let raw: Vec<RawAggTrade> = self
            .get_json(
                "/api/v3/aggTrades",
                &[
                    ("symbol", pair.api_symbol()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        raw.into_iter()
            .map(|t| Trade::try_from(t).map_err(|e| FetchError::Payload(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_snapshot_payload_decodes() {
        let text = r#"{
            "lastUpdateId": 4405135474,
            "bids": [["9728.18000000", "0.12808100"], ["9728.17000000", "0.04472000"]],
            "asks": [["9728.99000000", "0.25704700"], ["9729.07000000", "2.02563600"]]
        }"#;

        let raw: RawDepthSnapshot = serde_json::from_str(text).unwrap();
        assert_eq!(raw.last_update_id, 4_405_135_474);
        assert_eq!(raw.bids.len(), 2);

        let bids = messages::parse_levels(&raw.bids, "bids").unwrap();
        assert_eq!(bids[0].price, 9728.18);
        assert_eq!(bids[0].amount, 0.128081);
    }

    #[test]
    fn test_client_builds_query_urls() {
        let client =
            BinanceRestClient::new("https://api.binance.com", Duration::from_secs(30)).unwrap();
        assert_eq!(
            client.url("/api/v3/depth"),
            "https://api.binance.com/api/v3/depth"
        );
    }
}
