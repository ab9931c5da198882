//! Typed messages from the exchange stream.
//!
//! One frame decodes to one `FeedMessage`. A frame that fails to decode
//! produces a `DecodeError` and nothing else; the connection stays up and
//! later frames are unaffected.

use serde::Deserialize;
use thiserror::Error;

use crate::models::{DepthDiff, PriceLevel, Trade};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized event `{0}`")]
    UnknownEvent(String),
    #[error("invalid decimal in `{0}`")]
    Decimal(&'static str),
}

/// Error frame pushed by the server on a malformed subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerError {
    pub code: i64,
    #[serde(rename = "msg")]
    pub message: String,
}

/// A successfully decoded stream frame.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Depth(DepthDiff),
    Trade(Trade),
    /// Protocol-level error from the server. The transport stays open.
    ServerError(ServerError),
}

/*
{
  "e": "depthUpdate", // Event type
  "E": 123456789,     // Event time
  "s": "BNBBTC",      // Symbol
  "U": 157,           // First update ID in event
  "u": 160,           // Final update ID in event
  "b": [["0.0024", "10"]],
  "a": [["0.0026", "100"]]
}
*/
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    last_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/*
{
  "a": 26129,         // Aggregate tradeId
  "p": "0.01633102",  // Price
  "q": "4.70443515",  // Quantity
  "f": 27781,         // First tradeId
  "l": 27781,         // Last tradeId
  "T": 1498793709153, // Timestamp
  "m": true,          // Was the buyer the maker?
  "M": true           // Was the trade the best price match?
}
Stream frames carry `e`/`E`/`s` on top; unknown fields are ignored, so the
same shape covers both the stream and the REST history payload.
*/
#[derive(Debug, Deserialize)]
pub(crate) struct RawAggTrade {
    #[serde(rename = "a")]
    id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    amount: String,
    #[serde(rename = "f")]
    first_trade_id: u64,
    #[serde(rename = "l")]
    last_trade_id: u64,
    #[serde(rename = "T")]
    timestamp_ms: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "M", default)]
    is_best_match: bool,
}

impl TryFrom<RawAggTrade> for Trade {
    type Error = DecodeError;

    fn try_from(raw: RawAggTrade) -> Result<Self, DecodeError> {
        Ok(Trade {
            id: raw.id,
            price: parse_decimal(&raw.price, "p")?,
            amount: parse_decimal(&raw.amount, "q")?,
            first_trade_id: raw.first_trade_id,
            last_trade_id: raw.last_trade_id,
            timestamp_ms: raw.timestamp_ms,
            is_buyer_maker: raw.is_buyer_maker,
            is_best_match: raw.is_best_match,
        })
    }
}

fn parse_decimal(s: &str, field: &'static str) -> Result<f64, DecodeError> {
    fast_float::parse(s).map_err(|_| DecodeError::Decimal(field))
}

/// Parse `[["price", "qty"], ...]` as pushed by the wire.
pub(crate) fn parse_levels(
    raw: &[[String; 2]],
    field: &'static str,
) -> Result<Vec<PriceLevel>, DecodeError> {
    raw.iter()
        .map(|entry| {
            Ok(PriceLevel::new(
                parse_decimal(&entry[0], field)?,
                parse_decimal(&entry[1], field)?,
            ))
        })
        .collect()
}

/// Decode one text frame into a typed message.
pub fn decode_frame(text: &str) -> Result<FeedMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    match value.get("e").and_then(|e| e.as_str()) {
        Some("depthUpdate") => {
            let raw: RawDepthUpdate = serde_json::from_value(value)?;
            Ok(FeedMessage::Depth(DepthDiff {
                event_time_ms: raw.event_time_ms,
                first_update_id: raw.first_update_id,
                last_update_id: raw.last_update_id,
                bids: parse_levels(&raw.bids, "b")?,
                asks: parse_levels(&raw.asks, "a")?,
            }))
        }
        Some("aggTrade") => {
            let raw: RawAggTrade = serde_json::from_value(value)?;
            Ok(FeedMessage::Trade(raw.try_into()?))
        }
        Some(other) => Err(DecodeError::UnknownEvent(other.to_string())),
        None => {
            if value.get("code").is_some() && value.get("msg").is_some() {
                let err: ServerError = serde_json::from_value(value)?;
                Ok(FeedMessage::ServerError(err))
            } else {
                Err(DecodeError::UnknownEvent("<missing event type>".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_depth_update() {
        let text = r#"{
            "e": "depthUpdate", "E": 123456789, "s": "BNBBTC",
            "U": 157, "u": 160,
            "b": [["0.0024", "10"]],
            "a": [["0.0026", "100"]]
        }"#;

        let msg = decode_frame(text).unwrap();
        let diff = match msg {
            FeedMessage::Depth(diff) => diff,
            other => panic!("expected depth diff, got {other:?}"),
        };

        assert_eq!(diff.event_time_ms, 123_456_789);
        assert_eq!(diff.first_update_id, 157);
        assert_eq!(diff.last_update_id, 160);
        assert_eq!(diff.bids, vec![PriceLevel::new(0.0024, 10.0)]);
        assert_eq!(diff.asks, vec![PriceLevel::new(0.0026, 100.0)]);
    }

    #[test]
    fn test_decode_agg_trade() {
        let text = r#"{
            "e": "aggTrade", "E": 123456789, "s": "BNBBTC",
            "a": 26129, "p": "0.01633102", "q": "4.70443515",
            "f": 27781, "l": 27781, "T": 1498793709153,
            "m": true, "M": true
        }"#;

        let msg = decode_frame(text).unwrap();
        let trade = match msg {
            FeedMessage::Trade(trade) => trade,
            other => panic!("expected trade, got {other:?}"),
        };

        assert_eq!(trade.id, 26129);
        assert_eq!(trade.price, 0.01633102);
        assert_eq!(trade.amount, 4.70443515);
        assert_eq!(trade.first_trade_id, 27781);
        assert_eq!(trade.last_trade_id, 27781);
        assert_eq!(trade.timestamp_ms, 1_498_793_709_153);
        assert!(trade.is_buyer_maker);
        assert!(trade.is_best_match);
    }

    #[test]
    fn test_decode_server_error_frame() {
        let text = r#"{"code": 2, "msg": "Invalid request: unknown variant"}"#;

        let msg = decode_frame(text).unwrap();
        match msg {
            FeedMessage::ServerError(err) => {
                assert_eq!(err.code, 2);
                assert!(err.message.contains("Invalid request"));
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        let err = decode_frame(r#"{"e": "kline", "E": 1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEvent(_)));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(
            decode_frame("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_bad_decimal_is_an_error() {
        let text = r#"{
            "e": "depthUpdate", "E": 1, "s": "BNBBTC",
            "U": 1, "u": 1,
            "b": [["oops", "10"]],
            "a": []
        }"#;

        assert!(matches!(
            decode_frame(text),
            Err(DecodeError::Decimal("b"))
        ));
    }

    #[test]
    fn test_rest_trade_payload_decodes_without_event_fields() {
        let text = r#"{
            "a": 26129, "p": "0.01633102", "q": "4.70443515",
            "f": 27781, "l": 27781, "T": 1498793709153,
            "m": false
        }"#;

        let raw: RawAggTrade = serde_json::from_str(text).unwrap();
        let trade: Trade = raw.try_into().unwrap();
        assert!(!trade.is_buyer_maker);
        assert!(!trade.is_best_match);
    }
}
