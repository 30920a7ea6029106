use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{PriceCastError, Result};

/// A price change as published on the bus.
///
/// The publisher sends `{"ticker": "AAPL", "price": 150.25, "timestamp": 1717000000.5}`.
/// The price is taken as-is; the fanout never adjusts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceEvent {
    pub ticker: String,
    pub price: f64,
    pub timestamp: Option<f64>,
}

impl PriceEvent {
    /// Parses a bus payload received on the channel for `ticker`.
    ///
    /// A missing `ticker` falls back to the channel's; `price` may be a JSON
    /// number or a numeric string and is required.
    pub fn parse(ticker: &str, payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)?;

        let price = value
            .get("price")
            .and_then(number)
            .ok_or_else(|| PriceCastError::MalformedPayload(format!("no price for {ticker}")))?;

        let ticker = value
            .get("ticker")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(ticker)
            .to_string();

        Ok(Self {
            ticker,
            price,
            timestamp: value.get("timestamp").and_then(number),
        })
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
