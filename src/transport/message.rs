use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::Result;

/// A request as sent by the browser: `{"action": "subscribe", "securities": ["AAPL"]}`.
///
/// `action` is kept as a raw value so that unknown or missing actions can be
/// echoed back instead of failing to parse.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub action: Option<Value>,

    #[serde(default)]
    pub securities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Anything else; carries the action as it should be echoed.
    Unknown(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Request> {
        let message: ClientMessage = serde_json::from_str(text)?;
        Ok(message.into_request())
    }

    pub fn into_request(self) -> Request {
        let tickers = || -> Vec<String> {
            self.securities
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        };

        match self.action.as_ref() {
            Some(Value::String(action)) if action == "subscribe" => Request::Subscribe(tickers()),
            Some(Value::String(action)) if action == "unsubscribe" => {
                Request::Unsubscribe(tickers())
            }
            Some(Value::String(action)) => Request::Unknown(action.clone()),
            Some(other) => Request::Unknown(other.to_string()),
            None => Request::Unknown("none".to_string()),
        }
    }
}

/// `{"ticker": "AAPL", "price": 150.25}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub ticker: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ConnectionEstablished { message: String },
    Heartbeat { timestamp: String },
    Echo { message: String },
    Error { message: String },
}

/// Everything the server writes to a client, one JSON object per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlMessage),
    Price(PriceUpdate),
}

impl ServerMessage {
    pub fn price(ticker: &str, price: f64) -> Self {
        ServerMessage::Price(PriceUpdate {
            ticker: ticker.to_string(),
            price,
        })
    }

    pub fn connection_established() -> Self {
        ServerMessage::Control(ControlMessage::ConnectionEstablished {
            message: "Connected to WebSocket server".to_string(),
        })
    }

    pub fn heartbeat() -> Self {
        ServerMessage::Control(ControlMessage::Heartbeat {
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn echo(message: impl Into<String>) -> Self {
        ServerMessage::Control(ControlMessage::Echo {
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Control(ControlMessage::Error {
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
