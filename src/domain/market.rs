//! Market data envelopes and their typed payloads.
//!
//! The bus delivers market data as JSON with a kind discriminator and a
//! kind-specific `metadata` payload; accessors below convert tolerantly,
//! since numeric fields arrive as numbers or strings depending on venue.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Result, SlicerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketDataKind {
    Quote,
    Orderbook,
    Trade,
    Index,
    Funding,
    Kline,
    #[serde(rename = "quote_ticker")]
    Ticker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataEnvelope {
    pub exchange: String,
    pub symbol: String,
    pub contract_type: String,
    pub data_type: MarketDataKind,
    pub metadata: Value,
    pub timestamp: String,
    #[serde(default)]
    pub range: Option<String>,
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: Option<String>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn mid(&self) -> Option<Decimal> {
        Some((self.best_ask()? + self.best_bid()?) / Decimal::TWO)
    }
}

/// One public trade print
#[derive(Debug, Clone)]
pub struct TradeTick {
    pub id: String,
    pub timestamp: String,
    pub price: Decimal,
    pub side: String,
    pub size: Decimal,
}

/// One kline bar; only the fields the algorithms read
#[derive(Debug, Clone)]
pub struct KlineBar {
    pub timestamp: String,
    pub volume: Decimal,
}

/// Decimal from a JSON number or numeric string. `None` for anything else
/// (including the gateway's literal `"unknown"`).
pub(crate) fn value_to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

fn levels_from(v: Option<&Value>) -> Vec<BookLevel> {
    let Some(Value::Array(rows)) = v else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            Some(BookLevel {
                price: value_to_decimal(row.first()?)?,
                size: value_to_decimal(row.get(1)?)?,
            })
        })
        .collect()
}

impl MarketDataEnvelope {
    fn malformed(&self, what: &str) -> SlicerError {
        SlicerError::Malformed(format!(
            "{} {} {:?}: {what}",
            self.exchange, self.symbol, self.data_type
        ))
    }

    /// Interpret the payload as an order book snapshot.
    pub fn orderbook(&self) -> Result<OrderBook> {
        let bids = levels_from(self.metadata.get("bids"));
        let asks = levels_from(self.metadata.get("asks"));
        if bids.is_empty() && asks.is_empty() {
            return Err(self.malformed("no book levels"));
        }
        Ok(OrderBook {
            bids,
            asks,
            timestamp: self
                .metadata
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Interpret the payload as a batch of trade prints
    /// (`[[id, timestamp, price, side, size], ...]`).
    pub fn trades(&self) -> Result<Vec<TradeTick>> {
        let Value::Array(rows) = &self.metadata else {
            return Err(self.malformed("trade payload is not an array"));
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                Some(TradeTick {
                    id: match row.first()? {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                    timestamp: row.get(1)?.as_str()?.to_string(),
                    price: value_to_decimal(row.get(2)?)?,
                    side: row.get(3)?.as_str().unwrap_or_default().to_string(),
                    size: value_to_decimal(row.get(4)?)?,
                })
            })
            .collect())
    }

    /// Interpret the payload as the latest kline bar. Venues publish either
    /// an object or a `[[ts, o, c, h, l, v]]` batch; for a batch the most
    /// recent row wins.
    pub fn kline(&self) -> Result<KlineBar> {
        match &self.metadata {
            Value::Object(map) => {
                let timestamp = map
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.malformed("kline without timestamp"))?;
                let volume = map
                    .get("volume")
                    .and_then(value_to_decimal)
                    .ok_or_else(|| self.malformed("kline without volume"))?;
                Ok(KlineBar {
                    timestamp: timestamp.to_string(),
                    volume,
                })
            }
            Value::Array(rows) => rows
                .last()
                .and_then(Value::as_array)
                .and_then(|row| {
                    Some(KlineBar {
                        timestamp: match row.first()? {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                        volume: value_to_decimal(row.get(5)?)?,
                    })
                })
                .ok_or_else(|| self.malformed("kline batch is empty")),
            _ => Err(self.malformed("kline payload shape")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn envelope(kind: MarketDataKind, metadata: Value) -> MarketDataEnvelope {
        MarketDataEnvelope {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            contract_type: "spot".to_string(),
            data_type: kind,
            metadata,
            timestamp: "20191012153300000".to_string(),
            range: None,
        }
    }

    #[test]
    fn parses_orderbook() {
        let env = envelope(
            MarketDataKind::Orderbook,
            json!({
                "bids": [[8000.5, 1.2], ["7999.5", "3"]],
                "asks": [[8001.0, 0.4]],
                "timestamp": "20191012153300000"
            }),
        );
        let book = env.orderbook().unwrap();
        assert_eq!(book.best_bid(), Some(dec!(8000.5)));
        assert_eq!(book.best_ask(), Some(dec!(8001.0)));
        assert_eq!(book.bids[1].size, dec!(3));
        assert_eq!(book.spread(), Some(dec!(0.5)));
    }

    #[test]
    fn parses_trades() {
        let env = envelope(
            MarketDataKind::Trade,
            json!([[123, "20191012153300000", 8000.5, "buy", 0.3]]),
        );
        let trades = env.trades().unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, dec!(8000.5));
        assert_eq!(trades[0].size, dec!(0.3));
        assert_eq!(trades[0].side, "buy");
    }

    #[test]
    fn parses_kline_object_and_batch() {
        let obj = envelope(
            MarketDataKind::Kline,
            json!({"timestamp": "20191012153300000", "volume": 41.5}),
        );
        assert_eq!(obj.kline().unwrap().volume, dec!(41.5));

        let batch = envelope(
            MarketDataKind::Kline,
            json!([["20191012153200000", 1, 2, 3, 0.5, 10], ["20191012153300000", 1, 2, 3, 0.5, 12]]),
        );
        let bar = batch.kline().unwrap();
        assert_eq!(bar.timestamp, "20191012153300000");
        assert_eq!(bar.volume, dec!(12));
    }

    #[test]
    fn rejects_empty_book() {
        let env = envelope(MarketDataKind::Orderbook, json!({"bids": [], "asks": []}));
        assert!(env.orderbook().is_err());
    }
}
