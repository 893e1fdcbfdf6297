//! Synthetic market data for the simulation environment.
//!
//! Listens for subscription requests and publishes random-walk
//! orderbooks, occasional trades, and one-minute klines on the requested
//! channels, in the live wire shapes.

use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::{Bus, ChannelPlan};
use crate::config::AppConfig;
use crate::error::Result;
use crate::util::time::now_bus_timestamp;

#[derive(Debug, Clone)]
struct FeedTopic {
    exchange: String,
    symbol: String,
    contract_type: String,
    kind: String,
}

fn parse_topic(topic: &str) -> Option<FeedTopic> {
    let parts: Vec<&str> = topic.split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    Some(FeedTopic {
        exchange: parts[0].to_string(),
        symbol: parts[1].to_string(),
        contract_type: parts[2].to_string(),
        kind: parts[3].to_string(),
    })
}

pub struct SimFeed {
    cfg: Arc<AppConfig>,
    topics: HashMap<String, FeedTopic>,
    /// Random-walk mid price per symbol
    mids: HashMap<String, f64>,
}

impl SimFeed {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        Self {
            cfg,
            topics: HashMap::new(),
            mids: HashMap::new(),
        }
    }

    fn mid_for(&mut self, symbol: &str) -> f64 {
        let mid = self.mids.entry(symbol.to_string()).or_insert(100.0);
        let step: f64 = rand::thread_rng().gen_range(-0.001..0.001);
        *mid *= 1.0 + step;
        *mid
    }

    async fn publish_tick(&mut self, bus: &dyn Bus) -> Result<()> {
        let scope = self.cfg.channels.market_scope.clone();
        let topics: Vec<(String, FeedTopic)> = self
            .topics
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (topic, meta) in topics {
            let mid = self.mid_for(&meta.symbol);
            let timestamp = now_bus_timestamp();
            let price = |offset: f64| {
                Decimal::from_f64(mid * (1.0 + offset))
                    .unwrap_or_default()
                    .round_dp(2)
            };
            let size = |scale: f64| {
                Decimal::from_f64(rand::thread_rng().gen_range(0.5..5.0) * scale)
                    .unwrap_or_default()
                    .round_dp(4)
            };
            let payload = match meta.kind.as_str() {
                "orderbook" => json!({
                    "exchange": meta.exchange,
                    "symbol": meta.symbol,
                    "contract_type": meta.contract_type,
                    "data_type": "orderbook",
                    "metadata": {
                        "bids": [
                            [price(-0.0005), size(1.0)],
                            [price(-0.0015), size(2.0)],
                            [price(-0.0025), size(3.0)],
                        ],
                        "asks": [
                            [price(0.0005), size(1.0)],
                            [price(0.0015), size(2.0)],
                            [price(0.0025), size(3.0)],
                        ],
                        "timestamp": timestamp,
                    },
                    "timestamp": timestamp,
                }),
                "trade" => json!({
                    "exchange": meta.exchange,
                    "symbol": meta.symbol,
                    "contract_type": meta.contract_type,
                    "data_type": "trade",
                    "metadata": [
                        ["t1", timestamp, price(0.0), "buy", size(0.5)],
                    ],
                    "timestamp": timestamp,
                }),
                "kline" => json!({
                    "exchange": meta.exchange,
                    "symbol": meta.symbol,
                    "contract_type": meta.contract_type,
                    "data_type": "kline",
                    "metadata": {
                        "timestamp": timestamp,
                        "open": price(0.0),
                        "close": price(0.0),
                        "high": price(0.001),
                        "low": price(-0.001),
                        "volume": size(20.0),
                    },
                    "range": "1m",
                    "timestamp": timestamp,
                }),
                _ => continue,
            };
            let channel = format!("{scope}:{topic}");
            bus.publish(&channel, payload.to_string()).await?;
        }
        Ok(())
    }

    pub async fn run(mut self, bus: Arc<dyn Bus>) -> Result<()> {
        let cfg = self.cfg.clone();
        let plan = ChannelPlan::new(&cfg.channels, true);
        let subscribe_request = plan.market_subscribe_request();
        let mut stream = bus.subscribe(&[subscribe_request]).await?;
        let mut ticker = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                maybe = stream.recv() => {
                    let Some(msg) = maybe else { return Ok(()) };
                    match serde_json::from_str::<Vec<String>>(&msg.payload) {
                        Ok(requested) => {
                            for topic in requested {
                                if let Some(meta) = parse_topic(&topic) {
                                    info!(%topic, "feeding synthetic market data");
                                    self.topics.insert(topic, meta);
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "subscribe request ignored"),
                    }
                }
                _ = ticker.tick() => self.publish_tick(bus.as_ref()).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_topics() {
        let topic = parse_topic("Binance|BTCUSDT|spot|orderbook|20").unwrap();
        assert_eq!(topic.exchange, "Binance");
        assert_eq!(topic.symbol, "BTCUSDT");
        assert_eq!(topic.kind, "orderbook");
        assert!(parse_topic("bad").is_none());
    }
}
