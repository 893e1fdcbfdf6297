//! Message-bus boundary.
//!
//! The transport itself (redis, websocket, ...) is an external
//! collaborator; the engine only depends on the [`Bus`] trait. Channel
//! names follow `{scope}:{topic}`; instances running in test mode prepend
//! `Test` to trade and position channels so they land in the simulation
//! environment.

pub mod memory;
pub mod protocol;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::error::Result;

pub use memory::InMemoryBus;

/// One message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish/subscribe transport used by the coordinator and side services.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to a set of channels; messages from all of them arrive on
    /// the returned stream in publish order.
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::UnboundedReceiver<BusMessage>>;
}

/// Channel name construction for one task instance.
#[derive(Debug, Clone, Copy)]
pub struct ChannelPlan<'a> {
    cfg: &'a ChannelConfig,
    test_mode: bool,
}

impl<'a> ChannelPlan<'a> {
    pub fn new(cfg: &'a ChannelConfig, test_mode: bool) -> Self {
        Self { cfg, test_mode }
    }

    fn scoped(&self, scope: &str, topic: &str, test_routed: bool) -> String {
        if test_routed && self.test_mode {
            format!("Test{scope}:{topic}")
        } else {
            format!("{scope}:{topic}")
        }
    }

    pub fn trade_request(&self, strategy_name: &str) -> String {
        self.scoped(
            &self.cfg.trade_scope,
            &format!("{strategy_name}_request"),
            true,
        )
    }

    pub fn trade_response(&self, strategy_name: &str) -> String {
        self.scoped(
            &self.cfg.trade_scope,
            &format!("{strategy_name}_response"),
            true,
        )
    }

    pub fn balance_push(&self, exchange: &str, account: &str) -> String {
        self.scoped(
            &self.cfg.position_scope,
            &format!("{exchange}|{account}"),
            true,
        )
    }

    pub fn poll_position_request(&self) -> String {
        self.scoped(&self.cfg.position_scope, "Poll Position Request", true)
    }

    pub fn order_update_push(&self, exchange: &str, account: &str) -> String {
        self.scoped(
            &self.cfg.trade_scope,
            &format!("{exchange}|{account}"),
            false,
        )
    }

    pub fn order_update_subscribe_request(&self) -> String {
        self.scoped(&self.cfg.trade_scope, "Subscribe Order Update", false)
    }

    /// Orderbook snapshots, depth 20.
    pub fn market_orderbook(&self, exchange: &str, symbol: &str, contract_type: &str) -> String {
        self.scoped(
            &self.cfg.market_scope,
            &format!("{exchange}|{symbol}|{contract_type}|orderbook|20"),
            false,
        )
    }

    pub fn market_trade(&self, exchange: &str, symbol: &str, contract_type: &str) -> String {
        self.scoped(
            &self.cfg.market_scope,
            &format!("{exchange}|{symbol}|{contract_type}|trade"),
            false,
        )
    }

    /// One-minute klines.
    pub fn market_kline_1m(&self, exchange: &str, symbol: &str, contract_type: &str) -> String {
        self.scoped(
            &self.cfg.market_scope,
            &format!("{exchange}|{symbol}|{contract_type}|kline||1m"),
            false,
        )
    }

    pub fn market_subscribe_request(&self) -> String {
        self.scoped(&self.cfg.market_scope, "Subscribe Request", false)
    }

    pub fn alarm(&self) -> String {
        self.scoped(&self.cfg.alarm_scope, "strategy_alarm", false)
    }

    pub fn task_status(&self) -> String {
        self.cfg.task_status.clone()
    }

    pub fn task_command(&self) -> String {
        self.cfg.task_command.clone()
    }

    pub fn task_command_response(&self) -> String {
        self.cfg.task_command_response.clone()
    }

    pub fn notification(&self) -> String {
        self.cfg.notification.clone()
    }

    pub fn master_command(&self) -> String {
        self.cfg.master_command.clone()
    }

    pub fn master_command_response(&self) -> String {
        self.cfg.master_command_response.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_applies_to_trade_and_position_only() {
        let cfg = ChannelConfig::default();
        let live = ChannelPlan::new(&cfg, false);
        let test = ChannelPlan::new(&cfg, true);

        assert_eq!(live.trade_request("exec"), "Td:exec_request");
        assert_eq!(test.trade_request("exec"), "TestTd:exec_request");
        assert_eq!(
            test.balance_push("Binance", "trader1"),
            "TestPosition:Binance|trader1"
        );
        // market data stays on the live feed even in test mode
        assert_eq!(
            test.market_orderbook("Binance", "BTCUSDT", "spot"),
            "Md:Binance|BTCUSDT|spot|orderbook|20"
        );
        assert_eq!(
            test.market_kline_1m("Binance", "BTCUSDT", "spot"),
            "Md:Binance|BTCUSDT|spot|kline||1m"
        );
        assert_eq!(test.alarm(), "MM:strategy_alarm");
    }
}
