use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure.
///
/// Loaded once at process start and passed by reference; never mutated at
/// runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Scheduler tick interval driving every strategy's timer (seconds)
    pub timer_interval_secs: u64,
    /// Strategy name registered with the trading gateway
    pub strategy_name: String,
    /// Directory holding per-task order snapshot files
    pub orders_dir: String,
    pub channels: ChannelConfig,
    pub staleness: StalenessConfig,
    pub exchanges: ExchangeCapabilities,
    /// Hard cap on a single order's notional, keyed by quote currency
    pub max_size_by_quote: HashMap<String, Decimal>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus channel naming. Channels are `{scope}:{topic}`; instances in test
/// mode prepend `Test` to route into the simulation environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Market data scope
    pub market_scope: String,
    /// Trade request/response scope
    pub trade_scope: String,
    /// Balance / position push scope
    pub position_scope: String,
    /// UI-facing control scope
    pub ui_scope: String,
    /// Alarm scope
    pub alarm_scope: String,
    /// UI queue new tasks are popped from
    pub add_task_queue: String,
    /// Periodic task status push
    pub task_status: String,
    /// Task control commands (pause / resume / delete / oms_*)
    pub task_command: String,
    /// Command responses back to the UI
    pub task_command_response: String,
    /// UI notification channel (errors)
    pub notification: String,
    /// Side-service command channel
    pub master_command: String,
    /// Side-service command responses
    pub master_command_response: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            market_scope: "Md".to_string(),
            trade_scope: "Td".to_string(),
            position_scope: "Position".to_string(),
            ui_scope: "UI".to_string(),
            alarm_scope: "MM".to_string(),
            add_task_queue: "exec_add_task".to_string(),
            task_status: "exec_task_status".to_string(),
            task_command: "exec_task_command".to_string(),
            task_command_response: "exec_task_command_response".to_string(),
            notification: "exec_notification".to_string(),
            master_command: "exec_master_command".to_string(),
            master_command_response: "exec_master_command_response".to_string(),
        }
    }
}

/// Staleness windows for subscribed channels and tick freshness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    /// Market-data tick older than this is alarmed (seconds)
    pub tick_tolerance_secs: i64,
    /// Silence window before a market-data channel is considered lost
    pub market_data_secs: i64,
    /// Trade-tick channels trade rarely; they get a longer window
    pub trade_channel_secs: i64,
    /// Silence window for order-update push channels
    pub order_update_secs: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            tick_tolerance_secs: 3,
            market_data_secs: 60 * 5,
            trade_channel_secs: 60 * 60,
            order_update_secs: 60 * 5,
        }
    }
}

/// Static per-exchange capability flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeCapabilities {
    /// Exchanges pushing unsolicited order updates; active inspection is
    /// slowed down 20x for these
    pub order_update: HashMap<String, bool>,
    /// Exchanges whose balance is authoritative when derived from order
    /// responses rather than the exchange's own snapshot pushes
    pub balance_by_order_response: HashMap<String, bool>,
    /// Exchanges with kline feeds good enough for VWAP
    pub vwap_supported: Vec<String>,
}

impl Default for ExchangeCapabilities {
    fn default() -> Self {
        let on = |names: &[&str]| {
            names
                .iter()
                .map(|n| (n.to_string(), true))
                .collect::<HashMap<_, _>>()
        };
        Self {
            order_update: on(&["Binance", "Bitfinex", "OKcoin"]),
            balance_by_order_response: on(&["Binance", "Huobi", "Bitfinex", "OKcoin", "NewKucoin"]),
            vwap_supported: ["Binance", "Huobi", "Bitfinex", "Bittrex"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the per-task rolling log file; empty logs to stderr only
    #[serde(default)]
    pub dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: String::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let max_size_by_quote = [
            ("USD", 2000),
            ("USDT", 2000),
            ("TUSD", 2000),
            ("PAX", 2000),
            ("USDC", 2000),
            ("HT", 800),
            ("BNB", 100),
            ("ETH", 10),
            ("KRW", 2_000_000),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), Decimal::from(*v)))
        .chain(std::iter::once((
            "BTC".to_string(),
            Decimal::new(2, 1), // 0.2
        )))
        .collect();

        Self {
            timer_interval_secs: 3,
            strategy_name: "slicer_execution".to_string(),
            orders_dir: "orders".to_string(),
            channels: ChannelConfig::default(),
            staleness: StalenessConfig::default(),
            exchanges: ExchangeCapabilities::default(),
            max_size_by_quote,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Override with environment variables (SLICER_TIMER_INTERVAL_SECS, etc.)
            .add_source(
                Environment::with_prefix("SLICER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn order_update_enabled(&self, exchange: &str) -> bool {
        self.exchanges
            .order_update
            .get(exchange)
            .copied()
            .unwrap_or(false)
    }

    pub fn balance_by_order_response(&self, exchange: &str) -> bool {
        self.exchanges
            .balance_by_order_response
            .get(exchange)
            .copied()
            .unwrap_or(false)
    }

    pub fn vwap_supported(&self, exchange: &str) -> bool {
        self.exchanges.vwap_supported.iter().any(|e| e == exchange)
    }

    /// Max single-order size expressed in the given quote currency.
    /// Unknown quote currencies have no cap.
    pub fn max_size_by_quote(&self, quote: &str) -> Option<Decimal> {
        self.max_size_by_quote.get(quote).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.timer_interval_secs, 3);
        assert!(cfg.order_update_enabled("Binance"));
        assert!(!cfg.order_update_enabled("Bittrex"));
        assert!(cfg.balance_by_order_response("Huobi"));
        assert!(cfg.vwap_supported("Bitfinex"));
        assert_eq!(
            cfg.max_size_by_quote("BTC"),
            Some(Decimal::new(2, 1))
        );
        assert_eq!(cfg.max_size_by_quote("DOGE"), None);
    }
}
