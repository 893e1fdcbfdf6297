use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::AppConfig;
use crate::domain::order::Direction;
use crate::error::{Result, SlicerError};
use crate::util::time::parse_window_time;

/// Execution algorithms available to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmKind {
    #[serde(rename = "TWAP")]
    Twap,
    #[serde(rename = "VWAP")]
    Vwap,
    #[serde(rename = "ICEBERG")]
    Iceberg,
    #[serde(rename = "T-TWAP")]
    TriangleTwap,
    #[serde(rename = "T-ICEBERG")]
    TriangleIceberg,
}

impl AlgorithmKind {
    pub fn is_triangle(&self) -> bool {
        matches!(
            self,
            AlgorithmKind::TriangleTwap | AlgorithmKind::TriangleIceberg
        )
    }

    pub fn is_twap_family(&self) -> bool {
        matches!(self, AlgorithmKind::Twap | AlgorithmKind::TriangleTwap)
    }
}

/// Whether the task size is counted in the base or the quote currency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrencyType {
    #[default]
    Base,
    Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeRole {
    Maker,
    Taker,
    Both,
    #[serde(rename = "None")]
    Neither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Passive,
    Aggressive,
}

/// VWAP sizing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VwapOrderMode {
    /// Track a projected total market volume over the task window
    TimeBased,
    /// Participate at a fixed ratio of last-minute market volume
    Participation,
}

/// Task / strategy lifecycle status as reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Warning,
    Error,
    Deleted,
    Finished,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Warning => "warning",
            TaskStatus::Error => "error",
            TaskStatus::Deleted => "deleted",
            TaskStatus::Finished => "finished",
        }
    }
}

/// Alarm codes understood by the external alerting collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCode {
    DataOutdated,
    DataUnreceived,
    OrderResponseException,
    ExecuteAbnormal,
    DealSizeStalled,
}

impl AlarmCode {
    pub fn code(&self) -> &'static str {
        match self {
            AlarmCode::DataOutdated => "050003",
            AlarmCode::DataUnreceived => "050004",
            AlarmCode::OrderResponseException => "050005",
            AlarmCode::ExecuteAbnormal => "050006",
            AlarmCode::DealSizeStalled => "080001",
        }
    }
}

/// `[pair, base, quote]`, e.g. `["BTCUSDT", "BTC", "USDT"]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTriple(pub String, pub String, pub String);

impl SymbolTriple {
    pub fn pair(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        &self.1
    }

    pub fn quote(&self) -> &str {
        &self.2
    }

    pub fn contains_currency(&self, currency: &str) -> bool {
        self.1 == currency || self.2 == currency
    }

    /// The currency this triple shares with `other`, if any.
    pub fn shared_currency(&self, other: &SymbolTriple) -> Option<&str> {
        if other.contains_currency(self.base()) {
            Some(self.base())
        } else if other.contains_currency(self.quote()) {
            Some(self.quote())
        } else {
            None
        }
    }
}

/// Per-pair trading rules published by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRule {
    pub base_min_order_size: Decimal,
    pub quote_min_order_size: Decimal,
    pub price_precision: Decimal,
    pub size_precision: Decimal,
}

/// One strategy entry of a task.
///
/// The fields below `-- resolved --` are inherited from the enclosing task
/// during `Task::resolve` and are not part of the submitted entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub algorithm: AlgorithmKind,
    pub exchange: String,
    pub account: String,
    pub symbol: SymbolTriple,
    #[serde(default)]
    pub median: Option<SymbolTriple>,
    #[serde(default)]
    pub anchor: Option<SymbolTriple>,
    pub direction: Direction,
    pub currency_type: CurrencyType,
    pub total_size: Decimal,
    pub price_threshold: Option<Decimal>,
    #[serde(default)]
    pub anchor_price: Option<Decimal>,
    #[serde(default)]
    pub transfer_coin: bool,
    pub execution_mode: ExecutionMode,
    pub exchange_fee: Decimal,
    #[serde(default)]
    pub service_fee: Option<Decimal>,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub trade_role: Option<TradeRole>,
    /// VWAP: sizing mode
    #[serde(default)]
    pub order_mode: Option<VwapOrderMode>,
    /// VWAP participation mode: fraction of market volume to take
    #[serde(default)]
    pub fill_ratio: Option<Decimal>,
    /// VWAP time-based mode: historical average minute volume supplied by
    /// the submitting UI
    #[serde(default)]
    pub reference_minute_volume: Option<Decimal>,
    /// TWAP: fixed part of the slice interval (ms)
    #[serde(default)]
    pub fixed_interval_ms: Option<u64>,
    /// TWAP: random part of the slice interval (ms)
    #[serde(default)]
    pub random_interval_ms: Option<u64>,
    /// Cumulative-depth filter applied to the top of book before pricing
    #[serde(default)]
    pub orderbook_threshold: Option<Decimal>,

    // -- resolved --
    #[serde(default)]
    pub strategy_id: String,
    #[serde(default)]
    pub initial_balance: HashMap<String, Decimal>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub coin_config: HashMap<String, PairRule>,
}

impl StrategyParams {
    pub fn exch_account(&self) -> String {
        format!("{}|{}", self.exchange, self.account)
    }

    pub fn contract_type(&self) -> &str {
        self.contract_type.as_deref().unwrap_or("spot")
    }

    pub fn trade_role(&self) -> TradeRole {
        self.trade_role.unwrap_or(TradeRole::Taker)
    }

    /// The symbol / median / anchor triple matching a pair name.
    pub fn triple_for(&self, pair: &str) -> Option<&SymbolTriple> {
        if self.symbol.pair() == pair {
            return Some(&self.symbol);
        }
        if let Some(median) = &self.median {
            if median.pair() == pair {
                return Some(median);
            }
        }
        if let Some(anchor) = &self.anchor {
            if anchor.pair() == pair {
                return Some(anchor);
            }
        }
        None
    }

    pub fn pair_rule(&self, pair: &str) -> Option<&PairRule> {
        self.coin_config.get(pair)
    }

    pub fn initial_balance_of(&self, currency: &str) -> Decimal {
        self.initial_balance.get(currency).copied().unwrap_or_default()
    }

    /// The currency common to the two legs of a triangular trade.
    pub fn mid_coin(&self) -> Option<&str> {
        let median = self.median.as_ref()?;
        for currency in [median.base(), median.quote()] {
            if !self.symbol.contains_currency(currency) {
                return Some(currency);
            }
        }
        None
    }

    /// Direction of a leg (median or anchor) relative to the task direction.
    /// A leg whose pair is "crossed" against the main symbol trades the
    /// opposite way.
    pub fn leg_direction(&self, leg: &SymbolTriple) -> Direction {
        let crossed = self.symbol.base() == leg.quote() || self.symbol.quote() == leg.base();
        if crossed {
            self.direction.opposite()
        } else {
            self.direction
        }
    }

    fn invalid(msg: impl Into<String>) -> SlicerError {
        SlicerError::Validation(msg.into())
    }

    /// Check the parameter set, mirroring the gateway-side submission rules.
    pub fn validate(&self, cfg: &AppConfig) -> Result<()> {
        if self.strategy_id.is_empty() {
            return Err(Self::invalid("strategy_id is empty"));
        }
        if self.exchange.is_empty() {
            return Err(Self::invalid("exchange is empty"));
        }
        if self.account.is_empty() {
            return Err(Self::invalid("account is empty"));
        }
        for (currency, amount) in &self.initial_balance {
            if *amount < Decimal::ZERO {
                return Err(Self::invalid(format!(
                    "initial_balance {currency} value error: {amount}"
                )));
            }
        }
        if self.trade_role() == TradeRole::Maker && self.execution_mode == ExecutionMode::Aggressive
        {
            return Err(Self::invalid(
                "when execution_mode is Aggressive, trade_role can't be Maker",
            ));
        }
        if self.total_size <= Decimal::ZERO {
            return Err(Self::invalid(format!(
                "total_size value error: {}",
                self.total_size
            )));
        }
        if let Some(anchor_price) = self.anchor_price {
            if self.price_threshold.is_some() {
                return Err(Self::invalid(
                    "anchor_price and price_threshold can only be set one",
                ));
            }
            if anchor_price < Decimal::ZERO {
                return Err(Self::invalid(format!(
                    "anchor_price value error: {anchor_price}"
                )));
            }
        }
        if let Some(threshold) = self.price_threshold {
            if threshold < Decimal::ZERO {
                return Err(Self::invalid(format!(
                    "price_threshold value error: {threshold}"
                )));
            }
        }
        if self.exchange_fee < Decimal::ZERO {
            return Err(Self::invalid(format!(
                "exchange_fee value error: {}",
                self.exchange_fee
            )));
        }
        for (pair, rule) in &self.coin_config {
            if rule.base_min_order_size < Decimal::ZERO
                || rule.quote_min_order_size < Decimal::ZERO
                || rule.price_precision < Decimal::ZERO
                || rule.size_precision < Decimal::ZERO
            {
                return Err(Self::invalid(format!("{pair} pair rule value error")));
            }
        }
        if self.pair_rule(self.symbol.pair()).is_none() {
            return Err(Self::invalid(format!(
                "no pair rule for {}",
                self.symbol.pair()
            )));
        }

        // the initial balance must cover the full size where the sold
        // currency is the one being counted
        if self.direction == Direction::Sell && self.currency_type == CurrencyType::Base {
            let held = self.initial_balance_of(self.symbol.base());
            if held < self.total_size {
                return Err(Self::invalid(format!(
                    "{} initial_balance {held} should cover total_size {}",
                    self.symbol.base(),
                    self.total_size
                )));
            }
        }
        if self.direction == Direction::Buy && self.currency_type == CurrencyType::Quote {
            let held = self.initial_balance_of(self.symbol.quote());
            if held < self.total_size {
                return Err(Self::invalid(format!(
                    "{} initial_balance {held} should cover total_size {}",
                    self.symbol.quote(),
                    self.total_size
                )));
            }
        }

        match self.algorithm {
            AlgorithmKind::Twap | AlgorithmKind::TriangleTwap => {
                let start = self
                    .start_time
                    .as_deref()
                    .ok_or_else(|| Self::invalid("start_time is required"))?;
                let end = self
                    .end_time
                    .as_deref()
                    .ok_or_else(|| Self::invalid("end_time is required"))?;
                let (start, end) = match (parse_window_time(start), parse_window_time(end)) {
                    (Some(s), Some(e)) => (s, e),
                    _ => return Err(Self::invalid("task window does not parse")),
                };
                if start > end {
                    return Err(Self::invalid(format!(
                        "start_time {start} should be before end_time {end}"
                    )));
                }
            }
            AlgorithmKind::Iceberg | AlgorithmKind::TriangleIceberg => {
                let start = self
                    .start_time
                    .as_deref()
                    .ok_or_else(|| Self::invalid("start_time is required"))?;
                if parse_window_time(start).is_none() {
                    return Err(Self::invalid(format!("start_time value error: {start}")));
                }
            }
            AlgorithmKind::Vwap => {
                if !cfg.vwap_supported(&self.exchange) {
                    return Err(Self::invalid(format!(
                        "VWAP does not support exchange {} yet",
                        self.exchange
                    )));
                }
            }
        }

        if self.algorithm.is_triangle() {
            let (median, anchor) = match (&self.median, &self.anchor) {
                (Some(m), Some(a)) => (m, a),
                _ => {
                    return Err(Self::invalid(
                        "triangle algorithms need median and anchor legs",
                    ))
                }
            };
            if self.symbol.pair() == median.pair()
                || self.symbol.pair() == anchor.pair()
                || median.pair() == anchor.pair()
            {
                return Err(Self::invalid("median or anchor leg config error"));
            }
            if self.symbol.shared_currency(median).is_none()
                || self.symbol.shared_currency(anchor).is_none()
            {
                return Err(Self::invalid("median or anchor leg config error"));
            }
            if self.mid_coin().is_none() {
                return Err(Self::invalid("mid coin cannot be inferred"));
            }
        }

        Ok(())
    }
}

/// One execution job, submitted externally and owned by a coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Per `exchange|account` initial holdings
    pub initial_balance: HashMap<String, HashMap<String, Decimal>>,
    pub strategies: HashMap<String, StrategyParams>,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    /// Per exchange, per pair trading rules
    pub coin_config: HashMap<String, HashMap<String, PairRule>>,
    pub trade_role: TradeRole,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub alarm: bool,
    #[serde(default)]
    pub test_mode: bool,
}

impl Task {
    /// Propagate task-level fields into each strategy entry and validate
    /// the result. Must run before the coordinator touches the task.
    pub fn resolve(&mut self, cfg: &AppConfig) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(SlicerError::Validation("task_id is empty".into()));
        }
        let start_time = self.start_time.clone();
        let end_time = self.end_time.clone();
        let trade_role = self.trade_role;
        let test_mode = self.test_mode;
        let customer_id = self.customer_id.clone();

        for (strategy_id, entry) in self.strategies.iter_mut() {
            entry.strategy_id = strategy_id.clone();
            entry.test_mode = test_mode;
            entry.customer_id = customer_id.clone();
            let exch_acc = entry.exch_account();
            entry.initial_balance = self
                .initial_balance
                .get(&exch_acc)
                .cloned()
                .ok_or_else(|| {
                    SlicerError::Validation(format!("no initial balance for {exch_acc}"))
                })?;
            entry.coin_config = self
                .coin_config
                .get(&entry.exchange)
                .cloned()
                .unwrap_or_default();
            if entry.start_time.is_none() {
                entry.start_time = Some(start_time.clone());
            }
            if entry.end_time.is_none() {
                entry.end_time = end_time.clone();
            }
            if entry.trade_role.is_none() {
                entry.trade_role = Some(trade_role);
            }
            entry.validate(cfg).map_err(|e| {
                SlicerError::Validation(format!("{strategy_id}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_params() -> StrategyParams {
        let mut coin_config = HashMap::new();
        coin_config.insert(
            "BTCUSDT".to_string(),
            PairRule {
                base_min_order_size: dec!(0.01),
                quote_min_order_size: Decimal::ZERO,
                price_precision: dec!(0.01),
                size_precision: dec!(0.001),
            },
        );
        let mut initial_balance = HashMap::new();
        initial_balance.insert("BTC".to_string(), dec!(100));
        initial_balance.insert("USDT".to_string(), dec!(0));
        StrategyParams {
            algorithm: AlgorithmKind::Twap,
            exchange: "Binance".to_string(),
            account: "trader1".to_string(),
            symbol: SymbolTriple("BTCUSDT".into(), "BTC".into(), "USDT".into()),
            median: None,
            anchor: None,
            direction: Direction::Sell,
            currency_type: CurrencyType::Base,
            total_size: dec!(10),
            price_threshold: None,
            anchor_price: None,
            transfer_coin: false,
            execution_mode: ExecutionMode::Passive,
            exchange_fee: dec!(0.001),
            service_fee: None,
            contract_type: None,
            start_time: Some("2019-06-28 00:00:00".to_string()),
            end_time: Some("2019-06-29 00:00:00".to_string()),
            trade_role: Some(TradeRole::Taker),
            order_mode: None,
            fill_ratio: None,
            reference_minute_volume: None,
            fixed_interval_ms: None,
            random_interval_ms: None,
            orderbook_threshold: None,
            strategy_id: "TWAP_Binance_BTCUSDT_20190725152929".to_string(),
            initial_balance,
            test_mode: true,
            customer_id: "cust".to_string(),
            coin_config,
        }
    }

    #[test]
    fn valid_params_pass() {
        let cfg = AppConfig::default();
        sample_params().validate(&cfg).unwrap();
    }

    #[test]
    fn rejects_maker_aggressive() {
        let cfg = AppConfig::default();
        let mut p = sample_params();
        p.trade_role = Some(TradeRole::Maker);
        p.execution_mode = ExecutionMode::Aggressive;
        assert!(p.validate(&cfg).is_err());
    }

    #[test]
    fn rejects_insufficient_initial_balance() {
        let cfg = AppConfig::default();
        let mut p = sample_params();
        p.total_size = dec!(1000);
        assert!(p.validate(&cfg).is_err());
    }

    #[test]
    fn rejects_threshold_and_anchor_price_together() {
        let cfg = AppConfig::default();
        let mut p = sample_params();
        p.price_threshold = Some(dec!(100));
        p.anchor_price = Some(dec!(1));
        assert!(p.validate(&cfg).is_err());
    }

    #[test]
    fn rejects_inverted_window() {
        let cfg = AppConfig::default();
        let mut p = sample_params();
        p.start_time = Some("2019-06-29 00:00:00".to_string());
        p.end_time = Some("2019-06-28 00:00:00".to_string());
        assert!(p.validate(&cfg).is_err());
    }

    #[test]
    fn mid_coin_inference() {
        let mut p = sample_params();
        p.algorithm = AlgorithmKind::TriangleTwap;
        p.symbol = SymbolTriple("BTCUSDT".into(), "BTC".into(), "USDT".into());
        p.median = Some(SymbolTriple("BTCEOS".into(), "BTC".into(), "EOS".into()));
        p.anchor = Some(SymbolTriple("EOSUSDT".into(), "EOS".into(), "USDT".into()));
        assert_eq!(p.mid_coin(), Some("EOS"));
    }

    #[test]
    fn leg_direction_flips_on_crossed_pairs() {
        let mut p = sample_params();
        p.direction = Direction::Buy;
        p.symbol = SymbolTriple("BTCUSDT".into(), "BTC".into(), "USDT".into());
        // median BTCEOS shares BTC with symbol base: same direction
        let median = SymbolTriple("BTCEOS".into(), "BTC".into(), "EOS".into());
        assert_eq!(p.leg_direction(&median), Direction::Buy);
        // anchor EOSUSDT: quote USDT matches symbol quote: same direction
        let anchor = SymbolTriple("EOSUSDT".into(), "EOS".into(), "USDT".into());
        assert_eq!(p.leg_direction(&anchor), Direction::Buy);
        // a leg quoted in the symbol's base trades the opposite way
        let crossed = SymbolTriple("EOSBTC".into(), "EOS".into(), "BTC".into());
        assert_eq!(p.leg_direction(&crossed), Direction::Sell);
    }
}
