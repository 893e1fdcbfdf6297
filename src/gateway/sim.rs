//! Simulated trading gateway.
//!
//! Accepts orders on the test trade channel, fills them randomly, and
//! answers send/cancel/inspect requests in the gateway's response shape.
//! Accounts start with a generous balance in every known currency and
//! are pushed periodically like the real position feed.

use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::protocol::TradeRequest;
use crate::bus::{Bus, ChannelPlan};
use crate::config::AppConfig;
use crate::domain::{Direction, OrderAction, OrderStatus, StrategyParams};
use crate::error::Result;
use crate::util::time::now_bus_timestamp;

const INITIAL_BALANCE: i64 = 1_000_000;

#[derive(Debug, Clone)]
struct SimOrder {
    exchange: String,
    symbol: String,
    contract_type: String,
    account_id: String,
    direction: Direction,
    price: Decimal,
    quantity: Decimal,
    filled: Decimal,
    status: OrderStatus,
}

pub struct SimGateway {
    cfg: Arc<AppConfig>,
    /// exchange -> account -> currency -> free balance
    balances: HashMap<String, HashMap<String, HashMap<String, Decimal>>>,
    orders: HashMap<String, SimOrder>,
    /// pair -> (base, quote)
    contracts: HashMap<String, (String, String)>,
}

impl SimGateway {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        Self {
            cfg,
            balances: HashMap::new(),
            orders: HashMap::new(),
            contracts: HashMap::new(),
        }
    }

    fn init_balance(&mut self, exchange: &str, account: &str) {
        let account_balance = self
            .balances
            .entry(exchange.to_string())
            .or_default()
            .entry(account.to_string())
            .or_default();
        let mut currencies: Vec<String> = Vec::new();
        for (base, quote) in self.contracts.values() {
            currencies.push(base.clone());
            currencies.push(quote.clone());
        }
        for currency in currencies {
            account_balance
                .entry(currency)
                .or_insert_with(|| Decimal::from(INITIAL_BALANCE));
        }
    }

    fn register_task(&mut self, params: &StrategyParams) {
        for triple in [Some(&params.symbol), params.median.as_ref(), params.anchor.as_ref()]
            .into_iter()
            .flatten()
        {
            self.contracts.insert(
                triple.pair().to_string(),
                (triple.base().to_string(), triple.quote().to_string()),
            );
        }
        self.init_balance(&params.exchange, &params.account);
    }

    fn random_filled(&mut self, order_id: &str) -> Decimal {
        let Some(order) = self.orders.get_mut(order_id) else {
            return Decimal::ZERO;
        };
        let already = order.filled;
        let roll: f64 = rand::thread_rng().gen();
        let mut filled = (Decimal::from_f64(roll).unwrap_or_default() * order.quantity)
            .round_dp(4);
        if filled + already > order.quantity * Decimal::new(5, 1) {
            filled = order.quantity - already;
        }
        order.filled = already + filled;
        order.status = if order.filled == order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let order = order.clone();
        if let Some((base, quote)) = self.contracts.get(&order.symbol).cloned() {
            if let Some(balance) = self
                .balances
                .get_mut(&order.exchange)
                .and_then(|b| b.get_mut(&order.account_id))
            {
                match order.direction {
                    Direction::Buy => {
                        *balance.entry(base).or_default() += filled;
                        *balance.entry(quote).or_default() -= filled * order.price;
                    }
                    Direction::Sell => {
                        *balance.entry(base).or_default() -= filled;
                        *balance.entry(quote).or_default() += filled * order.price;
                    }
                }
            }
        }
        order.filled
    }

    fn has_balance(&mut self, order: &SimOrder) -> bool {
        if self
            .balances
            .get(&order.exchange)
            .and_then(|b| b.get(&order.account_id))
            .is_none()
        {
            self.init_balance(&order.exchange, &order.account_id);
        }
        let Some((base, quote)) = self.contracts.get(&order.symbol) else {
            return false;
        };
        let Some(balance) = self
            .balances
            .get(&order.exchange)
            .and_then(|b| b.get(&order.account_id))
        else {
            return false;
        };
        match order.direction {
            Direction::Buy => {
                balance.get(quote).copied().unwrap_or_default()
                    >= order.quantity * order.price
            }
            Direction::Sell => {
                balance.get(base).copied().unwrap_or_default() >= order.quantity
            }
        }
    }

    fn order_from_request(metadata: &Value) -> Option<SimOrder> {
        let direction: Direction =
            serde_json::from_value(metadata.get("direction")?.clone()).ok()?;
        Some(SimOrder {
            exchange: metadata.get("exchange")?.as_str()?.to_string(),
            symbol: metadata.get("symbol")?.as_str()?.to_string(),
            contract_type: metadata
                .get("contract_type")
                .and_then(Value::as_str)
                .unwrap_or("spot")
                .to_string(),
            account_id: metadata.get("account_id")?.as_str()?.to_string(),
            direction,
            price: serde_json::from_value(metadata.get("price")?.clone()).ok()?,
            quantity: serde_json::from_value(metadata.get("quantity")?.clone()).ok()?,
            filled: Decimal::ZERO,
            status: OrderStatus::Submitted,
        })
    }

    /// Answer one trade request; returns the response body to publish.
    fn match_engine(&mut self, request: &TradeRequest) -> Option<Value> {
        let timestamp = now_bus_timestamp();
        let mut body = json!({
            "timestamp": timestamp,
        });

        match request.action {
            OrderAction::Send => {
                let Some(order) = Self::order_from_request(&request.metadata) else {
                    warn!("malformed send request");
                    return None;
                };
                body["exchange"] = json!(order.exchange);
                body["symbol"] = json!(order.symbol);
                body["contract_type"] = json!(order.contract_type);
                body["event"] = json!("place_order");
                if self.has_balance(&order) {
                    let order_id = Uuid::new_v4().to_string();
                    self.orders.insert(order_id.clone(), order.clone());
                    self.random_filled(&order_id);
                    body["metadata"] = json!({
                        "result": true,
                        "account_id": order.account_id,
                        "order_id": order_id,
                    });
                } else {
                    body["metadata"] = json!({
                        "result": false,
                        "account_id": order.account_id,
                        "error_code": "999999",
                        "error_code_msg": "Available balance is not enough",
                    });
                }
            }

            OrderAction::Cancel => {
                let order_id = request
                    .metadata
                    .get("order_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(order) = self.orders.get_mut(&order_id) else {
                    return None;
                };
                if !order.status.is_terminal() {
                    order.status = OrderStatus::Cancelled;
                }
                body["exchange"] = json!(order.exchange);
                body["symbol"] = json!(order.symbol);
                body["contract_type"] = json!(order.contract_type);
                body["event"] = json!("cancel_order");
                body["metadata"] = json!({
                    "result": true,
                    "account_id": order.account_id,
                    "order_id": order_id,
                });
            }

            OrderAction::Inspect => {
                let order_id = request
                    .metadata
                    .get("order_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(order) = self.orders.get(&order_id).cloned() else {
                    return None;
                };
                body["exchange"] = json!(order.exchange);
                body["symbol"] = json!(order.symbol);
                body["contract_type"] = json!(order.contract_type);
                body["event"] = json!("inspect_order");
                body["metadata"] = json!({
                    "result": true,
                    "account_id": order.account_id,
                    "order_id": order_id,
                });
                body["order_info"] = json!({
                    "original_amount": order.quantity,
                    "filled": order.filled,
                    "status": order.status,
                    "avg_executed_price": order.price,
                });
                // keep partially filled orders trading
                if order.filled < order.quantity && order.status != OrderStatus::Cancelled {
                    self.random_filled(&order_id);
                }
            }

            OrderAction::QueryBalance => {
                let exchange = request
                    .metadata
                    .get("exchange")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let account = request
                    .metadata
                    .get("account_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if self
                    .balances
                    .get(&exchange)
                    .and_then(|b| b.get(&account))
                    .is_none()
                {
                    self.init_balance(&exchange, &account);
                }
                let mut answer = serde_json::Map::new();
                if let Some(currencies) =
                    self.balances.get(&exchange).and_then(|b| b.get(&account))
                {
                    for (currency, amount) in currencies {
                        answer.insert(
                            currency.clone(),
                            json!({
                                "available": amount,
                                "total": amount,
                                "reserved": 0,
                                "shortable": 0,
                            }),
                        );
                    }
                }
                answer.insert("result".to_string(), json!(true));
                answer.insert("account_id".to_string(), json!(account));
                body["event"] = json!("query_balance");
                body["metadata"] = Value::Object(answer);
            }

            other => {
                debug!(?other, "request not simulated");
                return None;
            }
        }
        Some(body)
    }

    async fn push_balances(&self, bus: &dyn Bus, plan: &ChannelPlan<'_>) -> Result<()> {
        for (exchange, accounts) in &self.balances {
            for (account, currencies) in accounts {
                let mut spot = serde_json::Map::new();
                for (currency, amount) in currencies {
                    spot.insert(
                        currency.clone(),
                        json!({
                            "available": amount,
                            "total": amount,
                            "reserved": 0,
                            "shortable": 0,
                        }),
                    );
                }
                spot.insert("result".to_string(), json!(true));
                spot.insert("account_id".to_string(), json!(account));
                let payload = json!({
                    "exchange": exchange,
                    "account_id": account,
                    "global_balances": { "spot_balance": Value::Object(spot) },
                });
                bus.publish(
                    &plan.balance_push(exchange, account),
                    payload.to_string(),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Serve the simulation channels until the process ends.
    pub async fn run(mut self, bus: Arc<dyn Bus>) -> Result<()> {
        let cfg = self.cfg.clone();
        let plan = ChannelPlan::new(&cfg.channels, true);
        let trade_request = plan.trade_request(&cfg.strategy_name);
        let trade_response = plan.trade_response(&cfg.strategy_name);
        let poll_position = plan.poll_position_request();
        let mut stream = bus
            .subscribe(&[trade_request.clone(), poll_position.clone()])
            .await?;
        let mut balance_tick = tokio::time::interval(Duration::from_secs(3));

        loop {
            tokio::select! {
                maybe = stream.recv() => {
                    let Some(msg) = maybe else { return Ok(()) };
                    if msg.channel == poll_position {
                        match serde_json::from_str::<StrategyParams>(&msg.payload) {
                            Ok(params) => self.register_task(&params),
                            Err(e) => debug!(error = %e, "poll request ignored"),
                        }
                        continue;
                    }
                    let request: TradeRequest = match serde_json::from_str(&msg.payload) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "unparseable trade request");
                            continue;
                        }
                    };
                    if let Some(mut body) = self.match_engine(&request) {
                        body["request"] = serde_json::to_value(&request)?;
                        let response = json!({
                            "ref_id": request.ref_id,
                            "action": request.action,
                            "strategy": request.strategy,
                            "metadata": body,
                        });
                        bus.publish(&trade_response, response.to_string()).await?;
                    }
                }
                _ = balance_tick.tick() => {
                    self.push_balances(bus.as_ref(), &plan).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sim_order(direction: Direction) -> SimOrder {
        SimOrder {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            contract_type: "spot".to_string(),
            account_id: "trader1".to_string(),
            direction,
            price: dec!(100),
            quantity: dec!(2),
            filled: Decimal::ZERO,
            status: OrderStatus::Submitted,
        }
    }

    #[test]
    fn fills_never_exceed_quantity() {
        let mut gateway = SimGateway::new(Arc::new(AppConfig::default()));
        gateway
            .contracts
            .insert("BTCUSDT".to_string(), ("BTC".to_string(), "USDT".to_string()));
        gateway.init_balance("Binance", "trader1");
        gateway
            .orders
            .insert("o1".to_string(), sim_order(Direction::Buy));
        for _ in 0..50 {
            let filled = gateway.random_filled("o1");
            assert!(filled <= dec!(2));
            if gateway.orders["o1"].status == OrderStatus::Filled {
                break;
            }
        }
    }

    #[test]
    fn rejects_without_balance() {
        let mut gateway = SimGateway::new(Arc::new(AppConfig::default()));
        gateway
            .contracts
            .insert("BTCUSDT".to_string(), ("BTC".to_string(), "USDT".to_string()));
        gateway.init_balance("Binance", "trader1");
        let mut order = sim_order(Direction::Buy);
        order.quantity = Decimal::from(INITIAL_BALANCE); // notional far beyond holdings
        assert!(!gateway.has_balance(&order));
        let small = sim_order(Direction::Sell);
        assert!(gateway.has_balance(&small));
    }
}
