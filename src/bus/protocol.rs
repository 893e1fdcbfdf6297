//! Wire envelopes exchanged with the trading gateway.
//!
//! Gateways are not consistent about numeric types: ids and error codes
//! arrive as numbers or strings, and order fields can be the literal
//! `"unknown"`. Deserialization is tolerant; missing data becomes `None`
//! and the caller decides.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::domain::{Order, OrderAction, OrderStatus};
use crate::ledger::BalanceRecord;

fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(de)?;
    Ok(match v {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn opt_string_or_number<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(v.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    }))
}

fn opt_decimal_tolerant<'de, D>(de: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(v.as_ref().and_then(|v| match v {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }))
}

fn opt_status_tolerant<'de, D>(de: D) -> Result<Option<OrderStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(v.and_then(|v| serde_json::from_value::<OrderStatus>(v).ok()))
}

/// Outgoing request to the trading gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub strategy: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub strategy_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub ref_id: String,
    pub action: OrderAction,
    pub metadata: Value,
}

/// Wire body of a send request.
pub fn order_request_body(order: &Order) -> Value {
    json!({
        "exchange": order.exchange,
        "symbol": order.symbol,
        "account_type": "exchange",
        "contract_type": order.contract_type,
        "price": order.price,
        "quantity": order.quantity,
        "direction": order.direction,
        "order_type": order.order_type,
        "account_id": order.account_id,
        "strategy_key": order.strategy_key,
        "delay": order.delay_ms,
        "post_only": order.post_only,
        "notes": order.notes,
    })
}

/// Wire body of a cancel request.
pub fn cancel_request_body(order: &Order) -> Value {
    json!({
        "exchange": order.exchange,
        "symbol": order.symbol,
        "order_id": order.order_id,
        "contract_type": order.contract_type,
        "account_id": order.account_id,
        "direction": order.direction,
        "strategy_key": order.strategy_key,
        "price": order.price,
        "quantity": order.quantity,
    })
}

/// Wire body of an inspect request.
pub fn inspect_request_body(order: &Order) -> Value {
    json!({
        "exchange": order.exchange,
        "symbol": order.symbol,
        "order_id": order.order_id,
        "contract_type": order.contract_type,
        "account_id": order.account_id,
        "direction": order.direction,
        "strategy_key": order.strategy_key,
    })
}

/// The gateway's result block inside a trade response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayResult {
    #[serde(default)]
    pub result: bool,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_code_msg: Option<String>,
}

/// Order detail block attached to inspect-shaped responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayOrderInfo {
    #[serde(default, deserialize_with = "opt_decimal_tolerant")]
    pub original_amount: Option<Decimal>,
    #[serde(default, deserialize_with = "opt_decimal_tolerant")]
    pub filled: Option<Decimal>,
    #[serde(default, deserialize_with = "opt_decimal_tolerant")]
    pub avg_executed_price: Option<Decimal>,
    #[serde(default, deserialize_with = "opt_status_tolerant")]
    pub status: Option<OrderStatus>,
}

/// Echo of the request this response answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeRequestEcho {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponseMeta {
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub contract_type: String,
    pub event: OrderAction,
    pub metadata: GatewayResult,
    #[serde(default)]
    pub order_info: Option<GatewayOrderInfo>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub request: Option<TradeRequestEcho>,
}

/// Incoming trade response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub ref_id: String,
    pub action: OrderAction,
    #[serde(default)]
    pub strategy: String,
    pub metadata: TradeResponseMeta,
}

/// Unsolicited order update pushed by the gateway for exchanges that
/// support it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdatePush {
    pub exchange: String,
    pub symbol: String,
    #[serde(default)]
    pub contract_type: String,
    pub metadata: GatewayResult,
    #[serde(default)]
    pub timestamp: String,
    pub order_info: GatewayOrderInfo,
}

/// Scheduled balance snapshot pushed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancePush {
    pub exchange: String,
    pub account_id: String,
    pub global_balances: Value,
}

/// Parsed `spot_balance` block of a balance push.
#[derive(Debug, Clone, Default)]
pub struct SpotBalance {
    pub result: bool,
    pub records: HashMap<String, BalanceRecord>,
    pub error_code: Option<String>,
    pub error_code_msg: Option<String>,
}

impl BalancePush {
    /// Extract per-currency records from the mixed `spot_balance` object
    /// (currency records sit next to `result` / `account_id` bookkeeping
    /// keys).
    pub fn spot_balance(&self) -> Option<SpotBalance> {
        let block = self.global_balances.get("spot_balance")?.as_object()?;
        let mut out = SpotBalance {
            result: block
                .get("result")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            ..Default::default()
        };
        out.error_code = block.get("error_code").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        out.error_code_msg = block
            .get("error_code_msg")
            .and_then(Value::as_str)
            .map(str::to_string);
        for (key, value) in block {
            if !value.is_object() {
                continue;
            }
            if let Ok(record) = serde_json::from_value::<BalanceRecord>(value.clone()) {
                out.records.insert(key.clone(), record);
            }
        }
        Some(out)
    }
}

/// Alarm published toward the external alerting collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmMessage {
    pub strategy_name: String,
    pub code: String,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_send_response_with_numeric_ids() {
        let raw = json!({
            "ref_id": "20190725152929_00000001",
            "action": "place_order",
            "strategy": "exec",
            "metadata": {
                "exchange": "Binance",
                "symbol": "BTCUSDT",
                "contract_type": "spot",
                "event": "place_order",
                "metadata": {
                    "result": true,
                    "account_id": "trader1",
                    "order_id": 123456
                },
                "timestamp": "20191012153300000",
                "request": {"task_id": "T1", "strategy_id": "S1"}
            }
        });
        let resp: TradeResponse = serde_json::from_value(raw).unwrap();
        assert!(resp.metadata.metadata.result);
        assert_eq!(resp.metadata.metadata.order_id.as_deref(), Some("123456"));
        assert_eq!(resp.metadata.event, OrderAction::Send);
    }

    #[test]
    fn order_info_tolerates_unknown() {
        let raw = json!({
            "original_amount": "unknown",
            "filled": "1.5",
            "avg_executed_price": 100.25,
            "status": "partially_filled"
        });
        let info: GatewayOrderInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.original_amount, None);
        assert_eq!(info.filled, Some(dec!(1.5)));
        assert_eq!(info.avg_executed_price, Some(dec!(100.25)));
        assert_eq!(info.status, Some(OrderStatus::PartiallyFilled));

        let odd = json!({"status": "untriggered"});
        let info: GatewayOrderInfo = serde_json::from_value(odd).unwrap();
        assert_eq!(info.status, None);
    }

    #[test]
    fn parses_balance_push_block() {
        let raw = json!({
            "exchange": "Binance",
            "account_id": "trader1",
            "global_balances": {
                "spot_balance": {
                    "BTC": {"available": 1.5, "total": 2.0, "reserved": 0.5, "shortable": 0},
                    "result": true,
                    "account_id": "trader1",
                    "timestamp": "20191031160412897"
                }
            }
        });
        let push: BalancePush = serde_json::from_value(raw).unwrap();
        let spot = push.spot_balance().unwrap();
        assert!(spot.result);
        assert_eq!(spot.records.len(), 1);
        assert_eq!(spot.records["BTC"].total, dec!(2.0));
    }
}
