//! Control commands arriving on the UI channel and their responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::{CurrencyType, OrderType, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Pause,
    Resume,
    Delete,
    Download,
    Statistics,
    ExportStatistics,
    OmsSendOrder,
    OmsCancelOrder,
    OmsInspectOrder,
    OmsCancelAllOrder,
    OmsOrderStatus,
    OmsFinishedOrders,
    OmsUnfinishedOrders,
}

/// Command envelope; kind-specific fields stay in `body` until the
/// handler knows what to expect.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub task_id: String,
    #[serde(default)]
    pub client_id: Value,
    #[serde(flatten)]
    pub body: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeArgs {
    #[serde(default)]
    pub task: Option<Task>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteArgs {
    #[serde(default)]
    pub force_delete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendOrderArgs {
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub delay: Option<i64>,
    #[serde(default)]
    pub post_only: Option<bool>,
    #[serde(default)]
    pub trader: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderRefArgs {
    pub strategy_id: String,
    pub ref_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatFees {
    pub exchange_fee: Decimal,
    #[serde(default)]
    pub service_fee: Option<Decimal>,
    pub currency_type: CurrencyType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticsArgs {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    pub strategies: HashMap<String, StatFees>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportStatisticsArgs {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    pub exchange_fee: Decimal,
    #[serde(default)]
    pub service_fee: Option<Decimal>,
    pub currency_type: CurrencyType,
}

/// Every command produces exactly one of these, correlated by the
/// caller's client id.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub client_id: Value,
    pub status: TaskStatus,
    pub result: bool,
    pub msg: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_delete_with_force_flag() {
        let raw = json!({
            "type": "delete",
            "task_id": "T1",
            "client_id": 1570863741413u64,
            "force_delete": true
        });
        let env: CommandEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.kind, CommandKind::Delete);
        let args: DeleteArgs = serde_json::from_value(env.body).unwrap();
        assert!(args.force_delete);
    }

    #[test]
    fn parses_send_order_body() {
        let raw = json!({
            "type": "oms_send_order",
            "task_id": "T1",
            "client_id": "c1",
            "strategy_id": "S1",
            "symbol": "BTCUSDT",
            "price": 1000,
            "quantity": 1,
            "direction": "Buy",
            "trader": "ivan"
        });
        let env: CommandEnvelope = serde_json::from_value(raw).unwrap();
        let args: SendOrderArgs = serde_json::from_value(env.body).unwrap();
        assert_eq!(args.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(args.direction.as_deref(), Some("Buy"));
        assert_eq!(args.trader.as_deref(), Some("ivan"));
    }
}
