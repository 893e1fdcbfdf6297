use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::util::time::now_window_time;

/// Order side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// +1 for buys, -1 for sells; used to sign balance deltas.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Buy => Decimal::ONE,
            Direction::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "Buy"),
            Direction::Sell => write!(f, "Sell"),
        }
    }
}

/// Order type understood by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
    Fak,
    Fok,
}

/// Order status
///
/// `Submitted` is the gateway's "new" — accepted by the exchange, resting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "new")]
    Submitted,
    #[serde(rename = "partially_filled")]
    PartiallyFilled,
    #[serde(rename = "filled")]
    Filled,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "rejected")]
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }
}

/// Request actions sent to the trading gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    #[serde(rename = "place_order")]
    Send,
    #[serde(rename = "cancel_order")]
    Cancel,
    #[serde(rename = "inspect_order")]
    Inspect,
    #[serde(rename = "cancel_all_orders")]
    CancelAll,
    #[serde(rename = "query_balance")]
    QueryBalance,
}

/// Free-form correlation data written into the gateway's order record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotes {
    pub task_id: String,
    pub strategy_id: String,
}

/// One order as tracked by the ledger.
///
/// Lives in exactly one of the pending / active / finished maps, keyed by
/// its coordinator-assigned reference id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub exchange: String,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub contract_type: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub direction: Direction,
    pub order_type: OrderType,
    pub account_id: String,
    pub strategy_key: String,
    /// FAK lifetime in milliseconds
    pub delay_ms: i64,
    pub post_only: bool,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub status: OrderStatus,
    pub create_time: String,
    pub update_time: String,
    /// Exchange-assigned id, known once the gateway accepts the send
    #[serde(default)]
    pub order_id: Option<String>,
    /// Set when a cancel request is in flight to avoid duplicate cancels
    #[serde(default)]
    pub pending_cancel: bool,
    pub notes: OrderNotes,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: &str,
        symbol: &str,
        base: &str,
        quote: &str,
        contract_type: &str,
        price: Decimal,
        quantity: Decimal,
        direction: Direction,
        order_type: OrderType,
        account_id: &str,
        strategy_key: &str,
        delay_ms: Option<i64>,
        post_only: bool,
        notes: OrderNotes,
    ) -> Self {
        let now = now_window_time();
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            contract_type: contract_type.to_string(),
            price,
            quantity,
            direction,
            order_type,
            account_id: account_id.to_string(),
            strategy_key: strategy_key.to_string(),
            delay_ms: delay_ms.unwrap_or(59_000),
            post_only,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            status: OrderStatus::Pending,
            create_time: now.clone(),
            update_time: now,
            order_id: None,
            pending_cancel: false,
            notes,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }
}

/// Uniform order response handed to the ledger and the owning algorithm,
/// regardless of whether it came from polling or an unsolicited push.
#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub strategy_id: String,
    pub ref_id: String,
    pub action: OrderAction,
    pub task_id: String,
    pub exchange: String,
    pub account_id: String,
    pub symbol: String,
    pub contract_type: String,
    pub timestamp: String,
    pub status: OrderStatus,
    pub direction: Direction,
    pub original_amount: Decimal,
    pub original_price: Decimal,
    pub filled: Decimal,
    pub avg_executed_price: Decimal,
    pub order_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Submitted).unwrap(),
            "\"new\""
        );
        assert_eq!(
            serde_json::from_str::<OrderStatus>("\"partially_filled\"").unwrap(),
            OrderStatus::PartiallyFilled
        );
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::PartiallyFilled.is_active());
        assert!(!OrderStatus::Pending.is_active());
    }

    #[test]
    fn action_wire_names() {
        assert_eq!(
            serde_json::to_string(&OrderAction::Send).unwrap(),
            "\"place_order\""
        );
        assert_eq!(
            serde_json::from_str::<OrderAction>("\"inspect_order\"").unwrap(),
            OrderAction::Inspect
        );
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Buy.sign(), dec!(1));
        assert_eq!(Direction::Sell.sign(), dec!(-1));
        assert_eq!(Direction::Buy.opposite(), Direction::Sell);
    }
}
