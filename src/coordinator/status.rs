//! Periodic status snapshots pushed to the UI.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::domain::{CurrencyType, Direction, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub strategy_id: String,
    pub exchange: String,
    pub account: String,
    pub symbol: String,
    pub direction: Direction,
    pub currency_type: CurrencyType,
    pub price_threshold: Option<Decimal>,
    pub total_size: Decimal,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub deal_size: Decimal,
    pub attention: bool,
    pub current_price: Option<Decimal>,
    pub status: TaskStatus,
    pub status_msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ip: String,
    pub pid: u32,
    /// The task id
    pub name: String,
    pub status: TaskStatus,
    pub status_msg: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub update_time: String,
    pub strategies: HashMap<String, StrategyStatus>,
}

/// UI notification emitted when a task hits a terminal error.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: TaskStatus,
    pub message: String,
    pub description: String,
}
