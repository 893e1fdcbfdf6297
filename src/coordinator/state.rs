//! State owned by the coordinator and lent to strategies through the
//! strategy context. Single-threaded; no locking, only ordering.

use chrono::{Local, NaiveDateTime};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::protocol::{
    cancel_request_body, inspect_request_body, order_request_body, AlarmMessage, TradeRequest,
};
use crate::config::AppConfig;
use crate::domain::{AlarmCode, Order, OrderAction, StrategyParams, TaskStatus};
use crate::error::GatewayErrorKind;
use crate::ledger::{BalanceBook, BalancePair, OrderLedger};

/// Outgoing work queued by handlers and drained once per loop iteration,
/// in arrival order.
#[derive(Debug)]
pub enum Outbound {
    Publish { channel: String, payload: String },
    Exit,
}

/// Reverse index entry: `exchange|symbol|exchange_order_id` -> owner.
#[derive(Debug, Clone)]
pub struct OrderRef {
    pub strategy_id: String,
    pub ref_id: String,
}

/// Everything strategies may touch, owned by the coordinator.
pub struct MasterShared {
    pub cfg: Arc<AppConfig>,
    pub task_id: String,
    pub strategy_name: String,
    pub test_mode: bool,
    pub alarm_enabled: bool,
    pub trade_request_channel: String,
    pub alarm_channel: String,
    pub ledger: OrderLedger,
    /// Dual balance ledgers per `exchange|account`
    pub balances: HashMap<String, BalancePair>,
    pub order_index: HashMap<String, OrderRef>,
    pub outbound: VecDeque<Outbound>,
    pub status: TaskStatus,
    pub status_msg: String,
    pub last_warning: NaiveDateTime,
    error_streak: u32,
}

impl MasterShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<AppConfig>,
        task_id: String,
        test_mode: bool,
        alarm_enabled: bool,
        trade_request_channel: String,
        alarm_channel: String,
    ) -> Self {
        let strategy_name = cfg.strategy_name.clone();
        Self {
            cfg,
            task_id,
            strategy_name,
            test_mode,
            alarm_enabled,
            trade_request_channel,
            alarm_channel,
            ledger: OrderLedger::new(),
            balances: HashMap::new(),
            order_index: HashMap::new(),
            outbound: VecDeque::new(),
            status: TaskStatus::Running,
            status_msg: "task is running".to_string(),
            last_warning: Local::now().naive_local(),
            error_streak: 0,
        }
    }

    pub fn push(&mut self, outbound: Outbound) {
        self.outbound.push_back(outbound);
    }

    pub fn publish_json<T: serde::Serialize>(&mut self, channel: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(payload) => self.push(Outbound::Publish {
                channel: channel.to_string(),
                payload,
            }),
            Err(e) => error!(channel, error = %e, "failed to encode outgoing payload"),
        }
    }

    pub fn balance_pair(&self, exch_account: &str) -> Option<&BalancePair> {
        self.balances.get(exch_account)
    }

    /// The ledger a strategy reads, selected by the exchange capability.
    pub fn selected_book(&self, params: &StrategyParams) -> Option<&BalanceBook> {
        let by_order = self.cfg.balance_by_order_response(&params.exchange);
        self.balances
            .get(&params.exch_account())
            .map(|pair| pair.selected(by_order))
    }

    /// Whether the selected ledger has usable data yet. The order-derived
    /// ledger is seeded from the task and always usable; the snapshot
    /// ledger only after the first exchange push.
    pub fn balance_ready(&self, params: &StrategyParams) -> bool {
        if self.cfg.balance_by_order_response(&params.exchange) {
            return true;
        }
        self.balances
            .get(&params.exch_account())
            .map(|pair| pair.seen)
            .unwrap_or(false)
    }

    pub fn order_derived_mut(&mut self, exch_account: &str) -> &mut BalanceBook {
        &mut self
            .balances
            .entry(exch_account.to_string())
            .or_default()
            .order_derived
    }

    /// Allocate a reference id, record the order as pending, reserve its
    /// balance, and queue the send request.
    pub fn send_order(&mut self, strategy_id: &str, order: Order) -> String {
        let exch_account = format!("{}|{}", order.exchange, order.account_id);
        let book = &mut self
            .balances
            .entry(exch_account)
            .or_default()
            .order_derived;
        let ref_id = self.ledger.place(strategy_id, order.clone(), book);

        info!(
            strategy_id,
            ref_id = %ref_id,
            exchange = %order.exchange,
            symbol = %order.symbol,
            direction = %order.direction,
            price = %order.price,
            quantity = %order.quantity,
            strategy_key = %order.strategy_key,
            "send order"
        );
        let request = TradeRequest {
            strategy: self.strategy_name.clone(),
            task_id: self.task_id.clone(),
            strategy_id: strategy_id.to_string(),
            ref_id: ref_id.clone(),
            action: OrderAction::Send,
            metadata: order_request_body(&order),
        };
        let channel = self.trade_request_channel.clone();
        self.publish_json(&channel, &request);
        ref_id
    }

    /// Queue a cancel for an active order. Idempotent per order unless
    /// `force` overrides the pending-cancel latch.
    pub fn cancel_order(&mut self, strategy_id: &str, ref_id: &str, force: bool) {
        let Some(order) = self.ledger.get_active_mut(strategy_id, ref_id) else {
            error!(strategy_id, ref_id, "cancel for unknown or inactive order");
            return;
        };
        if !force && order.pending_cancel {
            return;
        }
        order.pending_cancel = true;
        let body = cancel_request_body(order);
        info!(
            strategy_id,
            ref_id,
            symbol = %order.symbol,
            price = %order.price,
            "cancel order"
        );
        let request = TradeRequest {
            strategy: self.strategy_name.clone(),
            task_id: self.task_id.clone(),
            strategy_id: strategy_id.to_string(),
            ref_id: ref_id.to_string(),
            action: OrderAction::Cancel,
            metadata: body,
        };
        let channel = self.trade_request_channel.clone();
        self.publish_json(&channel, &request);
    }

    /// Queue a status poll for an active order.
    pub fn inspect_order(&mut self, strategy_id: &str, ref_id: &str) {
        let Some(order) = self.ledger.get_active_mut(strategy_id, ref_id) else {
            error!(strategy_id, ref_id, "inspect for unknown or inactive order");
            return;
        };
        let body = inspect_request_body(order);
        let request = TradeRequest {
            strategy: self.strategy_name.clone(),
            task_id: self.task_id.clone(),
            strategy_id: strategy_id.to_string(),
            ref_id: ref_id.to_string(),
            action: OrderAction::Inspect,
            metadata: body,
        };
        let channel = self.trade_request_channel.clone();
        self.publish_json(&channel, &request);
    }

    /// Cancel every active order of every strategy.
    pub fn cancel_all_orders(&mut self) {
        for strategy_id in self.ledger.strategy_ids() {
            for ref_id in self.ledger.active_refs(&strategy_id) {
                self.cancel_order(&strategy_id, &ref_id, true);
            }
        }
    }

    /// Apply one gateway response event to the ledger, mutating the
    /// order-derived balance book of the order's account.
    pub fn apply_response(
        &mut self,
        strategy_id: &str,
        ref_id: &str,
        event: crate::ledger::OrderEvent,
    ) -> crate::ledger::LedgerOutcome {
        let Some(origin) = self.ledger.get(strategy_id, ref_id) else {
            return crate::ledger::LedgerOutcome::Unknown;
        };
        let exch_account = format!("{}|{}", origin.exchange, origin.account_id);
        let pair = self.balances.entry(exch_account).or_default();
        let outcome = self
            .ledger
            .apply(strategy_id, ref_id, event, &mut pair.order_derived);
        if matches!(outcome, crate::ledger::LedgerOutcome::Applied(_)) {
            pair.seen = true;
        }
        outcome
    }

    /// Drop pending orders older than ten minutes, releasing reserve.
    pub fn clear_stale_pending(&mut self, strategy_id: &str, exch_account: &str) {
        let Some(pair) = self.balances.get_mut(exch_account) else {
            return;
        };
        self.ledger
            .clear_stale_pending(strategy_id, 600, &mut pair.order_derived);
    }

    /// Raise an alarm toward the external alerting collaborator. Silent in
    /// test mode or when the task opted out.
    pub fn alarm(&mut self, msg: &str, code: AlarmCode) {
        warn!(code = code.code(), "Alarm => {msg}");
        if self.test_mode || !self.alarm_enabled {
            return;
        }
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        let payload = AlarmMessage {
            strategy_name: self.strategy_name.clone(),
            code: code.code().to_string(),
            msg: format!("{now}: {} {} {msg}", self.strategy_name, self.task_id),
        };
        let channel = self.alarm_channel.clone();
        self.publish_json(&channel, &payload);
    }

    /// Record a WARNING without changing the task state; it decays after
    /// ten minutes without a fresh warning.
    pub fn mark_warning(&mut self, msg: &str) {
        self.status_msg = format!("warning|{msg}");
        self.last_warning = Local::now().naive_local();
    }

    /// Track the systemic/unclassified error streak. Returns true when
    /// the streak reaches five and escalation is due.
    pub fn note_gateway_error(&mut self, kind: GatewayErrorKind) -> bool {
        if kind.is_escalatable() {
            self.error_streak += 1;
            if self.error_streak >= 5 {
                self.error_streak = 0;
                return true;
            }
        } else {
            self.error_streak = 0;
        }
        false
    }

    /// Any successfully processed gateway response breaks the streak.
    pub fn note_gateway_ok(&mut self) {
        self.error_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> MasterShared {
        MasterShared::new(
            Arc::new(AppConfig::default()),
            "T1".to_string(),
            true,
            true,
            "TestTd:exec_request".to_string(),
            "MM:strategy_alarm".to_string(),
        )
    }

    #[test]
    fn error_streak_escalates_at_five() {
        let mut s = shared();
        for _ in 0..4 {
            assert!(!s.note_gateway_error(GatewayErrorKind::Systemic));
        }
        assert!(s.note_gateway_error(GatewayErrorKind::Unclassified));
        // streak reset after escalation
        assert!(!s.note_gateway_error(GatewayErrorKind::Systemic));
    }

    #[test]
    fn classified_errors_break_the_streak() {
        let mut s = shared();
        for _ in 0..4 {
            s.note_gateway_error(GatewayErrorKind::Systemic);
        }
        s.note_gateway_error(GatewayErrorKind::SizeTooSmall);
        for _ in 0..4 {
            assert!(!s.note_gateway_error(GatewayErrorKind::Systemic));
        }
        assert!(s.note_gateway_error(GatewayErrorKind::Systemic));
    }

    #[test]
    fn ok_responses_break_the_streak() {
        let mut s = shared();
        for _ in 0..4 {
            s.note_gateway_error(GatewayErrorKind::Systemic);
        }
        s.note_gateway_ok();
        assert!(!s.note_gateway_error(GatewayErrorKind::Systemic));
    }
}
