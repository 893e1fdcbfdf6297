//! The capability handle algorithms act through.
//!
//! Exposes place/cancel/inspect, balance reads, alarms and status updates
//! — never the coordinator's maps themselves, so ledger invariants stay
//! enforceable in one place.

use rust_decimal::Decimal;
use tracing::info;

use crate::coordinator::state::MasterShared;
use crate::domain::{
    AlarmCode, Direction, Order, OrderNotes, OrderType, StrategyParams, TaskStatus,
};
use crate::ledger::BalanceBook;

use super::StrategyState;

pub struct StrategyCtx<'a> {
    pub strategy_id: &'a str,
    pub params: &'a StrategyParams,
    pub state: &'a mut StrategyState,
    pub shared: &'a mut MasterShared,
}

impl<'a> StrategyCtx<'a> {
    pub fn timer_interval_secs(&self) -> u64 {
        self.shared.cfg.timer_interval_secs
    }

    /// The balance ledger selected for this strategy's exchange.
    pub fn balance(&self) -> Option<&BalanceBook> {
        self.shared.selected_book(self.params)
    }

    /// False until the selected ledger has usable data.
    pub fn balance_ready(&self) -> bool {
        self.shared.balance_ready(self.params)
    }

    pub fn total_balance(&self, currency: &str) -> Decimal {
        self.balance()
            .map(|book| book.total_of(currency))
            .unwrap_or_default()
    }

    pub fn available_balance(&self, currency: &str) -> Decimal {
        self.balance()
            .map(|book| book.available_of(currency))
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.ledger.pending_count(self.strategy_id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.ledger.active_count(self.strategy_id)
    }

    pub fn active_refs(&self) -> Vec<String> {
        self.shared.ledger.active_refs(self.strategy_id)
    }

    /// Cloned view of the active orders; algorithms inspect price/symbol
    /// to decide on cancel-and-replace.
    pub fn active_orders(&self) -> Vec<(String, Order)> {
        self.shared
            .ledger
            .active_of(self.strategy_id)
            .map(|(ref_id, order)| (ref_id.clone(), order.clone()))
            .collect()
    }

    pub fn pending_orders(&self) -> Vec<(String, Order)> {
        self.shared
            .ledger
            .pending_of(self.strategy_id)
            .map(|(ref_id, order)| (ref_id.clone(), order.clone()))
            .collect()
    }

    /// Place a limit/market order on one of this strategy's symbols.
    /// Returns the reference id, or None when the symbol is not part of
    /// the strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn send_order(
        &mut self,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        direction: Direction,
        order_type: OrderType,
        strategy_key: &str,
        delay_ms: Option<i64>,
        post_only: bool,
    ) -> Option<String> {
        let triple = self.params.triple_for(symbol)?;
        let order = Order::new(
            &self.params.exchange,
            symbol,
            triple.base(),
            triple.quote(),
            self.params.contract_type(),
            price,
            quantity,
            direction,
            order_type,
            &self.params.account,
            strategy_key,
            delay_ms,
            post_only,
            OrderNotes {
                task_id: self.shared.task_id.clone(),
                strategy_id: self.strategy_id.to_string(),
            },
        );
        Some(self.shared.send_order(self.strategy_id, order))
    }

    pub fn cancel_order(&mut self, ref_id: &str) {
        self.shared.cancel_order(self.strategy_id, ref_id, false);
    }

    pub fn inspect_order(&mut self, ref_id: &str) {
        self.shared.inspect_order(self.strategy_id, ref_id);
    }

    pub fn clear_stale_pending(&mut self) {
        let exch_account = self.params.exch_account();
        self.shared
            .clear_stale_pending(self.strategy_id, &exch_account);
    }

    pub fn alarm(&mut self, msg: &str, code: AlarmCode) {
        self.shared.alarm(msg, code);
    }

    /// Report a status change. WARNING only annotates the task's status
    /// message; anything else moves this strategy's own state.
    pub fn update_status(&mut self, status: TaskStatus, msg: &str) {
        self.state.status_msg = msg.to_string();
        if status == TaskStatus::Warning {
            self.shared.mark_warning(msg);
        } else {
            self.state.status = status;
        }
    }

    /// Declare this strategy finished once every order has drained.
    /// Returns false (and leaves the state untouched) while pending or
    /// active orders remain; callers re-check on later timer ticks.
    pub fn try_finish(&mut self, what: &str) -> bool {
        if self.pending_count() > 0 || self.active_count() > 0 {
            info!(
                strategy_id = self.strategy_id,
                "{what} reached its target; draining outstanding orders"
            );
            return false;
        }
        info!(strategy_id = self.strategy_id, "{what} has finished");
        self.state.status = TaskStatus::Finished;
        self.state.status_msg = format!("{what} has finished");
        true
    }
}
