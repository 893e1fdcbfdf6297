use chrono::Local;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::domain::{Order, OrderStatus};
use crate::util::time::now_window_time;

use super::balance::BalanceBook;

type OrderMap = HashMap<String, HashMap<String, Order>>;

/// Generates reference ids: `{YYYYMMDDHHMMSS}_{counter:08}`.
///
/// The counter is monotone for the life of the task and is rebuilt from
/// the highest observed suffix when a snapshot is reloaded, so an id is
/// never handed out twice.
#[derive(Debug, Default)]
pub struct RefIdGen {
    counter: u64,
}

impl RefIdGen {
    pub fn next(&mut self) -> String {
        self.counter += 1;
        format!(
            "{}_{:08}",
            Local::now().format("%Y%m%d%H%M%S"),
            self.counter
        )
    }

    /// Advance the counter past an id seen in a reloaded snapshot.
    pub fn observe(&mut self, ref_id: &str) {
        if let Some(n) = ref_id
            .rsplit('_')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.counter = self.counter.max(n);
        }
    }

    #[cfg(test)]
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// What a response event did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// State advanced to the given status
    Applied(OrderStatus),
    /// The order already left the expected source map; nothing to do
    Duplicate,
    /// A fill/cancel-shaped event arrived while the order was still
    /// pending acceptance; ignored to keep the ledger consistent
    OutOfOrder,
    /// No record of this reference id at all
    Unknown,
}

/// Ledger-level view of a gateway response.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    /// Gateway accepted the send and assigned an exchange order id
    Accepted {
        order_id: String,
        account_id: String,
    },
    /// Gateway rejected the send
    Rejected,
    /// A fill / cancel / status update for an active order
    Fill {
        status: OrderStatus,
        filled: Decimal,
        avg_price: Decimal,
    },
}

/// Serialized form of the three order maps; written to disk on shutdown
/// and read back on resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub pending_orders: OrderMap,
    pub active_orders: OrderMap,
    pub finished_orders: OrderMap,
}

/// All orders of one task, keyed by strategy id then reference id.
///
/// Every order lives in exactly one of the three maps; records move
/// between maps as their state advances, they are never copied.
#[derive(Debug, Default)]
pub struct OrderLedger {
    refs: RefIdGen,
    pending: OrderMap,
    active: OrderMap,
    finished: OrderMap,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create the per-strategy maps so later lookups cannot miss.
    pub fn ensure_strategy(&mut self, strategy_id: &str) {
        self.pending.entry(strategy_id.to_string()).or_default();
        self.active.entry(strategy_id.to_string()).or_default();
        self.finished.entry(strategy_id.to_string()).or_default();
    }

    /// Record a new outgoing order as pending and earmark its balance in
    /// the order-derived ledger. Returns the reference id correlating the
    /// future gateway response. Pure map work; never blocks.
    pub fn place(
        &mut self,
        strategy_id: &str,
        order: Order,
        balances: &mut BalanceBook,
    ) -> String {
        let ref_id = self.refs.next();
        balances.increase_reserved(
            &order.base,
            &order.quote,
            order.direction,
            order.quantity,
            order.price,
        );
        self.pending
            .entry(strategy_id.to_string())
            .or_default()
            .insert(ref_id.clone(), order);
        ref_id
    }

    /// Apply one gateway response event. Duplicates and out-of-order
    /// events are no-ops, never errors.
    pub fn apply(
        &mut self,
        strategy_id: &str,
        ref_id: &str,
        event: OrderEvent,
        balances: &mut BalanceBook,
    ) -> LedgerOutcome {
        match event {
            OrderEvent::Accepted {
                order_id,
                account_id,
            } => {
                let Some(mut order) = self
                    .pending
                    .get_mut(strategy_id)
                    .and_then(|m| m.remove(ref_id))
                else {
                    return self.duplicate_or_unknown(strategy_id, ref_id);
                };
                order.order_id = Some(order_id);
                order.account_id = account_id;
                order.status = OrderStatus::Submitted;
                order.update_time = now_window_time();
                self.active
                    .entry(strategy_id.to_string())
                    .or_default()
                    .insert(ref_id.to_string(), order);
                LedgerOutcome::Applied(OrderStatus::Submitted)
            }

            OrderEvent::Rejected => {
                let Some(mut order) = self
                    .pending
                    .get_mut(strategy_id)
                    .and_then(|m| m.remove(ref_id))
                else {
                    return self.duplicate_or_unknown(strategy_id, ref_id);
                };
                balances.decrease_reserved(
                    &order.base,
                    &order.quote,
                    order.direction,
                    order.quantity,
                    order.price,
                );
                order.status = OrderStatus::Rejected;
                order.update_time = now_window_time();
                self.finished
                    .entry(strategy_id.to_string())
                    .or_default()
                    .insert(ref_id.to_string(), order);
                LedgerOutcome::Applied(OrderStatus::Rejected)
            }

            OrderEvent::Fill {
                status,
                filled,
                avg_price,
            } => self.apply_fill(strategy_id, ref_id, status, filled, avg_price, balances),
        }
    }

    fn apply_fill(
        &mut self,
        strategy_id: &str,
        ref_id: &str,
        status: OrderStatus,
        filled: Decimal,
        avg_price: Decimal,
        balances: &mut BalanceBook,
    ) -> LedgerOutcome {
        if self.contains(&self.finished, strategy_id, ref_id) {
            return LedgerOutcome::Duplicate;
        }
        if self.contains(&self.pending, strategy_id, ref_id) {
            // a cancel/fill for an order whose acceptance we have not seen
            warn!(strategy_id, ref_id, ?status, "fill event for pending order ignored");
            return LedgerOutcome::OutOfOrder;
        }
        let Some(order) = self.active.get_mut(strategy_id).and_then(|m| m.get_mut(ref_id))
        else {
            return LedgerOutcome::Unknown;
        };

        // a partial-fill report that does not advance the fill is stale
        if status == OrderStatus::PartiallyFilled && filled <= order.filled {
            return LedgerOutcome::Duplicate;
        }

        let size_diff = filled - order.filled;
        match status {
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                balances.decrease_reserved(
                    &order.base,
                    &order.quote,
                    order.direction,
                    size_diff,
                    order.price,
                );
            }
            OrderStatus::Cancelled => {
                balances.decrease_reserved(
                    &order.base,
                    &order.quote,
                    order.direction,
                    order.quantity - order.filled,
                    order.price,
                );
            }
            _ => {
                // status probe (resting, untriggered, ...) with no fills
                order.update_time = now_window_time();
                return LedgerOutcome::Applied(order.status);
            }
        }
        balances.apply_fill(
            &order.base,
            &order.quote,
            order.direction,
            size_diff,
            order.price,
        );

        if filled > Decimal::ZERO {
            order.filled = filled;
            if avg_price > Decimal::ZERO {
                order.avg_price = avg_price;
            }
        }
        order.status = status;
        order.update_time = now_window_time();

        if status.is_terminal() {
            if let Some(order) = self.active.get_mut(strategy_id).and_then(|m| m.remove(ref_id)) {
                self.finished
                    .entry(strategy_id.to_string())
                    .or_default()
                    .insert(ref_id.to_string(), order);
            }
        }
        LedgerOutcome::Applied(status)
    }

    fn duplicate_or_unknown(&self, strategy_id: &str, ref_id: &str) -> LedgerOutcome {
        if self.contains(&self.active, strategy_id, ref_id)
            || self.contains(&self.finished, strategy_id, ref_id)
        {
            LedgerOutcome::Duplicate
        } else {
            LedgerOutcome::Unknown
        }
    }

    fn contains(&self, map: &OrderMap, strategy_id: &str, ref_id: &str) -> bool {
        map.get(strategy_id)
            .map(|m| m.contains_key(ref_id))
            .unwrap_or(false)
    }

    /// Look an order up in whichever map currently holds it.
    pub fn get(&self, strategy_id: &str, ref_id: &str) -> Option<&Order> {
        self.pending
            .get(strategy_id)
            .and_then(|m| m.get(ref_id))
            .or_else(|| self.active.get(strategy_id).and_then(|m| m.get(ref_id)))
            .or_else(|| self.finished.get(strategy_id).and_then(|m| m.get(ref_id)))
    }

    pub fn get_active_mut(&mut self, strategy_id: &str, ref_id: &str) -> Option<&mut Order> {
        self.active.get_mut(strategy_id).and_then(|m| m.get_mut(ref_id))
    }

    pub fn pending_of(&self, strategy_id: &str) -> impl Iterator<Item = (&String, &Order)> {
        self.pending.get(strategy_id).into_iter().flatten()
    }

    pub fn active_of(&self, strategy_id: &str) -> impl Iterator<Item = (&String, &Order)> {
        self.active.get(strategy_id).into_iter().flatten()
    }

    pub fn finished_of(&self, strategy_id: &str) -> impl Iterator<Item = (&String, &Order)> {
        self.finished.get(strategy_id).into_iter().flatten()
    }

    pub fn pending_count(&self, strategy_id: &str) -> usize {
        self.pending.get(strategy_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn active_count(&self, strategy_id: &str) -> usize {
        self.active.get(strategy_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn active_refs(&self, strategy_id: &str) -> Vec<String> {
        self.active
            .get(strategy_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Orders not yet in a terminal state, across all strategies.
    pub fn unfinished_count(&self) -> usize {
        let pending: usize = self.pending.values().map(|m| m.len()).sum();
        let active: usize = self.active.values().map(|m| m.len()).sum();
        pending + active
    }

    /// Drop pending orders older than `max_age_secs`, releasing their
    /// reserved balance. Returns the dropped reference ids.
    pub fn clear_stale_pending(
        &mut self,
        strategy_id: &str,
        max_age_secs: i64,
        balances: &mut BalanceBook,
    ) -> Vec<String> {
        let now = Local::now().naive_local();
        let Some(pending) = self.pending.get_mut(strategy_id) else {
            return Vec::new();
        };
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, order)| {
                crate::util::time::parse_window_time(&order.create_time)
                    .map(|created| (now - created).num_seconds() > max_age_secs)
                    .unwrap_or(true)
            })
            .map(|(ref_id, _)| ref_id.clone())
            .collect();
        for ref_id in &stale {
            if let Some(order) = pending.remove(ref_id) {
                balances.decrease_reserved(
                    &order.base,
                    &order.quote,
                    order.direction,
                    order.quantity,
                    order.price,
                );
                warn!(strategy_id, ref_id, "dropped stale pending order");
            }
        }
        stale
    }

    /// Finished plus still-active orders, for statistics and reports.
    pub fn trade_orders(&self, strategy_id: &str) -> HashMap<String, Order> {
        let mut merged: HashMap<String, Order> = self
            .finished
            .get(strategy_id)
            .cloned()
            .unwrap_or_default();
        if let Some(active) = self.active.get(strategy_id) {
            for (ref_id, order) in active {
                merged.insert(ref_id.clone(), order.clone());
            }
        }
        merged
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            pending_orders: self.pending.clone(),
            active_orders: self.active.clone(),
            finished_orders: self.finished.clone(),
        }
    }

    /// Reload a snapshot from a previous run of the same task id and
    /// advance the reference counter past every recorded id.
    pub fn restore(&mut self, snapshot: OrderSnapshot) {
        for map in [
            &snapshot.pending_orders,
            &snapshot.active_orders,
            &snapshot.finished_orders,
        ] {
            for orders in map.values() {
                for ref_id in orders.keys() {
                    self.refs.observe(ref_id);
                }
            }
        }
        self.pending = snapshot.pending_orders;
        self.active = snapshot.active_orders;
        self.finished = snapshot.finished_orders;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, OrderNotes, OrderType};
    use rust_decimal_macros::dec;
    use std::collections::HashMap as Map;

    fn sample_order(direction: Direction, price: Decimal, quantity: Decimal) -> Order {
        Order::new(
            "Binance",
            "BTCUSDT",
            "BTC",
            "USDT",
            "spot",
            price,
            quantity,
            direction,
            OrderType::Limit,
            "trader1",
            "Twap",
            None,
            false,
            OrderNotes {
                task_id: "T1".to_string(),
                strategy_id: "S1".to_string(),
            },
        )
    }

    fn seeded_book() -> BalanceBook {
        let mut initial = Map::new();
        initial.insert("BTC".to_string(), dec!(10));
        initial.insert("USDT".to_string(), dec!(0));
        BalanceBook::with_initial(&initial)
    }

    fn accept(ledger: &mut OrderLedger, book: &mut BalanceBook, ref_id: &str) {
        let outcome = ledger.apply(
            "S1",
            ref_id,
            OrderEvent::Accepted {
                order_id: "ex-1".to_string(),
                account_id: "trader1".to_string(),
            },
            book,
        );
        assert_eq!(outcome, LedgerOutcome::Applied(OrderStatus::Submitted));
    }

    #[test]
    fn ref_ids_are_monotonic() {
        let mut gen = RefIdGen::default();
        let a = gen.next();
        let b = gen.next();
        assert!(a.ends_with("_00000001"));
        assert!(b.ends_with("_00000002"));
        gen.observe("20191012000000_00000009");
        assert_eq!(gen.counter(), 9);
        assert!(gen.next().ends_with("_00000010"));
    }

    #[test]
    fn reject_releases_reserved_exactly() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let before = book.reserved_of("USDT");

        let ref_id = ledger.place("S1", sample_order(Direction::Buy, dec!(100), dec!(1)), &mut book);
        assert_eq!(book.reserved_of("USDT"), before + dec!(100));

        let outcome = ledger.apply("S1", &ref_id, OrderEvent::Rejected, &mut book);
        assert_eq!(outcome, LedgerOutcome::Applied(OrderStatus::Rejected));
        assert_eq!(book.reserved_of("USDT"), before);
        assert_eq!(ledger.finished_of("S1").count(), 1);

        // a duplicate rejection is a no-op
        let outcome = ledger.apply("S1", &ref_id, OrderEvent::Rejected, &mut book);
        assert_eq!(outcome, LedgerOutcome::Duplicate);
        assert_eq!(book.reserved_of("USDT"), before);
    }

    #[test]
    fn full_buy_fill_settles_balances() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();

        let ref_id = ledger.place("S1", sample_order(Direction::Buy, dec!(100), dec!(1)), &mut book);
        accept(&mut ledger, &mut book, &ref_id);
        let outcome = ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::Filled,
                filled: dec!(1),
                avg_price: dec!(99.5),
            },
            &mut book,
        );
        assert_eq!(outcome, LedgerOutcome::Applied(OrderStatus::Filled));
        assert_eq!(book.total_of("BTC"), dec!(11));
        assert_eq!(book.total_of("USDT"), dec!(-100));
        assert_eq!(book.reserved_of("USDT"), Decimal::ZERO);
        assert_eq!(book.available_of("USDT"), dec!(-100));
        assert_eq!(ledger.active_count("S1"), 0);
        assert_eq!(ledger.finished_of("S1").count(), 1);
    }

    #[test]
    fn partial_then_cancel_returns_reserve_to_baseline() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let baseline = book.reserved_of("BTC");

        let ref_id =
            ledger.place("S1", sample_order(Direction::Sell, dec!(100), dec!(4)), &mut book);
        accept(&mut ledger, &mut book, &ref_id);
        assert_eq!(book.reserved_of("BTC"), baseline + dec!(4));

        ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::PartiallyFilled,
                filled: dec!(1.5),
                avg_price: dec!(100),
            },
            &mut book,
        );
        assert_eq!(book.reserved_of("BTC"), baseline + dec!(2.5));
        assert_eq!(ledger.active_count("S1"), 1);

        ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::Cancelled,
                filled: dec!(1.5),
                avg_price: dec!(100),
            },
            &mut book,
        );
        assert_eq!(book.reserved_of("BTC"), baseline);
        assert_eq!(book.total_of("BTC"), dec!(8.5));
        assert_eq!(book.total_of("USDT"), dec!(150));
        assert_eq!(book.available_of("BTC"), book.total_of("BTC"));
        assert_eq!(ledger.active_count("S1"), 0);
    }

    #[test]
    fn stale_partial_fill_is_ignored() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let ref_id =
            ledger.place("S1", sample_order(Direction::Sell, dec!(100), dec!(4)), &mut book);
        accept(&mut ledger, &mut book, &ref_id);

        ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::PartiallyFilled,
                filled: dec!(2),
                avg_price: dec!(100),
            },
            &mut book,
        );
        let reserved = book.reserved_of("BTC");
        let outcome = ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::PartiallyFilled,
                filled: dec!(1),
                avg_price: dec!(100),
            },
            &mut book,
        );
        assert_eq!(outcome, LedgerOutcome::Duplicate);
        assert_eq!(book.reserved_of("BTC"), reserved);
    }

    #[test]
    fn cancel_before_accept_is_out_of_order() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let ref_id =
            ledger.place("S1", sample_order(Direction::Sell, dec!(100), dec!(1)), &mut book);
        let reserved = book.reserved_of("BTC");

        let outcome = ledger.apply(
            "S1",
            &ref_id,
            OrderEvent::Fill {
                status: OrderStatus::Cancelled,
                filled: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            },
            &mut book,
        );
        assert_eq!(outcome, LedgerOutcome::OutOfOrder);
        assert_eq!(book.reserved_of("BTC"), reserved);
        assert_eq!(ledger.pending_count("S1"), 1);
    }

    #[test]
    fn unknown_ref_id_is_reported() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let outcome = ledger.apply("S1", "nope", OrderEvent::Rejected, &mut book);
        assert_eq!(outcome, LedgerOutcome::Unknown);
    }

    #[test]
    fn snapshot_restore_rebuilds_counter() {
        let mut ledger = OrderLedger::new();
        ledger.ensure_strategy("S1");
        let mut book = seeded_book();
        let r1 = ledger.place("S1", sample_order(Direction::Sell, dec!(100), dec!(1)), &mut book);
        let r2 = ledger.place("S1", sample_order(Direction::Sell, dec!(100), dec!(1)), &mut book);
        accept(&mut ledger, &mut book, &r1);

        let snap = ledger.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let reloaded: OrderSnapshot = serde_json::from_str(&json).unwrap();

        let mut fresh = OrderLedger::new();
        fresh.restore(reloaded);
        assert_eq!(fresh.pending_count("S1"), 1);
        assert_eq!(fresh.active_count("S1"), 1);
        let r3 = fresh.refs.next();
        assert!(r3.ends_with("_00000003"), "{r3} after {r2}");
    }
}
