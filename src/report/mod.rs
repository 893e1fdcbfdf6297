//! Order statistics and the report-generation boundary.
//!
//! Spreadsheet construction, object-storage upload and email delivery are
//! external collaborators behind [`ReportSink`]; the engine only computes
//! the numbers.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::domain::{CurrencyType, Direction, Order, Task};
use crate::util::time::parse_window_time;

/// Execution summary over a set of orders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStats {
    pub task_id: String,
    pub currency_type: CurrencyType,
    pub algorithm: String,
    pub account: String,
    pub direction: Direction,
    pub exchange: String,
    pub symbol: String,
    /// What was paid out (quote for buys, base for sells)
    pub coin_cost: Decimal,
    /// Received after exchange and service fees
    pub coin_net_get: Decimal,
    /// Received after exchange fees only
    pub coin_get: Decimal,
    pub total_size: Decimal,
    pub avg_price: Decimal,
}

fn in_window(order: &Order, start: Option<&str>, end: Option<&str>) -> bool {
    let Some(updated) = parse_window_time(&order.update_time) else {
        return false;
    };
    if let Some(start) = start.and_then(parse_window_time) {
        if updated < start {
            return false;
        }
    }
    if let Some(end) = end.and_then(parse_window_time) {
        if updated >= end {
            return false;
        }
    }
    true
}

fn sums(orders: &[&Order]) -> (Decimal, Decimal) {
    let base: Decimal = orders.iter().map(|o| o.filled).sum();
    let quote: Decimal = orders.iter().map(|o| o.filled * o.avg_price).sum();
    (base, quote)
}

/// Aggregate fills into an execution summary.
///
/// For triangular strategies orders span two pairs; the median leg (the
/// pair sharing a currency with the nominal symbol's base) carries the
/// base quantity, the anchor leg the settlement quantity, paired off at
/// the smaller of the two to ignore unhedged residue.
pub fn aggregate(
    orders: &HashMap<String, Order>,
    start: Option<&str>,
    end: Option<&str>,
    exchange_fee: Decimal,
    service_fee: Decimal,
    currency_type: CurrencyType,
) -> OrderStats {
    let mut stats = OrderStats {
        currency_type,
        ..Default::default()
    };
    let Some(first) = orders.values().next() else {
        return stats;
    };
    stats.task_id = first.notes.strategy_id.clone();
    let mut parts = first.notes.strategy_id.splitn(4, '_');
    stats.algorithm = parts.next().unwrap_or_default().to_string();
    stats.exchange = parts.next().unwrap_or_default().to_string();
    stats.symbol = parts.next().unwrap_or_default().to_string();
    stats.account = first.account_id.clone();
    stats.direction = first.direction;

    let fills: Vec<&Order> = orders
        .values()
        .filter(|o| o.filled > Decimal::ZERO && in_window(o, start, end))
        .collect();
    if fills.is_empty() {
        return stats;
    }

    let symbols: Vec<&str> = {
        let mut s: Vec<&str> = fills.iter().map(|o| o.symbol.as_str()).collect();
        s.sort_unstable();
        s.dedup();
        s
    };

    let (base_sum, quote_sum) = if symbols.len() <= 1 {
        sums(&fills)
    } else {
        // triangle: split legs; median is the one quoting the nominal base
        let lead = stats.symbol.get(..1).unwrap_or_default();
        let median_sym = fills
            .iter()
            .find(|o| !lead.is_empty() && o.symbol.starts_with(lead))
            .map(|o| o.symbol.clone())
            .unwrap_or_else(|| symbols[0].to_string());
        let median: Vec<&Order> = fills
            .iter()
            .copied()
            .filter(|o| o.symbol == median_sym)
            .collect();
        let anchor: Vec<&Order> = fills
            .iter()
            .copied()
            .filter(|o| o.symbol != median_sym)
            .collect();
        let (base_m, quote_m) = sums(&median);
        let (base_a, quote_a) = sums(&anchor);
        if base_m.is_zero() || base_a.is_zero() {
            sums(&fills)
        } else {
            stats.direction = median[0].direction;
            let hedged_opposite = anchor[0].direction != stats.direction;
            let (mid_sum, settle_sum) = if hedged_opposite {
                (quote_a, base_a)
            } else {
                (base_a, quote_a)
            };
            // pair off at the smaller leg
            let base = if quote_m.is_zero() {
                base_m
            } else {
                base_m.min(mid_sum / quote_m * base_m)
            };
            let quote = if mid_sum.is_zero() {
                settle_sum
            } else {
                settle_sum.min(quote_m / mid_sum * settle_sum)
            };
            (base, quote)
        }
    };

    stats.total_size = match currency_type {
        CurrencyType::Base => base_sum,
        CurrencyType::Quote => quote_sum,
    };
    let meta_quantity = match stats.direction {
        Direction::Buy => base_sum,
        Direction::Sell => quote_sum,
    };
    stats.coin_get = meta_quantity * (Decimal::ONE - exchange_fee);
    stats.coin_net_get = stats.coin_get * (Decimal::ONE - service_fee);
    stats.coin_cost = match stats.direction {
        Direction::Buy => quote_sum,
        Direction::Sell => base_sum,
    };
    stats.avg_price = if base_sum.is_zero() {
        Decimal::ZERO
    } else {
        quote_sum / base_sum
    };
    stats
}

/// External report generation boundary. Implementations render
/// spreadsheets, upload them, and hand back links.
pub trait ReportSink: Send + Sync {
    /// Full execution report for a finished task; per-strategy links.
    fn execution_report(
        &self,
        task: &Task,
        orders: &HashMap<String, HashMap<String, Order>>,
    ) -> HashMap<String, String>;

    /// One-page statistics export; a link when available.
    fn export_statistics(&self, task_id: &str, stats: &OrderStats) -> Option<String>;
}

/// Stand-in used when no report backend is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReportSink;

impl ReportSink for NoopReportSink {
    fn execution_report(
        &self,
        _task: &Task,
        _orders: &HashMap<String, HashMap<String, Order>>,
    ) -> HashMap<String, String> {
        HashMap::new()
    }

    fn export_statistics(&self, _task_id: &str, _stats: &OrderStats) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderNotes, OrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn filled_order(filled: Decimal, avg: Decimal) -> Order {
        let mut order = Order::new(
            "Binance",
            "BTCUSDT",
            "BTC",
            "USDT",
            "spot",
            avg,
            filled,
            Direction::Buy,
            OrderType::Limit,
            "trader1",
            "Twap",
            None,
            false,
            OrderNotes {
                task_id: "T1".to_string(),
                strategy_id: "TWAP_Binance_BTCUSDT_20190725152929".to_string(),
            },
        );
        order.filled = filled;
        order.avg_price = avg;
        order.status = OrderStatus::Filled;
        order
    }

    #[test]
    fn aggregates_single_symbol() {
        let mut orders = HashMap::new();
        orders.insert("r1".to_string(), filled_order(dec!(1), dec!(100)));
        orders.insert("r2".to_string(), filled_order(dec!(2), dec!(110)));

        let stats = aggregate(
            &orders,
            None,
            None,
            dec!(0.001),
            dec!(0.01),
            CurrencyType::Base,
        );
        assert_eq!(stats.algorithm, "TWAP");
        assert_eq!(stats.exchange, "Binance");
        assert_eq!(stats.total_size, dec!(3));
        assert_eq!(stats.coin_cost, dec!(320));
        // buy receives base, minus fees
        assert_eq!(stats.coin_get, dec!(3) * dec!(0.999));
        assert_eq!(stats.coin_net_get, dec!(3) * dec!(0.999) * dec!(0.99));
        assert_eq!(stats.avg_price, dec!(320) / dec!(3));
    }

    #[test]
    fn empty_orders_yield_zeroes() {
        let orders = HashMap::new();
        let stats = aggregate(&orders, None, None, dec!(0), dec!(0), CurrencyType::Base);
        assert_eq!(stats.total_size, Decimal::ZERO);
        assert!(stats.task_id.is_empty());
    }
}
