use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::Direction;

/// Per-currency holdings. Invariant: `available = total - reserved`,
/// restored after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub total: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub shortable: Decimal,
}

/// One balance ledger: currency -> record.
///
/// Reads return zero for unknown currencies — algorithms query balances
/// speculatively before a task's currencies are known to exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceBook {
    balances: HashMap<String, BalanceRecord>,
}

impl BalanceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// A book seeded from declared initial holdings.
    pub fn with_initial(initial: &HashMap<String, Decimal>) -> Self {
        let balances = initial
            .iter()
            .map(|(currency, amount)| {
                (
                    currency.clone(),
                    BalanceRecord {
                        total: *amount,
                        available: *amount,
                        reserved: Decimal::ZERO,
                        shortable: Decimal::ZERO,
                    },
                )
            })
            .collect();
        Self { balances }
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    pub fn total_of(&self, currency: &str) -> Decimal {
        self.balances
            .get(currency)
            .map(|r| r.total)
            .unwrap_or_default()
    }

    pub fn available_of(&self, currency: &str) -> Decimal {
        self.balances
            .get(currency)
            .map(|r| r.available)
            .unwrap_or_default()
    }

    pub fn reserved_of(&self, currency: &str) -> Decimal {
        self.balances
            .get(currency)
            .map(|r| r.reserved)
            .unwrap_or_default()
    }

    pub fn record(&self, currency: &str) -> Option<&BalanceRecord> {
        self.balances.get(currency)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BalanceRecord)> {
        self.balances.iter()
    }

    fn entry(&mut self, currency: &str) -> &mut BalanceRecord {
        self.balances.entry(currency.to_string()).or_default()
    }

    fn rebalance(&mut self, currency: &str) {
        let rec = self.entry(currency);
        rec.available = rec.total - rec.reserved;
    }

    /// Earmark balance for an outstanding order: the sold currency for
    /// sells, the notional in quote for buys.
    pub fn increase_reserved(
        &mut self,
        base: &str,
        quote: &str,
        direction: Direction,
        quantity: Decimal,
        price: Decimal,
    ) {
        match direction {
            Direction::Sell => {
                self.entry(base).reserved += quantity;
                self.rebalance(base);
            }
            Direction::Buy => {
                self.entry(quote).reserved += quantity * price;
                self.rebalance(quote);
            }
        }
    }

    pub fn decrease_reserved(
        &mut self,
        base: &str,
        quote: &str,
        direction: Direction,
        quantity: Decimal,
        price: Decimal,
    ) {
        self.increase_reserved(base, quote, direction, -quantity, price);
    }

    /// Move totals for an incremental fill of `size_diff`, valued at the
    /// order's original price and signed by direction.
    pub fn apply_fill(
        &mut self,
        base: &str,
        quote: &str,
        direction: Direction,
        size_diff: Decimal,
        price: Decimal,
    ) {
        if size_diff.is_zero() {
            return;
        }
        let sign = direction.sign();
        self.entry(base).total += size_diff * sign;
        self.entry(quote).total -= size_diff * price * sign;
        self.rebalance(base);
        self.rebalance(quote);
    }

    /// Replace the whole book with an exchange-pushed snapshot.
    pub fn replace_snapshot(&mut self, balances: HashMap<String, BalanceRecord>) {
        self.balances = balances;
    }
}

/// The two per-account ledgers: one fed by exchange snapshot pushes, one
/// derived from order responses starting at the task's initial balance.
#[derive(Debug, Clone, Default)]
pub struct BalancePair {
    pub snapshot: BalanceBook,
    pub order_derived: BalanceBook,
    /// True once either source has produced usable data
    pub seen: bool,
}

impl BalancePair {
    pub fn with_initial(initial: &HashMap<String, Decimal>) -> Self {
        Self {
            snapshot: BalanceBook::with_initial(initial),
            order_derived: BalanceBook::with_initial(initial),
            seen: false,
        }
    }

    /// The ledger algorithms should read, per the exchange capability flag.
    pub fn selected(&self, by_order_response: bool) -> &BalanceBook {
        if by_order_response {
            &self.order_derived
        } else {
            &self.snapshot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> BalanceBook {
        let mut initial = HashMap::new();
        initial.insert("BTC".to_string(), dec!(10));
        initial.insert("USDT".to_string(), dec!(0));
        BalanceBook::with_initial(&initial)
    }

    fn assert_invariant(book: &BalanceBook) {
        for (currency, rec) in book.iter() {
            assert_eq!(
                rec.available,
                rec.total - rec.reserved,
                "available invariant broken for {currency}"
            );
        }
    }

    #[test]
    fn unknown_currency_reads_zero() {
        let book = book();
        assert_eq!(book.total_of("DOGE"), Decimal::ZERO);
        assert_eq!(book.available_of("DOGE"), Decimal::ZERO);
    }

    #[test]
    fn reserve_sell_uses_base() {
        let mut book = book();
        book.increase_reserved("BTC", "USDT", Direction::Sell, dec!(2), dec!(100));
        assert_eq!(book.reserved_of("BTC"), dec!(2));
        assert_eq!(book.available_of("BTC"), dec!(8));
        assert_eq!(book.reserved_of("USDT"), Decimal::ZERO);
        assert_invariant(&book);
    }

    #[test]
    fn reserve_buy_uses_quote_notional() {
        let mut book = book();
        book.increase_reserved("BTC", "USDT", Direction::Buy, dec!(2), dec!(100));
        assert_eq!(book.reserved_of("USDT"), dec!(200));
        assert_eq!(book.available_of("USDT"), dec!(-200));
        assert_invariant(&book);
    }

    #[test]
    fn buy_fill_moves_totals_at_original_price() {
        let mut book = book();
        book.increase_reserved("BTC", "USDT", Direction::Buy, dec!(1), dec!(100));
        book.decrease_reserved("BTC", "USDT", Direction::Buy, dec!(1), dec!(100));
        book.apply_fill("BTC", "USDT", Direction::Buy, dec!(1), dec!(100));
        assert_eq!(book.total_of("BTC"), dec!(11));
        assert_eq!(book.total_of("USDT"), dec!(-100));
        assert_eq!(book.reserved_of("USDT"), Decimal::ZERO);
        assert_invariant(&book);
    }

    #[test]
    fn pair_selection() {
        let mut initial = HashMap::new();
        initial.insert("BTC".to_string(), dec!(1));
        let pair = BalancePair::with_initial(&initial);
        assert!(std::ptr::eq(pair.selected(true), &pair.order_derived));
        assert!(std::ptr::eq(pair.selected(false), &pair.snapshot));
    }
}
