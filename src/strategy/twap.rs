//! Time-weighted average price execution.
//!
//! Each slice targets the linear schedule: a passively priced order sized
//! to the per-interval amount plus a market-priced catch-up order for any
//! shortfall. Near the end of the window the whole residual converts into
//! a single market-priced order.

use chrono::Local;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::domain::{
    AlarmCode, CurrencyType, Direction, MarketDataEnvelope, OrderBook, OrderType, StrategyParams,
    TaskStatus,
};
use crate::util::time::parse_window_time;

use super::sizing::{
    amount_adjust, ceil_to_step, format_amount, format_price, min_order_size,
    orderbook_price_filter, price_offset,
};
use super::{Algorithm, StrategyCtx};

const MARKET_ORDER_COEFFICIENT: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
const ORDER_INTERVAL_SECS: i64 = 60;

pub struct Twap {
    started: bool,
    last_trigger: Option<chrono::NaiveDateTime>,
    bid0: Decimal,
    ask0: Decimal,
    order_delay_ms: i64,
}

impl Twap {
    pub fn new() -> Self {
        Self {
            started: false,
            last_trigger: None,
            bid0: Decimal::ZERO,
            ask0: Decimal::ZERO,
            order_delay_ms: (ORDER_INTERVAL_SECS - 1) * 1000,
        }
    }

    fn slice_interval_secs(params: &StrategyParams) -> f64 {
        match (params.fixed_interval_ms, params.random_interval_ms) {
            (Some(fixed), Some(random)) => {
                let r: f64 = rand::thread_rng().gen();
                (fixed as f64 + random as f64 * r) / 1000.0
            }
            _ => ORDER_INTERVAL_SECS as f64,
        }
    }

    fn run_slice(&mut self, ctx: &mut StrategyCtx<'_>) {
        let params = ctx.params;
        let symbol = params.symbol.pair().to_string();
        let base = params.symbol.base().to_string();
        let quote = params.symbol.quote().to_string();
        let direction = params.direction;
        let currency_type = params.currency_type;
        let total_size = params.total_size;

        let (Some(start), Some(end)) = (
            params.start_time.as_deref().and_then(parse_window_time),
            params.end_time.as_deref().and_then(parse_window_time),
        ) else {
            error!("task window does not parse");
            return;
        };
        let st = start.and_utc().timestamp();
        let et = end.and_utc().timestamp();
        if et <= st {
            error!("task window is empty");
            return;
        }
        let ts_now = Local::now().naive_local().and_utc().timestamp();

        let ini_balance = match currency_type {
            CurrencyType::Base => params.initial_balance_of(&base),
            CurrencyType::Quote => params.initial_balance_of(&quote),
        };

        let (bid0, ask0) = (self.bid0, self.ask0);
        if bid0 <= Decimal::ZERO || ask0 <= Decimal::ZERO {
            error!("ask0/bid0 not ready");
            return;
        }

        let Some(rule) = params.pair_rule(&symbol) else {
            error!(%symbol, "missing pair rule");
            return;
        };
        let price_precision = rule.price_precision;
        let amount_precision = rule.size_precision;
        let min_size = ceil_to_step(
            min_order_size(rule.base_min_order_size, rule.quote_min_order_size, bid0),
            amount_precision,
        );

        let offset = price_offset(direction, ask0, bid0, price_precision, params.execution_mode);

        // balance view: authoritative-by-order-response exchanges always
        // have data; others must wait for the first snapshot push
        let balance_status = ctx.balance_ready();
        let (base_currency, quote_currency) = if balance_status {
            (ctx.total_balance(&base), ctx.total_balance(&quote))
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        info!(
            %base_currency,
            %quote_currency,
            %ask0,
            %bid0,
            "twap slice inputs"
        );

        // 1. start gating
        if !self.started {
            if ts_now < st {
                info!("waiting for execution start");
                return;
            }
            if balance_status {
                let enough = match (direction, currency_type) {
                    (Direction::Sell, CurrencyType::Base) => {
                        base_currency + amount_precision > ini_balance - total_size
                    }
                    (Direction::Sell, CurrencyType::Quote) => {
                        base_currency > (total_size - (quote_currency - ini_balance)) / bid0 / Decimal::TWO
                    }
                    (Direction::Buy, CurrencyType::Quote) => quote_currency > ini_balance - total_size,
                    (Direction::Buy, CurrencyType::Base) => {
                        quote_currency
                            > (total_size - (base_currency - ini_balance)) * ask0 / Decimal::TWO
                    }
                };
                if !enough {
                    error!("balance not enough");
                    return;
                }
            }
            info!("execution start");
            self.started = true;
        }

        // 2. order hygiene
        if ctx.pending_count() > 4 {
            let n = ctx.pending_count();
            ctx.alarm(&format!("too many pending orders: {n}"), AlarmCode::ExecuteAbnormal);
            ctx.clear_stale_pending();
        }
        if ctx.active_count() > 0 {
            for ref_id in ctx.active_refs() {
                ctx.cancel_order(&ref_id);
            }
            if ctx.active_count() > 4 {
                let n = ctx.active_count();
                ctx.alarm(&format!("too many active orders: {n}"), AlarmCode::ExecuteAbnormal);
                return;
            }
        }

        // 3. finish check
        if balance_status {
            let done = match (direction, currency_type) {
                (Direction::Sell, CurrencyType::Base) => {
                    base_currency < ini_balance - total_size + min_size || base_currency < min_size
                }
                (Direction::Sell, CurrencyType::Quote) => {
                    quote_currency > ini_balance + total_size || base_currency < min_size
                }
                (Direction::Buy, CurrencyType::Quote) => {
                    quote_currency < ini_balance - total_size + min_size * bid0
                        || quote_currency < min_size * bid0
                }
                (Direction::Buy, CurrencyType::Base) => {
                    base_currency > ini_balance + total_size - amount_precision
                        || quote_currency < min_size * bid0
                }
            };
            if done {
                self.started = false;
                ctx.try_finish("TWAP");
                return;
            }
        }

        // 4. schedule
        let elapsed = Decimal::from(ts_now - st);
        let window = Decimal::from(et - st);
        let mut should_trade = total_size * (elapsed / window);
        if should_trade >= total_size {
            should_trade = total_size;
        }
        let single_amount =
            total_size / window * Decimal::from(ORDER_INTERVAL_SECS);

        let (price, amount, market_price, market_amount, balance_diff);
        if balance_status {
            match (direction, currency_type) {
                (Direction::Sell, CurrencyType::Base) => {
                    let mut p_market = bid0;
                    balance_diff = ini_balance - base_currency;
                    let mut a = if balance_diff >= should_trade {
                        Decimal::ZERO
                    } else {
                        single_amount
                    };
                    let mut a_market =
                        (should_trade - balance_diff - single_amount).max(Decimal::ZERO);
                    if total_size - balance_diff <= Decimal::TWO * single_amount.max(min_size) {
                        a = Decimal::ZERO;
                        p_market = bid0 * (Decimal::ONE - MARKET_ORDER_COEFFICIENT);
                        a_market = total_size - balance_diff;
                    }
                    price = ask0 * (Decimal::ONE + offset);
                    amount = a;
                    market_price = p_market;
                    market_amount = a_market;
                }
                (Direction::Sell, CurrencyType::Quote) => {
                    let p = ask0 * (Decimal::ONE + offset);
                    let mut p_market = bid0;
                    balance_diff = quote_currency - ini_balance;
                    let mut a = if balance_diff >= should_trade {
                        Decimal::ZERO
                    } else {
                        single_amount / p
                    };
                    let mut a_market = ((should_trade - balance_diff - single_amount) / p_market)
                        .max(Decimal::ZERO);
                    if total_size - balance_diff
                        <= Decimal::TWO * single_amount.max(Decimal::TWO * min_size * bid0)
                    {
                        a = Decimal::ZERO;
                        p_market = bid0 * (Decimal::ONE - MARKET_ORDER_COEFFICIENT);
                        a_market = (total_size - balance_diff) / p_market;
                    }
                    price = p;
                    amount = a;
                    market_price = p_market;
                    market_amount = a_market;
                }
                (Direction::Buy, CurrencyType::Quote) => {
                    let p = bid0 * (Decimal::ONE + offset);
                    let mut p_market = ask0;
                    balance_diff = ini_balance - quote_currency;
                    let mut a = if balance_diff >= should_trade {
                        Decimal::ZERO
                    } else {
                        single_amount / p
                    };
                    let mut a_market = ((should_trade - balance_diff - single_amount) / p_market)
                        .max(Decimal::ZERO);
                    if total_size - balance_diff
                        <= Decimal::TWO * single_amount.max(Decimal::TWO * min_size * ask0)
                    {
                        a = Decimal::ZERO;
                        p_market = ask0;
                        a_market = format_amount(
                            (total_size - balance_diff) / p_market,
                            amount_precision,
                        );
                    }
                    price = p;
                    amount = a;
                    market_price = p_market;
                    market_amount = a_market;
                }
                (Direction::Buy, CurrencyType::Base) => {
                    let p = bid0 * (Decimal::ONE + offset);
                    let mut p_market = ask0;
                    balance_diff = base_currency - ini_balance;
                    let mut a = if balance_diff >= should_trade {
                        Decimal::ZERO
                    } else {
                        single_amount
                    };
                    let mut a_market = (should_trade - balance_diff - single_amount
                        + amount_precision)
                        .max(Decimal::ZERO);
                    if total_size - balance_diff <= Decimal::TWO * single_amount.max(min_size) {
                        a = Decimal::ZERO;
                        p_market = ask0 * (Decimal::ONE + MARKET_ORDER_COEFFICIENT);
                        a_market = total_size - balance_diff;
                    }
                    price = p;
                    amount = a;
                    market_price = p_market;
                    market_amount = a_market;
                }
            }
        } else {
            // no balance feedback: send the scheduled slice blind
            balance_diff = Decimal::ZERO;
            if ts_now > et {
                return;
            }
            match direction {
                Direction::Sell => {
                    price = ask0 * (Decimal::ONE + offset);
                    amount = Decimal::ZERO;
                    market_price = bid0;
                    market_amount = match currency_type {
                        CurrencyType::Quote => single_amount / market_price,
                        CurrencyType::Base => single_amount,
                    };
                }
                Direction::Buy => {
                    price = bid0 * (Decimal::ONE + offset);
                    amount = Decimal::ZERO;
                    market_price = ask0;
                    market_amount = match currency_type {
                        CurrencyType::Quote => single_amount / market_price,
                        CurrencyType::Base => single_amount,
                    };
                }
            }
        }

        info!(
            %ini_balance,
            %balance_diff,
            %should_trade,
            "twap slice schedule"
        );

        let threshold = params.price_threshold;
        send_formatted(
            ctx,
            &symbol,
            direction,
            price,
            amount,
            price_precision,
            amount_precision,
            min_size,
            threshold,
            "Twap",
            Some(self.order_delay_ms),
            true,
        );
        send_formatted(
            ctx,
            &symbol,
            direction,
            market_price,
            market_amount,
            price_precision,
            amount_precision,
            min_size,
            threshold,
            "Twap",
            Some(self.order_delay_ms),
            true,
        );
    }
}

impl Default for Twap {
    fn default() -> Self {
        Self::new()
    }
}

/// Format, lift, threshold-check and send one limit order. `lift_to_min`
/// false drops sub-minimum amounts instead of raising them (used for
/// hedge legs that must never over-trade the mid coin).
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_formatted(
    ctx: &mut StrategyCtx<'_>,
    symbol: &str,
    direction: Direction,
    price: Decimal,
    amount: Decimal,
    price_precision: Decimal,
    amount_precision: Decimal,
    min_size: Decimal,
    price_threshold: Option<Decimal>,
    strategy_key: &str,
    delay_ms: Option<i64>,
    lift_to_min: bool,
) {
    let price = format_price(price, price_precision);
    let mut amount = format_amount(amount, amount_precision);
    amount = if lift_to_min {
        amount_adjust(amount, amount_precision, min_size)
    } else if amount > min_size {
        amount_adjust(amount, amount_precision, min_size)
    } else {
        Decimal::ZERO
    };
    if let Some(threshold) = price_threshold {
        let vetoed = match direction {
            Direction::Sell => price < threshold,
            Direction::Buy => price > threshold,
        };
        if vetoed {
            amount = Decimal::ZERO;
        }
    }
    if amount > Decimal::ZERO {
        ctx.send_order(
            symbol,
            price,
            amount,
            direction,
            OrderType::Limit,
            strategy_key,
            delay_ms,
            false,
        );
    }
}

impl Algorithm for Twap {
    fn on_orderbook_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        book: &OrderBook,
    ) {
        if envelope.symbol != ctx.params.symbol.pair() {
            return;
        }
        if let Some(threshold) = ctx.params.orderbook_threshold {
            let (bid0, ask0) = orderbook_price_filter(&book.bids, &book.asks, threshold, 3);
            self.bid0 = bid0;
            self.ask0 = ask0;
        } else {
            self.bid0 = book.best_bid().unwrap_or_default();
            self.ask0 = book.best_ask().unwrap_or_default();
        }
    }

    fn on_timer(&mut self, ctx: &mut StrategyCtx<'_>) {
        if ctx.state.status == TaskStatus::Finished {
            return;
        }
        let interval = Self::slice_interval_secs(ctx.params);
        let now = Local::now().naive_local();
        let due = self
            .last_trigger
            .map(|last| (now - last).num_milliseconds() as f64 / 1000.0 >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_trigger = Some(now);
        if ctx.state.status != TaskStatus::Paused {
            self.run_slice(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn linear_schedule_at_half_window() {
        // total 100 over 100s, 50s elapsed, nothing done yet
        let total = dec!(100);
        let elapsed = dec!(50);
        let window = dec!(100);
        let should_trade = total * (elapsed / window);
        assert_eq!(should_trade, dec!(50));
        let single = total / window * Decimal::from(ORDER_INTERVAL_SECS);
        assert_eq!(single, dec!(60));
        // the passive slice never exceeds the residual
        let residual = total - dec!(0);
        assert_eq!(single.min(residual), dec!(60));
    }

    #[test]
    fn market_coefficient_is_five_percent() {
        assert_eq!(MARKET_ORDER_COEFFICIENT, dec!(0.05));
    }
}
