//! Time-sliced execution across two legs of a triangle.
//!
//! The nominal pair is traded synthetically: a median leg and an anchor
//! leg share the mid coin, and the slice schedule of the main direction
//! is mirrored onto the hedging leg so the mid-coin inventory stays
//! bounded. The direction/currency-basis branches below follow the
//! documented behavior case by case; combinations not enumerated are not
//! extrapolated.

use chrono::Local;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::domain::{
    CurrencyType, Direction, MarketDataEnvelope, OrderBook, StrategyParams, TaskStatus,
};
use crate::util::time::parse_window_time;

use super::sizing::{ceil_to_step, format_amount, min_order_size, price_offset};
use super::twap::send_formatted;
use super::{Algorithm, StrategyCtx};

const MARKET_ORDER_COEFFICIENT: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
const ORDER_INTERVAL_SECS: i64 = 60;

pub struct TriangleTwap {
    started: bool,
    last_trigger: Option<chrono::NaiveDateTime>,
    median_bid0: Decimal,
    median_ask0: Decimal,
    anchor_bid0: Decimal,
    anchor_ask0: Decimal,
    order_delay_ms: i64,
}

impl TriangleTwap {
    pub fn new() -> Self {
        Self {
            started: false,
            last_trigger: None,
            median_bid0: Decimal::ZERO,
            median_ask0: Decimal::ZERO,
            anchor_bid0: Decimal::ZERO,
            anchor_ask0: Decimal::ZERO,
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

    #[allow(clippy::too_many_lines)]
    fn run_slice(&mut self, ctx: &mut StrategyCtx<'_>) {
        let params = ctx.params;
        let (Some(median), Some(anchor)) = (params.median.as_ref(), params.anchor.as_ref())
        else {
            return;
        };
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

        let Some(mid_coin) = params.mid_coin().map(str::to_string) else {
            return;
        };
        if self.median_bid0 <= Decimal::ZERO
            || self.median_ask0 <= Decimal::ZERO
            || self.anchor_bid0 <= Decimal::ZERO
            || self.anchor_ask0 <= Decimal::ZERO
        {
            return;
        }

        let ini_balance = match currency_type {
            CurrencyType::Base => params.initial_balance_of(&base),
            CurrencyType::Quote => params.initial_balance_of(&quote),
        };
        let mid_ini_balance = params.initial_balance_of(&mid_coin);

        let (Some(median_rule), Some(anchor_rule)) = (
            params.pair_rule(median.pair()),
            params.pair_rule(anchor.pair()),
        ) else {
            error!("missing pair rules for triangle legs");
            return;
        };

        // leg roles depend on the task direction: buys acquire the mid
        // coin on the anchor first, sells dispose of the nominal base on
        // the median first
        let (
            symbol_1,
            symbol_2,
            bid0_1,
            ask0_1,
            bid0_2,
            ask0_2,
            direction_1,
            direction_2,
            offset_1,
            offset_2,
            rule_1,
            rule_2,
        );
        if direction == Direction::Buy {
            symbol_1 = anchor.pair().to_string();
            symbol_2 = median.pair().to_string();
            bid0_1 = self.anchor_bid0;
            ask0_1 = self.anchor_ask0;
            bid0_2 = self.median_bid0;
            ask0_2 = self.median_ask0;
            direction_2 = Direction::Buy;
            direction_1 = if anchor.base() == mid_coin {
                Direction::Buy
            } else {
                Direction::Sell
            };
            offset_1 = Decimal::ZERO;
            offset_2 = price_offset(
                direction_2,
                ask0_2,
                bid0_2,
                median_rule.price_precision,
                params.execution_mode,
            );
            rule_1 = anchor_rule;
            rule_2 = median_rule;
        } else {
            symbol_1 = median.pair().to_string();
            symbol_2 = anchor.pair().to_string();
            bid0_1 = self.median_bid0;
            ask0_1 = self.median_ask0;
            bid0_2 = self.anchor_bid0;
            ask0_2 = self.anchor_ask0;
            direction_1 = Direction::Sell;
            direction_2 = if anchor.base() == mid_coin {
                Direction::Sell
            } else {
                Direction::Buy
            };
            offset_1 = price_offset(
                direction_1,
                ask0_1,
                bid0_1,
                median_rule.price_precision,
                params.execution_mode,
            );
            offset_2 = Decimal::ZERO;
            rule_1 = median_rule;
            rule_2 = anchor_rule;
        }

        let price_pre_1 = rule_1.price_precision;
        let amount_pre_1 = rule_1.size_precision;
        let min_size_1 = ceil_to_step(
            min_order_size(rule_1.base_min_order_size, rule_1.quote_min_order_size, bid0_1),
            amount_pre_1,
        );
        let price_pre_2 = rule_2.price_precision;
        let amount_pre_2 = rule_2.size_precision;
        let min_size_2 = ceil_to_step(
            min_order_size(rule_2.base_min_order_size, rule_2.quote_min_order_size, bid0_2),
            amount_pre_2,
        );

        // per-leg price limits: a direct threshold binds the executing
        // leg; an anchor price is converted through the other leg's touch
        let (price_threshold_1, price_threshold_2);
        if direction == Direction::Buy {
            if let Some(threshold) = params.price_threshold {
                price_threshold_1 = None;
                price_threshold_2 = Some(threshold);
            } else if let Some(anchor_price) = params.anchor_price {
                price_threshold_1 = Some(if direction_1 == Direction::Buy {
                    anchor_price / ask0_2
                } else {
                    ask0_2 / anchor_price
                });
                price_threshold_2 = Some(if direction_1 == Direction::Buy {
                    anchor_price / ask0_1
                } else {
                    anchor_price * bid0_1
                });
            } else {
                price_threshold_1 = None;
                price_threshold_2 = None;
            }
        } else if let Some(threshold) = params.price_threshold {
            price_threshold_1 = Some(threshold);
            price_threshold_2 = None;
        } else if let Some(anchor_price) = params.anchor_price {
            price_threshold_1 = Some(if direction_2 == Direction::Sell {
                anchor_price / bid0_2
            } else {
                anchor_price * ask0_2
            });
            price_threshold_2 = Some(if direction_2 == Direction::Sell {
                anchor_price / bid0_1
            } else {
                bid0_1 / anchor_price
            });
        } else {
            price_threshold_1 = None;
            price_threshold_2 = None;
        }

        if !ctx.balance_ready() {
            return;
        }
        let base_currency = ctx.total_balance(&base);
        let quote_currency = ctx.total_balance(&quote);
        let mid_currency = ctx.total_balance(&mid_coin);

        info!(
            %ini_balance,
            %mid_ini_balance,
            %base_currency,
            %quote_currency,
            %mid_currency,
            "triangle twap balances"
        );

        // start gating
        if !self.started {
            if ts_now < st {
                info!("waiting for execution start");
                return;
            }
            match (direction, currency_type) {
                (Direction::Sell, CurrencyType::Base) => {
                    if base_currency <= ini_balance - total_size {
                        error!("balance not enough");
                        return;
                    }
                }
                (Direction::Buy, CurrencyType::Quote) => {
                    if quote_currency >= ini_balance + total_size {
                        error!("quote balance out of range");
                        return;
                    }
                }
                _ => {}
            }
            info!("execution start");
            self.started = true;
        }

        // order hygiene
        if ctx.pending_count() > 4 {
            let n = ctx.pending_count();
            ctx.alarm(
                &format!("too many pending orders: {n}"),
                crate::domain::AlarmCode::ExecuteAbnormal,
            );
            ctx.clear_stale_pending();
        }
        if ctx.active_count() > 0 {
            for ref_id in ctx.active_refs() {
                ctx.cancel_order(&ref_id);
            }
            if ctx.active_count() > 4 {
                let n = ctx.active_count();
                ctx.alarm(
                    &format!("too many active orders: {n}"),
                    crate::domain::AlarmCode::ExecuteAbnormal,
                );
                return;
            }
        }

        // finish checks: the executing leg must have reached its target
        // and the hedge leg must hold no more than dust in the mid coin
        let balance_now;
        let mut finished = false;
        match (direction, currency_type) {
            (Direction::Sell, CurrencyType::Base) => {
                balance_now = base_currency;
                let end_balance = ini_balance - total_size;
                if balance_now < end_balance + min_size_1 || base_currency < min_size_1 {
                    if direction_2 == Direction::Sell
                        && mid_currency - mid_ini_balance < min_size_2
                    {
                        finished = true;
                    }
                    if direction_2 == Direction::Buy
                        && mid_currency - mid_ini_balance < min_size_2 * ask0_2
                    {
                        finished = true;
                    }
                }
            }
            (Direction::Sell, CurrencyType::Quote) => {
                balance_now = quote_currency;
                let end_balance = ini_balance + total_size;
                if balance_now >= end_balance {
                    finished = true;
                }
                if direction_2 == Direction::Sell
                    && base_currency < min_size_1
                    && mid_currency < min_size_2
                {
                    finished = true;
                }
                if direction_2 == Direction::Buy
                    && base_currency < min_size_1
                    && mid_currency < min_size_2 * ask0_2
                {
                    finished = true;
                }
            }
            (Direction::Buy, CurrencyType::Quote) => {
                balance_now = quote_currency;
                let end_balance = ini_balance - total_size;
                if direction_1 == Direction::Sell {
                    if (balance_now < end_balance + min_size_1 || quote_currency < min_size_1)
                        && mid_currency - mid_ini_balance < min_size_1
                    {
                        finished = true;
                    }
                } else if (balance_now < end_balance + min_size_1 * bid0_1
                    || quote_currency < min_size_1 * bid0_1)
                    && mid_currency - mid_ini_balance < min_size_1 * ask0_1
                {
                    finished = true;
                }
            }
            (Direction::Buy, CurrencyType::Base) => {
                balance_now = base_currency;
                let end_balance = ini_balance + total_size;
                if balance_now >= end_balance {
                    finished = true;
                }
                if direction_1 == Direction::Sell
                    && quote_currency < min_size_1
                    && mid_currency < min_size_2 * ask0_2
                {
                    finished = true;
                }
                if direction_1 == Direction::Buy
                    && quote_currency < min_size_1 * ask0_1
                    && mid_currency < min_size_2 * ask0_2
                {
                    finished = true;
                }
            }
        }
        if finished {
            self.started = false;
            ctx.try_finish("Triangle TWAP");
            return;
        }

        // schedule
        let elapsed = Decimal::from(ts_now - st);
        let window = Decimal::from(et - st);
        let mut should_trade = total_size * (elapsed / window);
        if should_trade >= total_size {
            should_trade = total_size;
        }
        let single_amount = total_size / window * Decimal::from(ORDER_INTERVAL_SECS);

        let (price_1, amount_1, market_price_1, market_amount_1);
        let (price_2, amount_2, market_price_2, market_amount_2);
        let balance_diff;

        if direction == Direction::Sell {
            let p1 = ask0_1 * (Decimal::ONE + offset_1);
            let mut mp1 = bid0_1;
            if currency_type == CurrencyType::Base {
                balance_diff = ini_balance - balance_now;
                let mut a1 = if balance_diff >= should_trade - amount_pre_1 {
                    Decimal::ZERO
                } else {
                    single_amount
                };
                let mut ma1 = (should_trade - balance_diff - single_amount).max(Decimal::ZERO);
                if total_size - balance_diff <= Decimal::TWO * single_amount.max(min_size_1) {
                    a1 = Decimal::ZERO;
                    mp1 = bid0_1 * (Decimal::ONE - MARKET_ORDER_COEFFICIENT);
                    ma1 = total_size - balance_diff;
                }
                // hedge leg: unload whatever mid-coin inventory built up
                let (p2, a2) = if direction_2 == Direction::Sell {
                    (bid0_2, mid_currency - mid_ini_balance)
                } else {
                    (
                        ask0_2,
                        format_amount(mid_currency - mid_ini_balance, amount_pre_2) / ask0_2,
                    )
                };
                price_1 = p1;
                amount_1 = a1;
                market_price_1 = mp1;
                market_amount_1 = ma1;
                price_2 = p2;
                amount_2 = a2;
                market_price_2 = bid0_2;
                market_amount_2 = Decimal::ZERO;
            } else {
                balance_diff = balance_now - ini_balance;
                let single_mid_amount = if direction_2 == Direction::Sell {
                    single_amount / bid0_2
                } else {
                    single_amount * ask0_2
                };
                let mut a1 = if balance_diff >= should_trade {
                    Decimal::ZERO
                } else {
                    single_mid_amount / bid0_1
                };
                let market_mid_amount = if direction_2 == Direction::Sell {
                    (should_trade - balance_diff - single_amount) / bid0_2
                } else {
                    (should_trade - balance_diff - single_amount) * ask0_2
                };
                let mut ma1 = (market_mid_amount / bid0_1).max(Decimal::ZERO);
                if total_size - balance_diff
                    <= Decimal::TWO * single_amount.max(min_size_1 * bid0_1)
                {
                    a1 = Decimal::ZERO;
                    let market_mid_amount = if direction_2 == Direction::Sell {
                        (total_size - balance_diff) / bid0_2
                    } else {
                        (total_size - balance_diff) * ask0_2
                    };
                    ma1 = market_mid_amount / bid0_1;
                }
                // hedge leg trades at market as soon as inventory exists
                let (mp2, ma2) = if direction_2 == Direction::Sell {
                    (bid0_2, mid_currency - mid_ini_balance)
                } else {
                    (ask0_2, (mid_currency - mid_ini_balance) / ask0_2)
                };
                price_1 = p1;
                amount_1 = a1;
                market_price_1 = mp1;
                market_amount_1 = ma1;
                price_2 = bid0_2;
                amount_2 = Decimal::ZERO;
                market_price_2 = mp2;
                market_amount_2 = ma2;
            }
        } else {
            let p2 = bid0_2 * (Decimal::ONE + offset_2);
            let mp2 = ask0_2;
            if currency_type == CurrencyType::Quote {
                balance_diff = ini_balance - quote_currency;
                let (p1, mut a1, mp1, ma1, mut a2);
                if direction_1 == Direction::Sell {
                    p1 = bid0_1;
                    a1 = should_trade - (ini_balance - balance_now);
                    mp1 = bid0_1;
                    ma1 = Decimal::ZERO;
                    a2 = (single_amount * bid0_1) / ask0_2;
                } else {
                    p1 = ask0_1;
                    a1 = (should_trade - (ini_balance - balance_now)) / ask0_1;
                    mp1 = ask0_1;
                    ma1 = Decimal::ZERO;
                    a2 = (single_amount / ask0_1) / ask0_2;
                }
                let mut ma2 = (mid_currency - mid_ini_balance) / ask0_2;
                if total_size - balance_diff
                    <= Decimal::TWO * single_amount.max(min_size_1 * bid0_1)
                {
                    a1 = if direction_1 == Direction::Sell {
                        total_size - balance_diff
                    } else {
                        format_amount(total_size - balance_diff, amount_pre_1) / ask0_1
                    };
                    a2 = Decimal::ZERO;
                    ma2 = (mid_currency - mid_ini_balance) / ask0_2;
                }
                price_1 = p1;
                amount_1 = a1;
                market_price_1 = mp1;
                market_amount_1 = ma1;
                price_2 = p2;
                amount_2 = a2;
                market_price_2 = mp2;
                market_amount_2 = ma2;
            } else {
                balance_diff = ini_balance - quote_currency;
                let single_mid_amount = single_amount * ask0_2;
                let (p1, mut a1, mp1, mut ma1);
                if direction_1 == Direction::Sell {
                    p1 = bid0_1;
                    a1 = single_mid_amount / bid0_1;
                    mp1 = bid0_1;
                    ma1 = (should_trade - balance_diff) * ask0_2 / bid0_1 - a1;
                } else {
                    p1 = ask0_1;
                    a1 = single_mid_amount;
                    mp1 = ask0_1;
                    ma1 = (should_trade - balance_diff) * ask0_2 - a1;
                }
                let mut a2 = single_amount;
                let mut ma2 = (mid_currency - mid_ini_balance) / p2 - a2;
                if total_size - balance_diff <= Decimal::TWO * single_amount.max(min_size_1) {
                    ma1 = if direction_1 == Direction::Sell {
                        (total_size - balance_diff) * ask0_2 / bid0_1
                    } else {
                        (total_size - balance_diff) * ask0_2
                    };
                    a1 = Decimal::ZERO;
                    a2 = Decimal::ZERO;
                    ma2 = total_size - balance_diff;
                }
                price_1 = p1;
                amount_1 = a1;
                market_price_1 = mp1;
                market_amount_1 = ma1;
                price_2 = p2;
                amount_2 = a2;
                market_price_2 = mp2;
                market_amount_2 = ma2;
            }
        }

        info!(
            %ini_balance,
            %balance_now,
            %balance_diff,
            %should_trade,
            "triangle twap schedule"
        );

        send_formatted(
            ctx,
            &symbol_1,
            direction_1,
            price_1,
            amount_1,
            price_pre_1,
            amount_pre_1,
            min_size_1,
            price_threshold_1,
            "TriangleTwap",
            Some(self.order_delay_ms),
            true,
        );
        send_formatted(
            ctx,
            &symbol_1,
            direction_1,
            market_price_1,
            market_amount_1,
            price_pre_1,
            amount_pre_1,
            min_size_1,
            price_threshold_1,
            "TriangleTwap",
            Some(self.order_delay_ms),
            true,
        );
        send_formatted(
            ctx,
            &symbol_2,
            direction_2,
            price_2,
            amount_2,
            price_pre_2,
            amount_pre_2,
            min_size_2,
            price_threshold_2,
            "TriangleTwap",
            Some(self.order_delay_ms),
            false,
        );
        send_formatted(
            ctx,
            &symbol_2,
            direction_2,
            market_price_2,
            market_amount_2,
            price_pre_2,
            amount_pre_2,
            min_size_2,
            price_threshold_2,
            "TriangleTwap",
            Some(self.order_delay_ms),
            false,
        );
    }
}

impl Default for TriangleTwap {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for TriangleTwap {
    fn on_orderbook_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        book: &OrderBook,
    ) {
        let params = ctx.params;
        if let Some(median) = &params.median {
            if envelope.symbol == median.pair() {
                self.median_bid0 = book.best_bid().unwrap_or_default();
                self.median_ask0 = book.best_ask().unwrap_or_default();
                return;
            }
        }
        if let Some(anchor) = &params.anchor {
            if envelope.symbol == anchor.pair() {
                self.anchor_bid0 = book.best_bid().unwrap_or_default();
                self.anchor_ask0 = book.best_ask().unwrap_or_default();
            }
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
