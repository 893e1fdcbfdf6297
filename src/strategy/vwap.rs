//! Volume-weighted participation execution.
//!
//! Two sizing modes: `time_based` tracks a projected total market volume
//! over the task window; `participation` takes a fixed share of whatever
//! the market traded in the last minute. Either way at most one order
//! rests at a time.

use chrono::Local;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{
    CurrencyType, Direction, KlineBar, MarketDataEnvelope, OrderBook, OrderType, TaskStatus,
    TradeRole, VwapOrderMode,
};
use crate::util::time::{parse_bus_timestamp, parse_window_time};

use super::sizing::{
    format_amount, format_price, min_order_size, participation_size, price_filter_by_volume,
    vwap_time_target,
};
use super::{Algorithm, StrategyCtx};

pub struct Vwap {
    last_kline_timestamp: String,
    last_kline_vol: Decimal,
    /// Market volume of the last completed minute
    last_kline_size_of_market: Decimal,
    /// Market volume accumulated since start, completed bars only
    market_cum_vol: Decimal,
    /// Our executed volume excluding the current minute
    own_cum_vol_excl_last_minute: Decimal,
    /// Market volume we skipped while below the minimum order size
    unused_market_vol: Decimal,
    unused_marked_at: String,
    last_order_time: Option<chrono::NaiveDateTime>,
}

impl Vwap {
    pub fn new() -> Self {
        Self {
            last_kline_timestamp: String::new(),
            last_kline_vol: Decimal::ZERO,
            last_kline_size_of_market: Decimal::ZERO,
            market_cum_vol: Decimal::ZERO,
            own_cum_vol_excl_last_minute: Decimal::ZERO,
            unused_market_vol: Decimal::ZERO,
            unused_marked_at: String::new(),
            last_order_time: None,
        }
    }

    fn kline_age_secs(&self) -> Option<i64> {
        let bar = parse_bus_timestamp(&self.last_kline_timestamp)?;
        Some((Local::now().naive_local() - bar).num_seconds())
    }
}

impl Default for Vwap {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Vwap {
    fn on_kline_ready(
        &mut self,
        _ctx: &mut StrategyCtx<'_>,
        _envelope: &MarketDataEnvelope,
        bar: &KlineBar,
    ) {
        if self.last_kline_timestamp != bar.timestamp {
            // minute rolled over: book the finished bar
            self.market_cum_vol += self.last_kline_vol;
            self.last_kline_size_of_market = self.last_kline_vol;
            self.last_kline_timestamp = bar.timestamp.clone();
        } else {
            self.last_kline_vol = bar.volume;
        }
    }

    fn on_orderbook_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        book: &OrderBook,
    ) {
        if ctx.state.status == TaskStatus::Paused || ctx.state.status == TaskStatus::Finished {
            return;
        }
        let params = ctx.params;
        let symbol = params.symbol.pair().to_string();
        if envelope.exchange != params.exchange || envelope.symbol != symbol {
            return;
        }
        let now = Local::now().naive_local();
        if let Some(start) = params.start_time.as_deref().and_then(parse_window_time) {
            if now < start {
                return;
            }
        }
        if let Some(last) = self.last_order_time {
            if (now - last).num_seconds() < 3 {
                return;
            }
        }
        if ctx.pending_count() > 0 {
            ctx.clear_stale_pending();
            debug!(pending = ctx.pending_count(), "orders awaiting response");
            return;
        }
        if !ctx.balance_ready() {
            warn!("balance not received yet, waiting");
            return;
        }

        let base = params.symbol.base().to_string();
        let quote = params.symbol.quote().to_string();
        let Some(rule) = params.pair_rule(&symbol) else {
            return;
        };
        let price_precision = rule.price_precision;
        let amount_precision = rule.size_precision;
        let (base_min, quote_min) = (rule.base_min_order_size, rule.quote_min_order_size);

        let bal_diff = ctx.total_balance(&base) - params.initial_balance_of(&base);
        let cum_exec_vol = match params.direction {
            Direction::Buy => bal_diff,
            Direction::Sell => -bal_diff,
        };

        let mode = params.order_mode.unwrap_or(VwapOrderMode::Participation);
        let amount = match mode {
            VwapOrderMode::TimeBased => {
                let Some(end) = params.end_time.as_deref().and_then(parse_window_time) else {
                    return;
                };
                let avg = params.reference_minute_volume.unwrap_or_default();
                let amount = vwap_time_target(
                    avg,
                    self.market_cum_vol,
                    end,
                    now,
                    params.total_size,
                    cum_exec_vol,
                );
                info!(
                    market_cum_vol = %self.market_cum_vol,
                    %cum_exec_vol,
                    %amount,
                    "vwap time-based target"
                );
                amount
            }
            VwapOrderMode::Participation => {
                if let Some(last) = self.last_order_time {
                    if (now - last).num_seconds() < 60 {
                        // participate once per minute
                        return;
                    }
                }
                if self.kline_age_secs().map(|age| age > 120).unwrap_or(true) {
                    // kline feed stalled or never seen; do not chase stale volume
                    self.last_kline_size_of_market = Decimal::ZERO;
                }
                let own_last_minute = cum_exec_vol - self.own_cum_vol_excl_last_minute;
                participation_size(
                    self.last_kline_size_of_market + self.unused_market_vol,
                    own_last_minute,
                    params.fill_ratio.unwrap_or_default(),
                )
            }
        };
        if amount <= Decimal::ZERO {
            // already ahead of the schedule
            return;
        }

        let post_only = params.trade_role() == TradeRole::Maker;
        let side = match params.direction {
            Direction::Sell => &book.bids,
            Direction::Buy => &book.asks,
        };
        let (price, _size) = price_filter_by_volume(side, Some(amount));
        let price = format_price(price, price_precision);
        if price <= Decimal::ZERO {
            warn!(%symbol, %price, "price is not valid");
            return;
        }

        // only ever hold one resting order
        if ctx.active_count() > 0 {
            if let Some((ref_id, _)) = ctx.active_orders().into_iter().next() {
                ctx.cancel_order(&ref_id);
            }
            return;
        }

        let (diff, remain_amount) = match params.currency_type {
            CurrencyType::Quote => {
                let mut diff = ctx.total_balance(&quote) - params.initial_balance_of(&quote);
                if params.direction == Direction::Buy {
                    diff = -diff;
                }
                (diff, (params.total_size - diff) / price)
            }
            CurrencyType::Base => {
                let mut diff = ctx.total_balance(&base) - params.initial_balance_of(&base);
                if params.direction == Direction::Sell {
                    diff = -diff;
                }
                (diff, params.total_size - diff)
            }
        };

        let min_size = min_order_size(base_min, quote_min, price);
        debug!(%remain_amount, %price, %min_size, "vwap residual");

        if diff.abs() >= params.total_size || remain_amount < min_size {
            ctx.try_finish("VWAP");
            return;
        }

        let mut amount = amount;
        if remain_amount - amount < min_size {
            // what would remain is too small to ever trade; take it now
            amount = remain_amount;
        }
        amount = format_amount(amount.min(remain_amount), amount_precision);

        if amount <= min_size {
            debug!(%amount, %min_size, "amount below minimum, banking market volume");
            if self.unused_marked_at != self.last_kline_timestamp
                && self.kline_age_secs().map(|age| age > 60).unwrap_or(false)
            {
                self.unused_market_vol += self.last_kline_size_of_market;
                self.unused_marked_at = self.last_kline_timestamp.clone();
            }
            return;
        }

        self.own_cum_vol_excl_last_minute = cum_exec_vol;
        self.unused_market_vol = Decimal::ZERO;

        let allowed = match params.price_threshold {
            Some(threshold) => match params.direction {
                Direction::Buy => price < threshold,
                Direction::Sell => price > threshold,
            },
            None => true,
        };
        if allowed {
            ctx.send_order(
                &symbol,
                price,
                amount,
                params.direction,
                OrderType::Limit,
                "vwap",
                None,
                post_only,
            );
            self.last_order_time = Some(now);
        }
    }
}
