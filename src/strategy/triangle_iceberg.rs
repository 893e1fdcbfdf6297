//! Iceberg execution across two legs of a triangle.
//!
//! The median leg works the book like a plain iceberg; the anchor leg
//! keeps a hedge inventory in the mid coin sized to twice the median
//! leg's last slice, so the next median fill is always covered. The
//! direction/currency-basis cases below are implemented exactly as
//! enumerated; unlisted combinations are not extrapolated.

use chrono::{Local, NaiveDateTime};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{
    CurrencyType, Direction, MarketDataEnvelope, OrderBook, OrderType, TaskStatus, TradeRole,
    TradeTick,
};
use crate::util::time::{parse_bus_timestamp, parse_window_time};

use super::sizing::{
    anchor_cross_price, blend_order_size, format_amount, format_price, maintain_amount,
    min_order_size, ob_avg_size, price_filter_by_volume,
};
use super::{Algorithm, StrategyCtx};

const ORDER_INTERVAL_SECS: i64 = 5;
const TRADE_WINDOW_SECS: i64 = 60;

pub struct TriangleIceberg {
    books: std::collections::HashMap<String, OrderBook>,
    last_order_time: Option<NaiveDateTime>,
    last_m_price: Decimal,
    last_a_price: Decimal,
    last_m_amount: Decimal,
    median_stop: bool,
    anchor_stop: bool,
    /// True while the price limit allows the median leg to work
    anchor_trading: bool,
    trade_list: Vec<TradeTick>,
}

fn book_key(exchange: &str, symbol: &str, contract_type: &str) -> String {
    format!("{exchange}|{symbol}|{contract_type}|orderbook")
}

fn tick_age_secs(timestamp: &str) -> Option<i64> {
    let ts = parse_bus_timestamp(timestamp)?;
    Some((Local::now().naive_local() - ts).num_seconds())
}

impl TriangleIceberg {
    pub fn new() -> Self {
        Self {
            books: std::collections::HashMap::new(),
            last_order_time: None,
            last_m_price: Decimal::ZERO,
            last_a_price: Decimal::ZERO,
            last_m_amount: Decimal::ZERO,
            median_stop: false,
            anchor_stop: false,
            anchor_trading: false,
            trade_list: Vec::new(),
        }
    }

    fn prune_trades(&mut self) {
        self.trade_list.retain(|t| {
            tick_age_secs(&t.timestamp)
                .map(|a| a <= TRADE_WINDOW_SECS)
                .unwrap_or(false)
        });
    }

    #[allow(clippy::too_many_lines)]
    fn on_median_book(&mut self, ctx: &mut StrategyCtx<'_>, book: &OrderBook) {
        let params = ctx.params;
        let (Some(median), Some(anchor)) = (params.median.as_ref(), params.anchor.as_ref())
        else {
            return;
        };
        let now = Local::now().naive_local();
        if let Some(last) = self.last_order_time {
            if (now - last).num_seconds() < ORDER_INTERVAL_SECS {
                return;
            }
        }
        let anchor_key = book_key(&params.exchange, anchor.pair(), "spot");
        if !self.books.contains_key(&anchor_key) {
            warn!(anchor = anchor.pair(), "no anchor orderbook yet");
            return;
        }

        let m_symbol = median.pair().to_string();
        let Some(m_rule) = params.pair_rule(&m_symbol) else {
            return;
        };
        let m_price_precision = m_rule.price_precision;
        let m_amount_precision = m_rule.size_precision;
        let m_base = median.base().to_string();
        let m_quote = median.quote().to_string();
        let m_direction = params.leg_direction(median);
        let s_base = params.symbol.base().to_string();
        let s_quote = params.symbol.quote().to_string();
        let Some(mid_coin) = params.mid_coin().map(str::to_string) else {
            return;
        };
        let post_only = params.trade_role() == TradeRole::Maker;
        let m_spread = book.spread().unwrap_or_default();

        let (ob_s, raw_price) = match m_direction {
            Direction::Sell => (
                ob_avg_size(&book.asks, 5),
                price_filter_by_volume(&book.asks, params.orderbook_threshold).0,
            ),
            Direction::Buy => (
                ob_avg_size(&book.bids, 5),
                price_filter_by_volume(&book.bids, params.orderbook_threshold).0,
            ),
        };

        let m_price = if post_only && m_spread == m_price_precision {
            raw_price
        } else {
            match m_direction {
                Direction::Buy => raw_price + m_price_precision,
                Direction::Sell => raw_price - m_price_precision,
            }
        };
        let m_price = format_price(m_price, m_price_precision);
        if m_price <= Decimal::ZERO {
            warn!(%m_symbol, %m_price, "median price is invalid");
            return;
        }
        if self.last_a_price <= Decimal::ZERO {
            return;
        }

        // price limit: either a synthetic limit on the nominal pair or a
        // direct one on the median leg
        if let Some(limit) = params.anchor_price {
            let implied = anchor_cross_price(
                m_price,
                self.last_a_price,
                &s_base,
                &m_base,
                &s_quote,
                anchor.quote(),
            );
            let ok = match params.direction {
                Direction::Buy => implied < limit,
                Direction::Sell => implied > limit,
            };
            if !ok {
                self.anchor_trading = false;
                return;
            }
        } else if let Some(limit) = params.price_threshold {
            let ok = match m_direction {
                Direction::Buy => m_price < limit,
                Direction::Sell => m_price > limit,
            };
            if !ok {
                self.anchor_trading = false;
                return;
            }
        }

        self.anchor_trading = true;
        self.last_m_price = m_price;
        let m_min_order_size = min_order_size(
            m_rule.base_min_order_size,
            m_rule.quote_min_order_size,
            m_price,
        );

        // an unanswered send on this leg means wait
        if ctx
            .pending_orders()
            .iter()
            .any(|(_, order)| order.symbol == m_symbol)
        {
            ctx.clear_stale_pending();
            return;
        }
        // one resting order per leg, repriced only off the touch
        let (best_bid, best_ask) = (
            book.best_bid().unwrap_or_default(),
            book.best_ask().unwrap_or_default(),
        );
        for (ref_id, order) in ctx.active_orders() {
            if order.symbol != m_symbol {
                continue;
            }
            if order.price == best_bid || order.price == best_ask {
                return;
            }
            ctx.cancel_order(&ref_id);
            return;
        }

        let tr_s: Decimal = self.trade_list.iter().map(|t| t.size).sum();
        let max_size = ctx
            .shared
            .cfg
            .max_size_by_quote(&m_quote)
            .map(|cap| cap / m_price);
        let m_amount = blend_order_size(ob_s, tr_s, m_min_order_size, max_size);
        debug!(%ob_s, %tr_s, %m_min_order_size, %m_amount, "median sizing");
        self.last_m_amount = m_amount;

        // finish / residual per direction and size basis
        let residual_amount = match (params.direction, params.currency_type) {
            (Direction::Sell, CurrencyType::Base) => {
                let diff = params.initial_balance_of(&s_base) - ctx.total_balance(&s_base);
                let residual = params.total_size - diff;
                info!(%residual, %m_min_order_size, "median residual");
                if residual < m_min_order_size {
                    self.median_stop = true;
                    return;
                }
                residual
            }
            (Direction::Sell, CurrencyType::Quote) => {
                let mid_balance =
                    ctx.total_balance(&mid_coin) - params.initial_balance_of(&mid_coin);
                let mid_to_quote = if mid_coin == anchor.base() {
                    mid_balance * self.last_a_price
                } else {
                    mid_balance / self.last_a_price
                };
                let diff = ctx.total_balance(&s_quote) + mid_to_quote
                    - params.initial_balance_of(&s_quote);
                let s_price = anchor_cross_price(
                    m_price,
                    self.last_a_price,
                    &s_base,
                    &m_base,
                    &s_quote,
                    anchor.quote(),
                );
                if s_price <= Decimal::ZERO {
                    return;
                }
                let residual = (params.total_size - diff) / s_price;
                if residual < m_min_order_size {
                    self.median_stop = true;
                    return;
                }
                residual
            }
            (Direction::Buy, _) => {
                // buys spend the mid coin acquired by the anchor leg
                let mid_balance =
                    ctx.available_balance(&mid_coin) - params.initial_balance_of(&mid_coin);
                let residual = if mid_coin == m_base {
                    mid_balance
                } else {
                    mid_balance / m_price
                };
                if residual < m_min_order_size {
                    if self.anchor_stop {
                        ctx.try_finish("Triangle Iceberg");
                    } else {
                        warn!(%m_min_order_size, "mid coin not funded for the next slice yet");
                    }
                    return;
                }
                residual
            }
        };

        let m_amount = format_amount(m_amount.min(residual_amount), m_amount_precision);
        if m_amount <= Decimal::ZERO {
            return;
        }
        ctx.send_order(
            &m_symbol,
            m_price,
            m_amount,
            m_direction,
            OrderType::Limit,
            "triangle_iceberg",
            None,
            post_only,
        );
        self.last_order_time = Some(now);
    }

    #[allow(clippy::too_many_lines)]
    fn on_anchor_book(&mut self, ctx: &mut StrategyCtx<'_>, book: &OrderBook) {
        let params = ctx.params;
        let (Some(median), Some(anchor)) = (params.median.as_ref(), params.anchor.as_ref())
        else {
            return;
        };
        let a_symbol = anchor.pair().to_string();
        let Some(a_rule) = params.pair_rule(&a_symbol) else {
            return;
        };
        let a_direction = params.leg_direction(anchor);
        let a_base = anchor.base().to_string();
        let s_base = params.symbol.base().to_string();
        let s_quote = params.symbol.quote().to_string();
        let Some(mid_coin) = params.mid_coin().map(str::to_string) else {
            return;
        };

        let side = match a_direction {
            Direction::Sell => &book.asks,
            Direction::Buy => &book.bids,
        };
        let (raw_price, _) = price_filter_by_volume(side, None);
        // rest one tick behind the touch; the anchor leg is a hedge, not
        // a race
        let a_price = match a_direction {
            Direction::Buy => raw_price - a_rule.price_precision,
            Direction::Sell => raw_price + a_rule.price_precision,
        };
        let a_price = format_price(a_price, a_rule.price_precision);
        if a_price <= Decimal::ZERO {
            warn!(%a_symbol, %a_price, "anchor price is invalid");
            return;
        }
        self.last_a_price = a_price;
        if self.last_m_price <= Decimal::ZERO {
            return;
        }
        if !params.transfer_coin {
            return;
        }

        let a_min_order_size = min_order_size(
            a_rule.base_min_order_size,
            a_rule.quote_min_order_size,
            a_price,
        );
        let mut a_amount = Decimal::ZERO;

        match (params.direction, params.currency_type) {
            (Direction::Sell, basis) => {
                // unload whatever the median leg produced in the mid coin
                let mid_balance =
                    ctx.available_balance(&mid_coin) - params.initial_balance_of(&mid_coin);
                a_amount = if mid_coin == a_base {
                    mid_balance
                } else {
                    mid_balance / a_price
                };
                if a_amount < a_min_order_size {
                    if self.median_stop {
                        ctx.try_finish("Triangle Iceberg");
                    } else if basis == CurrencyType::Base {
                        warn!(
                            %mid_balance,
                            %a_min_order_size,
                            "not enough mid coin for the hedge leg yet"
                        );
                    }
                    return;
                }
            }
            (Direction::Buy, CurrencyType::Quote) => {
                if !self.anchor_trading {
                    return;
                }
                let diff =
                    params.initial_balance_of(&s_quote) - ctx.total_balance(&s_quote);
                let residual = params.total_size - diff;
                let residual = if s_quote == a_base {
                    residual
                } else {
                    residual / a_price
                };
                if residual < a_min_order_size {
                    self.anchor_stop = true;
                    return;
                }
                let a_maintain = maintain_amount(
                    self.last_m_amount,
                    self.last_m_price,
                    median.base(),
                    &mid_coin,
                );
                let mid_balance =
                    ctx.total_balance(&mid_coin) - params.initial_balance_of(&mid_coin);
                a_amount = a_maintain - mid_balance;
                if mid_coin != a_base {
                    a_amount /= a_price;
                }
                a_amount = format_amount(a_amount.min(residual), a_rule.size_precision);
                if a_amount < a_min_order_size {
                    info!(%mid_balance, %mid_coin, "hedge inventory is sufficient");
                    return;
                }
            }
            (Direction::Buy, CurrencyType::Base) => {
                if !self.anchor_trading {
                    return;
                }
                let mid_balance =
                    ctx.total_balance(&mid_coin) - params.initial_balance_of(&mid_coin);
                let mid_to_base = if mid_coin == median.base() {
                    mid_balance * self.last_m_price
                } else {
                    mid_balance / self.last_m_price
                };
                let diff = ctx.total_balance(&s_base) + mid_to_base
                    - params.initial_balance_of(&s_base);
                let residual = params.total_size - diff;
                let residual_to_mid = if s_base == median.base() {
                    residual * self.last_m_price
                } else {
                    residual / self.last_m_price
                };
                let residual_to_anchor = if mid_coin == a_base {
                    residual_to_mid
                } else {
                    residual_to_mid / a_price
                };
                if residual_to_anchor < a_min_order_size {
                    self.anchor_stop = true;
                    return;
                }
                let a_maintain = maintain_amount(
                    self.last_m_amount,
                    self.last_m_price,
                    median.base(),
                    &mid_coin,
                );
                a_amount = a_maintain - mid_balance;
                if mid_coin != a_base {
                    a_amount /= a_price;
                }
                a_amount = a_amount.min(residual_to_anchor);
                if a_amount < a_min_order_size {
                    info!(%mid_balance, %mid_coin, "hedge inventory is sufficient");
                    return;
                }
            }
        }

        let a_amount = format_amount(a_amount, a_rule.size_precision);
        if a_amount <= Decimal::ZERO {
            return;
        }
        if ctx
            .pending_orders()
            .iter()
            .any(|(_, order)| order.symbol == a_symbol)
        {
            return;
        }
        let (best_bid, best_ask) = (
            book.best_bid().unwrap_or_default(),
            book.best_ask().unwrap_or_default(),
        );
        for (ref_id, order) in ctx.active_orders() {
            if order.symbol != a_symbol {
                continue;
            }
            if order.price == best_bid || order.price == best_ask {
                return;
            }
            ctx.cancel_order(&ref_id);
            return;
        }
        ctx.send_order(
            &a_symbol,
            a_price,
            a_amount,
            a_direction,
            OrderType::Limit,
            "triangle_iceberg",
            None,
            false,
        );
    }
}

impl Default for TriangleIceberg {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for TriangleIceberg {
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
        let now = Local::now().naive_local();
        if let Some(start) = params.start_time.as_deref().and_then(parse_window_time) {
            if now < start {
                return;
            }
        }
        if !ctx.balance_ready() {
            warn!("balance not received yet, waiting");
            return;
        }
        let key = book_key(&envelope.exchange, &envelope.symbol, &envelope.contract_type);
        self.books.insert(key, book.clone());

        if envelope.exchange != params.exchange {
            return;
        }
        let is_median = params
            .median
            .as_ref()
            .map(|m| m.pair() == envelope.symbol)
            .unwrap_or(false);
        let is_anchor = params
            .anchor
            .as_ref()
            .map(|a| a.pair() == envelope.symbol)
            .unwrap_or(false);
        if is_median {
            self.on_median_book(ctx, book);
        } else if is_anchor {
            self.on_anchor_book(ctx, book);
        }
    }

    fn on_trade_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        trades: &[TradeTick],
    ) {
        let median_pair = ctx
            .params
            .median
            .as_ref()
            .map(|m| m.pair().to_string())
            .unwrap_or_default();
        if envelope.exchange != ctx.params.exchange || envelope.symbol != median_pair {
            return;
        }
        for trade in trades {
            if tick_age_secs(&trade.timestamp)
                .map(|a| a <= TRADE_WINDOW_SECS)
                .unwrap_or(false)
            {
                self.trade_list.push(trade.clone());
            }
        }
    }

    fn on_timer(&mut self, _ctx: &mut StrategyCtx<'_>) {
        self.prune_trades();
    }
}
