//! Iceberg execution.
//!
//! Keeps at most one resting order at the best price, cancel-and-replacing
//! whenever the top of the book moves away from it. Slice size blends
//! book depth with trailing one-minute trade volume. An optional
//! aggressive mode periodically crosses the spread to take liquidity.

use chrono::{Local, NaiveDateTime};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{
    CurrencyType, Direction, MarketDataEnvelope, OrderBook, OrderType, TaskStatus, TradeRole,
    TradeTick,
};
use crate::util::time::{parse_bus_timestamp, parse_window_time};

use super::sizing::{
    blend_order_size, format_amount, format_price, min_order_size, ob_avg_size,
    price_filter_by_volume,
};
use super::{Algorithm, StrategyCtx};

const ORDER_INTERVAL_SECS: i64 = 5;
const AGGRESSIVE_INTERVAL_SECS: i64 = 120;
const TRADE_WINDOW_SECS: i64 = 60;

pub struct Iceberg {
    /// Latest book per `exchange|symbol|contract|orderbook`
    books: std::collections::HashMap<String, OrderBook>,
    last_order_time: Option<NaiveDateTime>,
    aggressive_order_time: NaiveDateTime,
    /// Trades of the trailing minute
    trade_list: Vec<TradeTick>,
}

fn book_key(exchange: &str, symbol: &str, contract_type: &str) -> String {
    format!("{exchange}|{symbol}|{contract_type}|orderbook")
}

fn tick_age_secs(timestamp: &str) -> Option<i64> {
    let ts = parse_bus_timestamp(timestamp)?;
    Some((Local::now().naive_local() - ts).num_seconds())
}

impl Iceberg {
    pub fn new() -> Self {
        Self {
            books: std::collections::HashMap::new(),
            last_order_time: None,
            aggressive_order_time: Local::now().naive_local(),
            trade_list: Vec::new(),
        }
    }

    fn trade_volume_last_minute(&self) -> Decimal {
        self.trade_list.iter().map(|t| t.size).sum()
    }

    fn prune_trades(&mut self) {
        self.trade_list
            .retain(|t| tick_age_secs(&t.timestamp).map(|a| a <= TRADE_WINDOW_SECS).unwrap_or(false));
    }

    /// Residual to execute, in base units at the given price, and the
    /// signed progress so far.
    fn residual(
        ctx: &StrategyCtx<'_>,
        price: Decimal,
    ) -> (Decimal, Decimal) {
        let params = ctx.params;
        match params.currency_type {
            CurrencyType::Quote => {
                let mut diff = ctx.total_balance(params.symbol.quote())
                    - params.initial_balance_of(params.symbol.quote());
                if params.direction == Direction::Buy {
                    diff = -diff;
                }
                (diff, (params.total_size - diff) / price)
            }
            CurrencyType::Base => {
                let mut diff = ctx.total_balance(params.symbol.base())
                    - params.initial_balance_of(params.symbol.base());
                if params.direction == Direction::Sell {
                    diff = -diff;
                }
                (diff, params.total_size - diff)
            }
        }
    }

    fn run_aggressive(&mut self, ctx: &mut StrategyCtx<'_>) {
        let params = ctx.params;
        let now = Local::now().naive_local();
        if let Some(start) = params.start_time.as_deref().and_then(parse_window_time) {
            if now < start {
                return;
            }
        }
        if ctx.state.status == TaskStatus::Paused {
            return;
        }
        if ctx.pending_count() > 0 {
            ctx.clear_stale_pending();
            debug!(pending = ctx.pending_count(), "orders awaiting response");
            return;
        }
        if ctx.active_count() > 1 {
            debug!(active = ctx.active_count(), "active orders outstanding");
            return;
        }
        if (now - self.aggressive_order_time).num_seconds() <= AGGRESSIVE_INTERVAL_SECS {
            return;
        }
        if !ctx.balance_ready() {
            warn!("balance not received yet, waiting");
            return;
        }
        let symbol = params.symbol.pair().to_string();
        let Some(rule) = params.pair_rule(&symbol) else {
            return;
        };
        let key = book_key(&params.exchange, &symbol, params.contract_type());
        let Some(book) = self.books.get(&key) else {
            warn!(%key, "no orderbook cached yet");
            return;
        };
        // cross the spread: take the touch of the opposite side
        let touch = match params.direction {
            Direction::Sell => book.bids.first(),
            Direction::Buy => book.asks.first(),
        };
        let Some(touch) = touch.copied() else {
            return;
        };
        let price = format_price(touch.price, rule.price_precision);
        if price <= Decimal::ZERO {
            return;
        }
        let min_size =
            min_order_size(rule.base_min_order_size, rule.quote_min_order_size, price);
        let mut amount = touch.size;
        if amount < min_size {
            warn!("touch size below exchange minimum, lifting");
            amount = min_size;
        }
        let (diff, residual_amount) = Self::residual(ctx, price);
        if diff.abs() >= params.total_size || residual_amount < min_size {
            ctx.try_finish("Iceberg");
            return;
        }
        amount = format_amount(amount.min(residual_amount), rule.size_precision);
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
                "Iceberg",
                None,
                false,
            );
            self.aggressive_order_time = now;
        }
    }
}

impl Default for Iceberg {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Iceberg {
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
        let key = book_key(&envelope.exchange, &envelope.symbol, &envelope.contract_type);
        self.books.insert(key, book.clone());

        if envelope.exchange != params.exchange || envelope.symbol != params.symbol.pair() {
            return;
        }
        if let Some(last) = self.last_order_time {
            if (now - last).num_seconds() < ORDER_INTERVAL_SECS {
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

        let symbol = params.symbol.pair().to_string();
        let quote = params.symbol.quote().to_string();
        let Some(rule) = params.pair_rule(&symbol) else {
            return;
        };
        let price_precision = rule.price_precision;
        let post_only = params.trade_role() == TradeRole::Maker;
        let spread = book.spread().unwrap_or_default();

        let (ob_s, raw_price) = match params.direction {
            Direction::Sell => (
                ob_avg_size(&book.asks, 5),
                price_filter_by_volume(&book.asks, params.orderbook_threshold).0,
            ),
            Direction::Buy => (
                ob_avg_size(&book.bids, 5),
                price_filter_by_volume(&book.bids, params.orderbook_threshold).0,
            ),
        };

        // step one tick inside unless we are a pure maker in a one-tick
        // market (that would cross)
        let price = if post_only && spread == price_precision {
            raw_price
        } else {
            match params.direction {
                Direction::Buy => raw_price + price_precision,
                Direction::Sell => raw_price - price_precision,
            }
        };
        let price = format_price(price, price_precision);
        if price <= Decimal::ZERO {
            warn!(%symbol, %price, "price is not valid");
            return;
        }

        // one resting order, repriced only when it falls off the touch
        let (best_bid, best_ask) = (
            book.best_bid().unwrap_or_default(),
            book.best_ask().unwrap_or_default(),
        );
        for (ref_id, order) in ctx.active_orders() {
            if order.price == best_bid || order.price == best_ask {
                return;
            }
            ctx.cancel_order(&ref_id);
            return;
        }

        let (diff, residual_amount) = Self::residual(ctx, price);
        let min_size =
            min_order_size(rule.base_min_order_size, rule.quote_min_order_size, price);
        info!(%diff, %residual_amount, %price, %min_size, "iceberg slice");
        if diff.abs() >= params.total_size || residual_amount < min_size {
            ctx.try_finish("Iceberg");
            return;
        }

        let tr_s = self.trade_volume_last_minute();
        let max_size = ctx
            .shared
            .cfg
            .max_size_by_quote(&quote)
            .map(|cap| cap / price);
        let mut amount = blend_order_size(ob_s, tr_s, min_size, max_size);
        debug!(%ob_s, %tr_s, %min_size, ?max_size, %amount, "iceberg sizing");
        if residual_amount - amount < min_size {
            amount = residual_amount;
        }
        amount = format_amount(amount.min(residual_amount), rule.size_precision);
        if amount <= min_size {
            warn!(%amount, %min_size, "amount below exchange minimum");
            return;
        }

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
                "Iceberg",
                None,
                post_only,
            );
            self.last_order_time = Some(now);
        }
    }

    fn on_trade_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        trades: &[TradeTick],
    ) {
        if envelope.exchange != ctx.params.exchange
            || envelope.symbol != ctx.params.symbol.pair()
        {
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

    fn on_timer(&mut self, ctx: &mut StrategyCtx<'_>) {
        self.prune_trades();
        if ctx.state.status == TaskStatus::Finished {
            return;
        }
        if ctx.params.execution_mode == crate::domain::ExecutionMode::Aggressive {
            self.run_aggressive(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::protocol::TradeRequest;
    use crate::config::AppConfig;
    use crate::coordinator::state::{MasterShared, Outbound};
    use crate::domain::{
        AlgorithmKind, BookLevel, ExecutionMode, MarketDataEnvelope, MarketDataKind, Order,
        OrderAction, OrderNotes, PairRule, StrategyParams, SymbolTriple,
    };
    use crate::ledger::OrderEvent;
    use crate::strategy::StrategyState;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn iceberg_params() -> StrategyParams {
        let mut coin_config = HashMap::new();
        coin_config.insert(
            "BTCUSDT".to_string(),
            PairRule {
                base_min_order_size: dec!(0.01),
                quote_min_order_size: Decimal::ZERO,
                price_precision: dec!(0.01),
                size_precision: dec!(0.001),
            },
        );
        let mut initial_balance = HashMap::new();
        initial_balance.insert("BTC".to_string(), dec!(100));
        initial_balance.insert("USDT".to_string(), dec!(0));
        StrategyParams {
            algorithm: AlgorithmKind::Iceberg,
            exchange: "Binance".to_string(),
            account: "trader1".to_string(),
            symbol: SymbolTriple("BTCUSDT".into(), "BTC".into(), "USDT".into()),
            median: None,
            anchor: None,
            direction: Direction::Sell,
            currency_type: CurrencyType::Base,
            total_size: dec!(10),
            price_threshold: None,
            anchor_price: None,
            transfer_coin: false,
            execution_mode: ExecutionMode::Passive,
            exchange_fee: dec!(0.001),
            service_fee: None,
            contract_type: None,
            start_time: Some("2019-06-28 00:00:00".to_string()),
            end_time: None,
            trade_role: Some(crate::domain::TradeRole::Taker),
            order_mode: None,
            fill_ratio: None,
            reference_minute_volume: None,
            fixed_interval_ms: None,
            random_interval_ms: None,
            orderbook_threshold: None,
            strategy_id: "ICEBERG_Binance_BTCUSDT_20190725152929".to_string(),
            initial_balance,
            test_mode: true,
            customer_id: "t".to_string(),
            coin_config,
        }
    }

    fn book(bid: Decimal, ask: Decimal) -> OrderBook {
        OrderBook {
            bids: vec![
                BookLevel { price: bid, size: dec!(3) },
                BookLevel { price: bid - dec!(0.05), size: dec!(5) },
            ],
            asks: vec![
                BookLevel { price: ask, size: dec!(3) },
                BookLevel { price: ask + dec!(0.05), size: dec!(5) },
            ],
            timestamp: None,
        }
    }

    fn envelope() -> MarketDataEnvelope {
        MarketDataEnvelope {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            contract_type: "spot".to_string(),
            data_type: MarketDataKind::Orderbook,
            metadata: serde_json::Value::Null,
            timestamp: crate::util::time::now_bus_timestamp(),
            range: None,
        }
    }

    #[test]
    fn off_best_resting_order_is_cancelled_without_replacement() {
        let cfg = Arc::new(AppConfig::default());
        let params = iceberg_params();
        let sid = params.strategy_id.clone();
        let mut shared = MasterShared::new(
            cfg.clone(),
            "T1".to_string(),
            true,
            true,
            "TestTd:exec_request".to_string(),
            "MM:strategy_alarm".to_string(),
        );
        shared.ledger.ensure_strategy(&sid);
        shared.balances.insert(
            params.exch_account(),
            crate::ledger::BalancePair::with_initial(&params.initial_balance),
        );

        // a resting order at 99.00 while the book has moved to 100.xx
        let order = Order::new(
            "Binance",
            "BTCUSDT",
            "BTC",
            "USDT",
            "spot",
            dec!(99.00),
            dec!(0.5),
            Direction::Sell,
            crate::domain::OrderType::Limit,
            "trader1",
            "Iceberg",
            None,
            false,
            OrderNotes {
                task_id: "T1".to_string(),
                strategy_id: sid.clone(),
            },
        );
        let ref_id = shared.send_order(&sid, order);
        shared.apply_response(
            &sid,
            &ref_id,
            OrderEvent::Accepted {
                order_id: "ex-1".to_string(),
                account_id: "trader1".to_string(),
            },
        );
        shared.outbound.clear();

        let mut state = StrategyState::new(&cfg, &params);
        let mut iceberg = Iceberg::new();
        let mut ctx = StrategyCtx {
            strategy_id: &sid,
            params: &params,
            state: &mut state,
            shared: &mut shared,
        };
        iceberg.on_orderbook_ready(&mut ctx, &envelope(), &book(dec!(100.00), dec!(100.10)));

        let mut cancels = 0;
        let mut sends = 0;
        for outbound in &shared.outbound {
            let Outbound::Publish { payload, .. } = outbound else {
                continue;
            };
            let request: TradeRequest = serde_json::from_str(payload).unwrap();
            match request.action {
                OrderAction::Cancel => cancels += 1,
                OrderAction::Send => sends += 1,
                _ => {}
            }
        }
        assert_eq!(cancels, 1, "exactly one cancel for the off-best order");
        assert_eq!(sends, 0, "no replacement in the same book update");
    }

    #[test]
    fn resting_order_at_the_touch_is_left_alone() {
        let cfg = Arc::new(AppConfig::default());
        let params = iceberg_params();
        let sid = params.strategy_id.clone();
        let mut shared = MasterShared::new(
            cfg.clone(),
            "T1".to_string(),
            true,
            true,
            "TestTd:exec_request".to_string(),
            "MM:strategy_alarm".to_string(),
        );
        shared.ledger.ensure_strategy(&sid);
        shared.balances.insert(
            params.exch_account(),
            crate::ledger::BalancePair::with_initial(&params.initial_balance),
        );
        let order = Order::new(
            "Binance",
            "BTCUSDT",
            "BTC",
            "USDT",
            "spot",
            dec!(100.10),
            dec!(0.5),
            Direction::Sell,
            crate::domain::OrderType::Limit,
            "trader1",
            "Iceberg",
            None,
            false,
            OrderNotes {
                task_id: "T1".to_string(),
                strategy_id: sid.clone(),
            },
        );
        let ref_id = shared.send_order(&sid, order);
        shared.apply_response(
            &sid,
            &ref_id,
            OrderEvent::Accepted {
                order_id: "ex-2".to_string(),
                account_id: "trader1".to_string(),
            },
        );
        shared.outbound.clear();

        let mut state = StrategyState::new(&cfg, &params);
        let mut iceberg = Iceberg::new();
        let mut ctx = StrategyCtx {
            strategy_id: &sid,
            params: &params,
            state: &mut state,
            shared: &mut shared,
        };
        // our ask is still the best ask
        iceberg.on_orderbook_ready(&mut ctx, &envelope(), &book(dec!(100.00), dec!(100.10)));
        assert!(shared.outbound.is_empty());
    }
}
