//! Pluggable execution algorithms.
//!
//! Each algorithm implements [`Algorithm`]; unimplemented hooks default to
//! no-ops. Algorithms never own ledgers or balances — they act through the
//! [`StrategyCtx`] capability handle the coordinator lends them per call.

pub mod context;
pub mod iceberg;
pub mod sizing;
pub mod triangle_iceberg;
pub mod triangle_twap;
pub mod twap;
pub mod vwap;

use chrono::Local;
use rust_decimal::Decimal;

use crate::config::AppConfig;
use crate::domain::{
    AlarmCode, AlgorithmKind, Direction, KlineBar, MarketDataEnvelope, OrderBook, OrderResponse,
    StrategyParams, TaskStatus, TradeTick,
};
use crate::util::time::parse_window_time;

pub use context::StrategyCtx;

/// Lifecycle hooks an execution algorithm may implement.
pub trait Algorithm: Send {
    fn on_orderbook_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        book: &OrderBook,
    ) {
        let _ = (ctx, envelope, book);
    }

    fn on_trade_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        trades: &[TradeTick],
    ) {
        let _ = (ctx, envelope, trades);
    }

    fn on_kline_ready(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        envelope: &MarketDataEnvelope,
        bar: &KlineBar,
    ) {
        let _ = (ctx, envelope, bar);
    }

    fn on_response(&mut self, ctx: &mut StrategyCtx<'_>, response: &OrderResponse) {
        let _ = (ctx, response);
    }

    fn on_timer(&mut self, ctx: &mut StrategyCtx<'_>) {
        let _ = ctx;
    }

    fn on_finish(&mut self, ctx: &mut StrategyCtx<'_>) {
        let _ = ctx;
    }
}

/// Instantiate the algorithm named by a strategy entry.
pub fn build(kind: AlgorithmKind) -> Box<dyn Algorithm> {
    match kind {
        AlgorithmKind::Twap => Box::new(twap::Twap::new()),
        AlgorithmKind::Vwap => Box::new(vwap::Vwap::new()),
        AlgorithmKind::Iceberg => Box::new(iceberg::Iceberg::new()),
        AlgorithmKind::TriangleTwap => Box::new(triangle_twap::TriangleTwap::new()),
        AlgorithmKind::TriangleIceberg => Box::new(triangle_iceberg::TriangleIceberg::new()),
    }
}

/// Coordinator-side bookkeeping for one running strategy instance.
#[derive(Debug, Clone)]
pub struct StrategyState {
    pub status: TaskStatus,
    pub status_msg: String,
    /// Reference price derived from the latest orderbook, by direction
    pub current_price: Option<Decimal>,
    /// Mid price of the anchor leg (triangles); zero until first seen
    pub anchor_ref_price: Decimal,
    pub deal_size: Decimal,
    deal_size_snapshot: Decimal,
    deal_size_not_updated_secs: i64,
    deal_size_alarm_interval_secs: i64,
    pub attention: bool,
    pub finish_flag: bool,
    on_time_count: u64,
    inspect_interval_secs: u64,
}

impl StrategyState {
    pub fn new(cfg: &AppConfig, params: &StrategyParams) -> Self {
        let base = cfg.timer_interval_secs;
        // exchanges that push order updates get a much slower active poll
        let inspect = if cfg.order_update_enabled(&params.exchange) {
            base * 20
        } else {
            base
        };
        Self {
            status: TaskStatus::Running,
            status_msg: "task is running".to_string(),
            current_price: None,
            anchor_ref_price: Decimal::ZERO,
            deal_size: Decimal::ZERO,
            deal_size_snapshot: Decimal::ZERO,
            deal_size_not_updated_secs: 0,
            deal_size_alarm_interval_secs: 600,
            attention: false,
            finish_flag: false,
            on_time_count: 0,
            inspect_interval_secs: inspect,
        }
    }

    /// Rate-limit feedback: back off the active poll multiplicatively.
    pub fn slow_down_inspection(&mut self) -> u64 {
        self.inspect_interval_secs = (self.inspect_interval_secs * 2).min(3600);
        self.inspect_interval_secs
    }

    pub fn inspect_interval_secs(&self) -> u64 {
        self.inspect_interval_secs
    }
}

/// Per-tick maintenance shared by every algorithm. Runs before the
/// algorithm's own `on_timer`.
pub fn run_common_timer(ctx: &mut StrategyCtx<'_>) {
    inspect_orders_on_time(ctx);
    check_deal_size(ctx);
    check_end_time(ctx);
    if ctx.params.algorithm.is_triangle() {
        check_middle_size(ctx);
    }
}

/// Poll every active order once the inspection interval has elapsed.
fn inspect_orders_on_time(ctx: &mut StrategyCtx<'_>) {
    let tick = ctx.timer_interval_secs();
    ctx.state.on_time_count += 1;
    if ctx.state.on_time_count * tick < ctx.state.inspect_interval_secs {
        return;
    }
    ctx.state.on_time_count = 0;
    for ref_id in ctx.active_refs() {
        ctx.inspect_order(&ref_id);
    }
}

/// Flag strategies whose deal size has been frozen while price conditions
/// would have allowed trading.
fn check_deal_size(ctx: &mut StrategyCtx<'_>) {
    if ctx.state.status == TaskStatus::Paused {
        return;
    }
    if ctx.state.deal_size_snapshot != ctx.state.deal_size {
        ctx.state.deal_size_snapshot = ctx.state.deal_size;
        ctx.state.attention = false;
        ctx.state.deal_size_not_updated_secs = 0;
        return;
    }

    if ctx.state.deal_size_not_updated_secs > ctx.state.deal_size_alarm_interval_secs {
        ctx.state.attention = true;
        ctx.state.deal_size_not_updated_secs = 0;

        if !ctx.params.test_mode {
            let msg = "Deal size not updated for 10 minutes";
            match ctx.params.algorithm {
                AlgorithmKind::Iceberg => {
                    if ctx.active_count() == 0 {
                        ctx.alarm(msg, AlarmCode::DealSizeStalled);
                    }
                }
                kind => {
                    if kind == AlgorithmKind::Twap {
                        ctx.state.deal_size_alarm_interval_secs += 300;
                    }
                    ctx.alarm(msg, AlarmCode::DealSizeStalled);
                }
            }
        }
    }

    let Some(current) = ctx.state.current_price else {
        // no market data yet
        ctx.state.deal_size_not_updated_secs += ctx.timer_interval_secs() as i64;
        return;
    };
    let tick = ctx.timer_interval_secs() as i64;
    let anchor = ctx.params.anchor_price;
    let threshold = ctx.params.price_threshold;
    match ctx.params.direction {
        Direction::Buy => {
            if anchor.map(|a| a > current).unwrap_or(false) {
                ctx.state.deal_size_not_updated_secs += tick;
            }
            if threshold.map(|t| t > current).unwrap_or(true) {
                ctx.state.deal_size_not_updated_secs += tick;
            }
        }
        Direction::Sell => {
            if anchor.map(|a| a < current).unwrap_or(false) {
                ctx.state.deal_size_not_updated_secs += tick;
            }
            if threshold.map(|t| t < current).unwrap_or(true) {
                ctx.state.deal_size_not_updated_secs += tick;
            }
        }
    }
}

/// Alarm when an execution keeps running well past its declared end.
fn check_end_time(ctx: &mut StrategyCtx<'_>) {
    if ctx.params.test_mode || ctx.state.status == TaskStatus::Paused {
        return;
    }
    let Some(end) = ctx.params.end_time.as_deref().and_then(parse_window_time) else {
        return;
    };
    let now = Local::now().naive_local();
    if (now - end).num_seconds() > 300 {
        ctx.alarm(
            "Execution has not ended after end_time",
            AlarmCode::ExecuteAbnormal,
        );
    }
}

/// Triangles: the hedging inventory in the mid coin must stay bounded.
fn check_middle_size(ctx: &mut StrategyCtx<'_>) {
    if ctx.params.test_mode {
        return;
    }
    let Some(mid_coin) = ctx.params.mid_coin().map(str::to_string) else {
        return;
    };
    let initial = ctx.params.initial_balance_of(&mid_coin);
    let now = ctx.total_balance(&mid_coin);
    if let Some(cap) = ctx.shared.cfg.max_size_by_quote(&mid_coin) {
        if now - initial > cap {
            let excess = now - initial;
            ctx.alarm(
                &format!("mid_coin balance abnormal: {excess} {mid_coin}"),
                AlarmCode::ExecuteAbnormal,
            );
        }
    }
}
