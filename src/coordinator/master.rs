//! The per-task coordinator.
//!
//! Owns the order ledger, the balance books, and the running strategy
//! instances. One cooperative loop polls the bus, drains queued outgoing
//! requests in arrival order, and drives the fixed-interval timer; no two
//! callbacks run concurrently, so shared state needs ordering, not locks.
//! An error while handling one message is logged and isolated — it never
//! stops subsequent processing.

use chrono::Local;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::protocol::{BalancePush, GatewayOrderInfo, OrderUpdatePush, TradeResponse};
use crate::bus::{Bus, BusMessage, ChannelPlan};
use crate::config::AppConfig;
use crate::domain::{
    AlarmCode, AlgorithmKind, CurrencyType, Direction, MarketDataEnvelope, MarketDataKind, Order,
    OrderAction, OrderBook, OrderNotes, OrderResponse, OrderStatus, OrderType, Task, TaskStatus,
};
use crate::error::{GatewayErrorKind, Result, SlicerError};
use crate::ledger::{BalancePair, LedgerOutcome, OrderEvent};
use crate::persistence::SnapshotStore;
use crate::report::{aggregate, ReportSink};
use crate::strategy::sizing::format_price;
use crate::strategy::{run_common_timer, Algorithm, StrategyCtx, StrategyState};
use crate::util::time::{bus_timestamp_age_secs, is_bus_timestamp, now_window_time};
use crate::util::{local_ip, pid};

use super::command::{
    CommandEnvelope, CommandKind, CommandResponse, DeleteArgs, ExportStatisticsArgs, OrderRefArgs,
    ResumeArgs, SendOrderArgs, StatisticsArgs,
};
use super::state::{MasterShared, OrderRef, Outbound};
use super::status::{Notification, StatusSnapshot, StrategyStatus};
use super::subscriptions::Subscriptions;

/// One running strategy: its parameters, bookkeeping, and the algorithm.
pub struct StrategyRuntime {
    pub params: crate::domain::StrategyParams,
    pub state: StrategyState,
    pub algo: Box<dyn Algorithm>,
}

/// Resolved channel names for this task instance.
struct Channels {
    trade_response: String,
    command: String,
    command_response: String,
    status: String,
    notification: String,
    market_subscribe_request: String,
    order_update_subscribe_request: String,
    poll_position_request: String,
}

pub struct Coordinator {
    cfg: Arc<AppConfig>,
    task: Task,
    shared: MasterShared,
    strategies: HashMap<String, StrategyRuntime>,
    subscriptions: Subscriptions,
    channels: Channels,
    store: SnapshotStore,
    report: Box<dyn ReportSink>,
    valid_exchanges: HashSet<String>,
    valid_accounts: HashSet<String>,
    ip: String,
    pid: u32,
    finishing: bool,
    init_error: Option<String>,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<AppConfig>,
        mut task: Task,
        store: SnapshotStore,
        report: Box<dyn ReportSink>,
        log_link: Option<String>,
    ) -> Self {
        let plan = ChannelPlan::new(&cfg.channels, task.test_mode);
        let channels = Channels {
            trade_response: plan.trade_response(&cfg.strategy_name),
            command: plan.task_command(),
            command_response: plan.task_command_response(),
            status: plan.task_status(),
            notification: plan.notification(),
            market_subscribe_request: plan.market_subscribe_request(),
            order_update_subscribe_request: plan.order_update_subscribe_request(),
            poll_position_request: plan.poll_position_request(),
        };
        let shared = MasterShared::new(
            cfg.clone(),
            task.task_id.clone(),
            task.test_mode,
            task.alarm,
            plan.trade_request(&cfg.strategy_name),
            plan.alarm(),
        );

        let init_error = task.resolve(&cfg).err().map(|e| e.to_string());

        let mut coordinator = Self {
            cfg: cfg.clone(),
            shared,
            strategies: HashMap::new(),
            subscriptions: Subscriptions::default(),
            channels,
            store,
            report,
            valid_exchanges: HashSet::new(),
            valid_accounts: HashSet::new(),
            ip: local_ip(),
            pid: pid(),
            finishing: false,
            init_error,
            task,
        };
        if coordinator.init_error.is_none() {
            coordinator.init_state(&plan);
        }
        // first command response: the task is up (with its log location)
        let response = CommandResponse {
            task_id: coordinator.task.task_id.clone(),
            kind: CommandKind::Start,
            client_id: json!(0),
            status: coordinator.shared.status,
            result: coordinator.init_error.is_none(),
            msg: json!(log_link.unwrap_or_default()),
        };
        let channel = coordinator.channels.command_response.clone();
        coordinator.shared.publish_json(&channel, &response);
        coordinator
    }

    fn init_state(&mut self, plan: &ChannelPlan<'_>) {
        // seed the dual balance books from the declared holdings
        for (exch_account, initial) in &self.task.initial_balance {
            self.shared
                .balances
                .insert(exch_account.clone(), BalancePair::with_initial(initial));
        }

        // resume in-flight orders from the previous run of this task id
        match self.store.take(&self.task.task_id) {
            Ok(Some(snapshot)) => {
                info!("reloading order snapshot from previous run");
                self.shared.ledger.restore(snapshot);
                for strategy_id in self.shared.ledger.strategy_ids() {
                    let refs: Vec<(String, String, String, String)> = self
                        .shared
                        .ledger
                        .active_of(&strategy_id)
                        .filter_map(|(ref_id, order)| {
                            order.order_id.as_ref().map(|oid| {
                                (
                                    ref_id.clone(),
                                    order.exchange.clone(),
                                    order.symbol.clone(),
                                    oid.clone(),
                                )
                            })
                        })
                        .collect();
                    for (ref_id, exchange, symbol, order_id) in refs {
                        self.shared.order_index.insert(
                            format!("{exchange}|{symbol}|{order_id}"),
                            OrderRef {
                                strategy_id: strategy_id.clone(),
                                ref_id,
                            },
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "order snapshot could not be loaded"),
        }

        let entries: Vec<(String, crate::domain::StrategyParams)> = self
            .task
            .strategies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (strategy_id, params) in entries {
            self.shared.ledger.ensure_strategy(&strategy_id);
            self.valid_exchanges.insert(params.exchange.clone());
            self.valid_accounts.insert(params.account.clone());
            self.register_subscriptions(plan, &params);
            let state = StrategyState::new(&self.cfg, &params);
            let algo = crate::strategy::build(params.algorithm);
            self.strategies
                .insert(strategy_id, StrategyRuntime { params, state, algo });
        }

        // ask the gateway to start feeding the subscribed market channels
        let topics: Vec<String> = self
            .subscriptions
            .market
            .keys()
            .filter_map(|ch| ch.split_once(':').map(|(_, topic)| topic.to_string()))
            .collect();
        let channel = self.channels.market_subscribe_request.clone();
        self.shared.publish_json(&channel, &topics);
    }

    fn register_subscriptions(&mut self, plan: &ChannelPlan<'_>, params: &crate::domain::StrategyParams) {
        self.subscriptions
            .trade
            .insert(self.channels.trade_response.clone());
        self.subscriptions
            .balance
            .insert(plan.balance_push(&params.exchange, &params.account));

        // kick off the scheduled balance pushes for this account
        let poll_channel = self.channels.poll_position_request.clone();
        if params.test_mode {
            self.shared.publish_json(&poll_channel, params);
        } else {
            self.shared.push(Outbound::Publish {
                channel: poll_channel,
                payload: params.exch_account(),
            });
            if self.cfg.order_update_enabled(&params.exchange) {
                let channel = self.channels.order_update_subscribe_request.clone();
                self.shared
                    .publish_json(&channel, &params.exch_account());
                self.subscriptions
                    .order_update
                    .entry(plan.order_update_push(&params.exchange, &params.account))
                    .or_default();
            }
        }

        let contract_type = params.contract_type().to_string();
        if !params.algorithm.is_triangle() {
            self.subscriptions
                .market
                .entry(plan.market_orderbook(&params.exchange, params.symbol.pair(), &contract_type))
                .or_default();
        }
        if let Some(median) = &params.median {
            self.subscriptions
                .market
                .entry(plan.market_orderbook(&params.exchange, median.pair(), &contract_type))
                .or_default();
        }
        if let Some(anchor) = &params.anchor {
            self.subscriptions
                .market
                .entry(plan.market_orderbook(&params.exchange, anchor.pair(), &contract_type))
                .or_default();
        }
        if params.algorithm == AlgorithmKind::Iceberg {
            self.subscriptions
                .market
                .entry(plan.market_trade(&params.exchange, params.symbol.pair(), &contract_type))
                .or_default();
        }
        if params.algorithm == AlgorithmKind::Vwap {
            self.subscriptions
                .market
                .entry(plan.market_kline_1m(&params.exchange, params.symbol.pair(), &contract_type))
                .or_default();
        }
    }

    /// Drive the coordinator until the task reaches a terminal state.
    pub async fn run(mut self, bus: Arc<dyn Bus>) -> Result<()> {
        if let Some(msg) = self.init_error.take() {
            error!(%msg, "task failed validation");
            self.error_exit(&msg);
        }

        let mut channels = self.subscriptions.all_channels();
        channels.push(self.channels.command.clone());
        let mut stream = bus.subscribe(&channels).await?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.timer_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.drain_outbound(bus.as_ref()).await? {
                info!("coordinator exiting");
                return Ok(());
            }
            tokio::select! {
                maybe = stream.recv() => match maybe {
                    Some(msg) => self.dispatch(msg),
                    None => return Err(SlicerError::Bus("subscription stream closed".into())),
                },
                _ = ticker.tick() => self.on_timer(),
            }
        }
    }

    /// Publish queued requests in arrival order; true once Exit was seen
    /// and everything before it is flushed.
    async fn drain_outbound(&mut self, bus: &dyn Bus) -> Result<bool> {
        let mut exit = false;
        while let Some(outbound) = self.shared.outbound.pop_front() {
            match outbound {
                Outbound::Publish { channel, payload } => {
                    bus.publish(&channel, payload).await?;
                }
                Outbound::Exit => exit = true,
            }
        }
        Ok(exit)
    }

    fn dispatch(&mut self, msg: BusMessage) {
        let channel = msg.channel.clone();
        let result = if channel == self.channels.trade_response {
            self.handle_trade_response(&msg.payload)
        } else if channel == self.channels.command {
            self.handle_command(&msg.payload)
        } else if self.subscriptions.balance.contains(&channel) {
            self.handle_balance_push(&msg.payload)
        } else if self.subscriptions.order_update.contains_key(&channel) {
            self.handle_order_update(&msg.payload)
        } else if self.subscriptions.market.contains_key(&channel)
            || channel.starts_with(&format!("{}:", self.cfg.channels.market_scope))
        {
            self.handle_market_data(&msg.payload)
        } else {
            debug!(%channel, "message on unrouted channel");
            Ok(())
        };
        // one bad message must not take the task down
        if let Err(e) = result {
            error!(%channel, error = %e, "message handling failed");
        }
    }

    fn with_strategy<F>(&mut self, strategy_id: &str, f: F)
    where
        F: FnOnce(&mut Box<dyn Algorithm>, &mut StrategyCtx<'_>),
    {
        let Some(rt) = self.strategies.get_mut(strategy_id) else {
            return;
        };
        let mut ctx = StrategyCtx {
            strategy_id,
            params: &rt.params,
            state: &mut rt.state,
            shared: &mut self.shared,
        };
        f(&mut rt.algo, &mut ctx);
    }

    // ------------------------------------------------------------------
    // market data

    fn market_channel_for(&self, env: &MarketDataEnvelope) -> Option<String> {
        let scope = &self.cfg.channels.market_scope;
        let key = match env.data_type {
            MarketDataKind::Orderbook => format!(
                "{scope}:{}|{}|{}|orderbook|20",
                env.exchange, env.symbol, env.contract_type
            ),
            MarketDataKind::Trade => format!(
                "{scope}:{}|{}|{}|trade",
                env.exchange, env.symbol, env.contract_type
            ),
            MarketDataKind::Kline => format!(
                "{scope}:{}|{}|{}|kline||1m",
                env.exchange, env.symbol, env.contract_type
            ),
            _ => return None,
        };
        Some(key)
    }

    fn handle_market_data(&mut self, payload: &str) -> Result<()> {
        let env: MarketDataEnvelope = serde_json::from_str(payload)?;
        let known_symbol = self
            .strategies
            .values()
            .any(|rt| rt.params.triple_for(&env.symbol).is_some());
        if !known_symbol || !self.valid_exchanges.contains(&env.exchange) {
            return Ok(());
        }
        if !is_bus_timestamp(&env.timestamp) {
            error!(timestamp = %env.timestamp, "market data timestamp malformed");
            return Ok(());
        }

        let book = if env.data_type == MarketDataKind::Orderbook {
            let book = env.orderbook()?;
            self.update_reference_prices(&env, &book);
            if !self.check_price_precision(&env, &book) {
                return Ok(());
            }
            Some(book)
        } else {
            None
        };

        if self.shared.status == TaskStatus::Paused {
            return Ok(());
        }

        // freshness: one alarm per staleness episode, stale ticks dropped
        let age = bus_timestamp_age_secs(&env.timestamp).unwrap_or(0.0);
        let stale = age > self.cfg.staleness.tick_tolerance_secs as f64;
        if let Some(channel) = self.market_channel_for(&env) {
            if let Some(health) = self.subscriptions.market.get_mut(&channel) {
                if stale {
                    if health.note_stale_tick() {
                        let msg = format!(
                            "{} {} market info is {age:.1}s old",
                            env.exchange, env.symbol
                        );
                        self.shared.alarm(&msg, AlarmCode::DataOutdated);
                    }
                    return Ok(());
                }
                health.touch();
            }
        } else if stale {
            return Ok(());
        }

        let ids: Vec<String> = self
            .strategies
            .iter()
            .filter(|(_, rt)| rt.params.triple_for(&env.symbol).is_some())
            .map(|(id, _)| id.clone())
            .collect();
        match env.data_type {
            MarketDataKind::Orderbook => {
                let book = match book {
                    Some(book) => book,
                    None => env.orderbook()?,
                };
                for id in ids {
                    self.with_strategy(&id, |algo, ctx| algo.on_orderbook_ready(ctx, &env, &book));
                }
            }
            MarketDataKind::Trade => {
                let trades = env.trades()?;
                for id in ids {
                    self.with_strategy(&id, |algo, ctx| algo.on_trade_ready(ctx, &env, &trades));
                }
            }
            MarketDataKind::Kline => {
                let bar = env.kline()?;
                for id in ids {
                    self.with_strategy(&id, |algo, ctx| algo.on_kline_ready(ctx, &env, &bar));
                }
            }
            other => debug!(?other, "market data kind without a strategy hook"),
        }
        Ok(())
    }

    /// Recompute each strategy's reference price from the book: the touch
    /// by direction for single-leg strategies, the cross through the
    /// anchor for triangles.
    fn update_reference_prices(&mut self, env: &MarketDataEnvelope, book: &OrderBook) {
        let (Some(bid0), Some(ask0)) = (book.best_bid(), book.best_ask()) else {
            return;
        };
        for rt in self.strategies.values_mut() {
            let params = &rt.params;
            let touch = match params.direction {
                Direction::Buy => ask0,
                Direction::Sell => bid0,
            };
            if !params.algorithm.is_triangle() && env.symbol == params.symbol.pair() {
                rt.state.current_price = Some(touch);
            }
            if let Some(median) = &params.median {
                if env.symbol == median.pair() {
                    if params.anchor_price.is_none() {
                        rt.state.current_price = Some(touch);
                    }
                    if rt.state.anchor_ref_price <= Decimal::ZERO {
                        // no anchor price seen yet; the cross is undefined
                        rt.state.current_price = None;
                    } else {
                        let precision = params
                            .pair_rule(median.pair())
                            .map(|r| r.price_precision)
                            .unwrap_or_default();
                        let median_mid = format_price((ask0 + bid0) / Decimal::TWO, precision);
                        let cross = if median.quote() == params.symbol.quote() {
                            median_mid * rt.state.anchor_ref_price
                        } else {
                            median_mid / rt.state.anchor_ref_price
                        };
                        rt.state.current_price = Some(cross.round_dp(8));
                    }
                }
            }
            if let Some(anchor) = &params.anchor {
                if env.symbol == anchor.pair() {
                    let precision = params
                        .pair_rule(anchor.pair())
                        .map(|r| r.price_precision)
                        .unwrap_or_default();
                    rt.state.anchor_ref_price =
                        format_price((ask0 + bid0) / Decimal::TWO, precision);
                }
            }
        }
    }

    /// Top-of-book prices must land on the advertised tick; a mismatch
    /// means the pair rule is wrong and sizing cannot be trusted.
    fn check_price_precision(&mut self, env: &MarketDataEnvelope, book: &OrderBook) -> bool {
        let Some(rule) = self
            .task
            .coin_config
            .get(&env.exchange)
            .and_then(|pairs| pairs.get(&env.symbol))
        else {
            return true;
        };
        let Some(ask0) = book.best_ask() else {
            return true;
        };
        if rule.price_precision <= Decimal::ZERO {
            return true;
        }
        let ratio = ask0 / rule.price_precision;
        let frac = ratio.fract().abs();
        let tolerance = Decimal::new(1, 8);
        if frac > tolerance && (Decimal::ONE - frac) > tolerance {
            let msg = format!(
                "{} {} price precision error! Ask0: {ask0}, price precision: {}",
                env.exchange, env.symbol, rule.price_precision
            );
            self.shared.alarm(&msg, AlarmCode::ExecuteAbnormal);
            self.shared
                .mark_warning(&format!("{} price precision error", env.symbol));
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // gateway responses

    fn handle_trade_response(&mut self, payload: &str) -> Result<()> {
        let resp: TradeResponse = serde_json::from_str(payload)?;
        // responses without a request echo are not order traffic
        let Some(echo) = resp.metadata.request.clone() else {
            return Ok(());
        };
        let Some(echo_task) = echo.task_id else {
            return Ok(());
        };
        if resp.strategy != self.shared.strategy_name || echo_task != self.shared.task_id {
            return Ok(());
        }
        debug!(raw = payload, "gateway response");
        let strategy_id = echo.strategy_id.unwrap_or_default();

        let Some(origin) = self.shared.ledger.get(&strategy_id, &resp.ref_id) else {
            warn!(
                %strategy_id,
                ref_id = %resp.ref_id,
                "response for unknown reference id skipped"
            );
            return Ok(());
        };
        let origin_quantity = origin.quantity;
        let origin_price = origin.price;
        let origin_filled = origin.filled;
        let origin_avg = origin.avg_price;
        let origin_direction = origin.direction;
        let origin_account = origin.account_id.clone();
        let origin_symbol = origin.symbol.clone();

        let gateway = resp.metadata.metadata.clone();
        let mut response = OrderResponse {
            strategy_id: strategy_id.clone(),
            ref_id: resp.ref_id.clone(),
            action: resp.action,
            task_id: self.shared.task_id.clone(),
            exchange: if resp.metadata.exchange.is_empty() {
                self.task
                    .strategies
                    .get(&strategy_id)
                    .map(|p| p.exchange.clone())
                    .unwrap_or_default()
            } else {
                resp.metadata.exchange.clone()
            },
            account_id: gateway.account_id.clone().unwrap_or(origin_account),
            symbol: if resp.metadata.symbol.is_empty() {
                origin_symbol
            } else {
                resp.metadata.symbol.clone()
            },
            contract_type: resp.metadata.contract_type.clone(),
            timestamp: resp.metadata.timestamp.clone(),
            status: OrderStatus::Pending,
            direction: origin_direction,
            original_amount: origin_quantity,
            original_price: origin_price,
            filled: Decimal::ZERO,
            avg_executed_price: Decimal::ZERO,
            order_id: gateway.order_id.clone(),
        };

        match resp.metadata.event {
            OrderAction::Send => {
                if !gateway.result {
                    self.note_gateway_failure(
                        OrderAction::Send,
                        gateway.error_code.as_deref().unwrap_or("999999"),
                        gateway.error_code_msg.as_deref().unwrap_or(""),
                        Some(&strategy_id),
                    );
                    let outcome =
                        self.shared
                            .apply_response(&strategy_id, &resp.ref_id, OrderEvent::Rejected);
                    if outcome == LedgerOutcome::Applied(OrderStatus::Rejected) {
                        response.status = OrderStatus::Rejected;
                        self.dispatch_response(&response);
                    }
                    return Ok(());
                }
                let Some(order_id) = gateway.order_id.clone() else {
                    warn!(ref_id = %resp.ref_id, "accepted send without an order id");
                    return Ok(());
                };
                if self.cfg.order_update_enabled(&response.exchange) {
                    self.shared.order_index.insert(
                        format!("{}|{}|{order_id}", response.exchange, response.symbol),
                        OrderRef {
                            strategy_id: strategy_id.clone(),
                            ref_id: resp.ref_id.clone(),
                        },
                    );
                }
                let outcome = self.shared.apply_response(
                    &strategy_id,
                    &resp.ref_id,
                    OrderEvent::Accepted {
                        order_id,
                        account_id: response.account_id.clone(),
                    },
                );
                if outcome == LedgerOutcome::Applied(OrderStatus::Submitted) {
                    self.shared.note_gateway_ok();
                    response.status = OrderStatus::Submitted;
                    self.dispatch_response(&response);
                }
            }

            OrderAction::Cancel => {
                if self
                    .shared
                    .ledger
                    .get_active_mut(&strategy_id, &resp.ref_id)
                    .is_none()
                {
                    return Ok(());
                }
                if !gateway.result {
                    // the order already terminated; reset the latch so a
                    // later cancel can retry, then poll the truth
                    if let Some(order) =
                        self.shared.ledger.get_active_mut(&strategy_id, &resp.ref_id)
                    {
                        order.pending_cancel = false;
                    }
                    self.note_gateway_failure(
                        OrderAction::Cancel,
                        gateway.error_code.as_deref().unwrap_or("999999"),
                        gateway.error_code_msg.as_deref().unwrap_or(""),
                        Some(&strategy_id),
                    );
                    self.shared.inspect_order(&strategy_id, &resp.ref_id);
                    return Ok(());
                }
                self.shared.note_gateway_ok();
                // the ack carries no fill information; poll for the final
                // state instead of guessing
                self.shared.inspect_order(&strategy_id, &resp.ref_id);
            }

            OrderAction::Inspect => {
                if self
                    .shared
                    .ledger
                    .get_active_mut(&strategy_id, &resp.ref_id)
                    .is_none()
                {
                    return Ok(());
                }
                let mut info = resp.metadata.order_info.clone().unwrap_or_default();
                if !gateway.result {
                    let code = gateway.error_code.clone().unwrap_or_default();
                    let suffix = code.get(3..).unwrap_or("");
                    if suffix != "535" || response.exchange == "Bitflyer" {
                        self.note_gateway_failure(
                            OrderAction::Inspect,
                            &code,
                            gateway.error_code_msg.as_deref().unwrap_or(""),
                            Some(&strategy_id),
                        );
                        return Ok(());
                    }
                    // some venues answer "order not found" for orders they
                    // already cancelled; complete the record ourselves
                    info.status = Some(OrderStatus::Cancelled);
                    if info.original_amount.is_none() || info.filled.is_none() {
                        info.original_amount = Some(origin_quantity);
                        info.filled = Some(origin_filled);
                        info.avg_executed_price = Some(origin_avg);
                    }
                }
                self.apply_inspect_info(response, info);
            }

            other => debug!(?other, "unhandled gateway event"),
        }
        Ok(())
    }

    /// Apply an inspect-shaped order detail block, whether it came from a
    /// poll or an unsolicited push.
    fn apply_inspect_info(&mut self, mut response: OrderResponse, info: GatewayOrderInfo) {
        let Some(status) = info.status else {
            warn!(ref_id = %response.ref_id, "order info without usable status");
            return;
        };
        response.status = status;
        if let Some(amount) = info.original_amount {
            response.original_amount = amount;
        }
        response.filled = info.filled.unwrap_or_default();
        response.avg_executed_price = info.avg_executed_price.unwrap_or_default();

        let outcome = self.shared.apply_response(
            &response.strategy_id,
            &response.ref_id,
            OrderEvent::Fill {
                status,
                filled: response.filled,
                avg_price: response.avg_executed_price,
            },
        );
        match outcome {
            LedgerOutcome::Applied(_) => {
                self.shared.note_gateway_ok();
                self.dispatch_response(&response);
            }
            LedgerOutcome::Duplicate => {}
            LedgerOutcome::OutOfOrder => {
                warn!(ref_id = %response.ref_id, "fill before acceptance ignored")
            }
            LedgerOutcome::Unknown => {
                warn!(ref_id = %response.ref_id, "fill for unknown reference id")
            }
        }
    }

    fn dispatch_response(&mut self, response: &OrderResponse) {
        info!(
            strategy_id = %response.strategy_id,
            ref_id = %response.ref_id,
            symbol = %response.symbol,
            direction = %response.direction,
            status = ?response.status,
            filled = %response.filled,
            avg = %response.avg_executed_price,
            "order response"
        );
        let strategy_id = response.strategy_id.clone();
        self.with_strategy(&strategy_id, |algo, ctx| algo.on_response(ctx, response));
    }

    fn note_gateway_failure(
        &mut self,
        action: OrderAction,
        error_code: &str,
        error_msg: &str,
        strategy_id: Option<&str>,
    ) {
        let kind = GatewayErrorKind::classify(error_code, action);
        if kind == GatewayErrorKind::RateLimited {
            if let Some(rt) = strategy_id.and_then(|id| self.strategies.get_mut(id)) {
                let interval = rt.state.slow_down_inspection();
                warn!(
                    strategy_id,
                    interval, "exchange rate limit hit; inspection backed off"
                );
            }
        }
        let described = format!("{} {error_msg}", kind.describe());
        error!(error_code, %described, "gateway error");
        self.shared.mark_warning(&described);
        if self.shared.note_gateway_error(kind) {
            let msg = format!("gateway errors escalating: {error_code} {described}");
            self.shared.alarm(&msg, AlarmCode::OrderResponseException);
        }
    }

    fn handle_balance_push(&mut self, payload: &str) -> Result<()> {
        let push: BalancePush = serde_json::from_str(payload)?;
        if !self.valid_exchanges.contains(&push.exchange)
            || !self.valid_accounts.contains(&push.account_id)
        {
            return Ok(());
        }
        let Some(spot) = push.spot_balance() else {
            return Ok(());
        };
        if !spot.result {
            self.note_gateway_failure(
                OrderAction::QueryBalance,
                spot.error_code.as_deref().unwrap_or("999999"),
                spot.error_code_msg.as_deref().unwrap_or(""),
                None,
            );
            return Ok(());
        }
        let exch_account = format!("{}|{}", push.exchange, push.account_id);
        let pair = self.shared.balances.entry(exch_account).or_default();
        pair.snapshot.replace_snapshot(spot.records);
        pair.seen = true;
        Ok(())
    }

    /// Unsolicited fill/cancel push, matched to the owning reference id
    /// through the index built at send time, then treated exactly like a
    /// poll response.
    fn handle_order_update(&mut self, payload: &str) -> Result<()> {
        let push: OrderUpdatePush = serde_json::from_str(payload)?;
        let Some(order_id) = push.metadata.order_id.clone() else {
            return Ok(());
        };
        let key = format!("{}|{}|{order_id}", push.exchange, push.symbol);
        let Some(owner) = self.shared.order_index.get(&key).cloned() else {
            return Ok(());
        };
        let channel = format!(
            "{}:{}|{}",
            self.cfg.channels.trade_scope,
            push.exchange,
            push.metadata.account_id.clone().unwrap_or_default()
        );
        if let Some(health) = self.subscriptions.order_update.get_mut(&channel) {
            health.touch();
        }
        let Some(origin) = self
            .shared
            .ledger
            .get(&owner.strategy_id, &owner.ref_id)
        else {
            return Ok(());
        };
        let response = OrderResponse {
            strategy_id: owner.strategy_id.clone(),
            ref_id: owner.ref_id.clone(),
            action: OrderAction::Inspect,
            task_id: self.shared.task_id.clone(),
            exchange: push.exchange.clone(),
            account_id: origin.account_id.clone(),
            symbol: push.symbol.clone(),
            contract_type: push.contract_type.clone(),
            timestamp: push.timestamp.clone(),
            status: OrderStatus::Pending,
            direction: origin.direction,
            original_amount: origin.quantity,
            original_price: origin.price,
            filled: Decimal::ZERO,
            avg_executed_price: Decimal::ZERO,
            order_id: Some(order_id),
        };
        self.apply_inspect_info(response, push.order_info);
        Ok(())
    }

    // ------------------------------------------------------------------
    // commands

    fn send_command_response(
        &mut self,
        kind: CommandKind,
        client_id: Value,
        msg: Value,
        result: bool,
    ) {
        let response = CommandResponse {
            task_id: self.shared.task_id.clone(),
            kind,
            client_id,
            status: self.shared.status,
            result,
            msg,
        };
        let channel = self.channels.command_response.clone();
        self.shared.publish_json(&channel, &response);
    }

    fn update_status_all(&mut self, status: TaskStatus, msg: &str) {
        self.shared.status_msg = msg.to_string();
        for rt in self.strategies.values_mut() {
            rt.state.status = status;
            rt.state.status_msg = msg.to_string();
        }
        self.send_status();
    }

    fn handle_command(&mut self, payload: &str) -> Result<()> {
        let env: CommandEnvelope = serde_json::from_str(payload)?;
        if env.task_id != self.shared.task_id {
            return Ok(());
        }
        info!(kind = ?env.kind, "command received");
        let client_id = env.client_id.clone();
        match env.kind {
            CommandKind::Pause => {
                self.shared.status = TaskStatus::Paused;
                self.update_status_all(TaskStatus::Paused, "task paused");
                warn!("task paused");
                self.send_command_response(env.kind, client_id, json!(""), true);
            }

            CommandKind::Resume => {
                let args: ResumeArgs = serde_json::from_value(env.body).unwrap_or(ResumeArgs {
                    task: None,
                });
                if let Some(new_task) = args.task {
                    let mut new_task = new_task;
                    if let Err(e) = new_task.resolve(&self.cfg) {
                        self.send_command_response(
                            env.kind,
                            client_id,
                            json!(format!("parameter update rejected: {e}")),
                            false,
                        );
                        error!(error = %e, "parameter update rejected");
                        return Ok(());
                    }
                    for (strategy_id, rt) in self.strategies.iter_mut() {
                        if let Some(params) = new_task.strategies.get(strategy_id) {
                            rt.params = params.clone();
                        }
                    }
                    self.task = new_task;
                }
                self.shared.status = TaskStatus::Running;
                self.update_status_all(TaskStatus::Running, "task is running");
                warn!("task resumed");
                self.send_command_response(env.kind, client_id, json!(""), true);
            }

            CommandKind::Delete => {
                let args: DeleteArgs = serde_json::from_value(env.body)
                    .unwrap_or(DeleteArgs { force_delete: false });
                if !args.force_delete && self.shared.ledger.unfinished_count() > 0 {
                    self.send_command_response(
                        env.kind,
                        client_id,
                        json!(
                            "orders are still working; cancel them first or use force delete"
                        ),
                        false,
                    );
                    return Ok(());
                }
                self.shared.status = TaskStatus::Deleted;
                self.shared.status_msg = "task deleted".to_string();
                self.shared.cancel_all_orders();
                self.send_command_response(env.kind, client_id, json!(""), true);
                self.finish();
            }

            CommandKind::OmsSendOrder => {
                let args: SendOrderArgs = match serde_json::from_value(env.body) {
                    Ok(args) => args,
                    Err(e) => {
                        self.send_command_response(
                            env.kind,
                            client_id,
                            json!(format!("malformed order command: {e}")),
                            false,
                        );
                        return Ok(());
                    }
                };
                self.handle_manual_order(env.kind, client_id, args);
            }

            CommandKind::OmsCancelOrder | CommandKind::OmsInspectOrder => {
                let args: OrderRefArgs = match serde_json::from_value(env.body) {
                    Ok(args) => args,
                    Err(e) => {
                        self.send_command_response(
                            env.kind,
                            client_id,
                            json!(format!("strategy_id and ref_id are required: {e}")),
                            false,
                        );
                        return Ok(());
                    }
                };
                if env.kind == CommandKind::OmsCancelOrder {
                    self.shared
                        .cancel_order(&args.strategy_id, &args.ref_id, true);
                    self.send_command_response(env.kind, client_id, json!("cancel request sent"), true);
                } else {
                    self.shared.inspect_order(&args.strategy_id, &args.ref_id);
                    self.send_command_response(
                        env.kind,
                        client_id,
                        json!("inspect request sent"),
                        true,
                    );
                }
            }

            CommandKind::OmsCancelAllOrder => {
                self.shared.cancel_all_orders();
                self.send_command_response(
                    env.kind,
                    client_id,
                    json!("cancel requests sent for all active orders"),
                    true,
                );
            }

            CommandKind::OmsOrderStatus => {
                let snapshot = self.shared.ledger.snapshot();
                self.send_command_response(
                    env.kind,
                    client_id,
                    serde_json::to_value(&snapshot)?,
                    true,
                );
            }

            CommandKind::OmsFinishedOrders => {
                let snapshot = self.shared.ledger.snapshot();
                self.send_command_response(
                    env.kind,
                    client_id,
                    json!({ "link": "", "finished_orders": snapshot.finished_orders }),
                    true,
                );
            }

            CommandKind::OmsUnfinishedOrders => {
                let snapshot = self.shared.ledger.snapshot();
                self.send_command_response(
                    env.kind,
                    client_id,
                    json!({
                        "pending_orders": snapshot.pending_orders,
                        "active_orders": snapshot.active_orders,
                    }),
                    true,
                );
            }

            CommandKind::Statistics => {
                let args: StatisticsArgs = match serde_json::from_value(env.body) {
                    Ok(args) => args,
                    Err(e) => {
                        self.send_command_response(
                            env.kind,
                            client_id,
                            json!(format!("malformed statistics command: {e}")),
                            false,
                        );
                        return Ok(());
                    }
                };
                let mut any = false;
                let mut out = serde_json::Map::new();
                for (strategy_id, fees) in &args.strategies {
                    let orders = self.shared.ledger.trade_orders(strategy_id);
                    if orders.is_empty() {
                        out.insert(strategy_id.clone(), json!({}));
                        continue;
                    }
                    any = true;
                    let stats = aggregate(
                        &orders,
                        args.start_time.as_deref(),
                        args.end_time.as_deref(),
                        fees.exchange_fee,
                        fees.service_fee.unwrap_or_default(),
                        fees.currency_type,
                    );
                    out.insert(strategy_id.clone(), serde_json::to_value(&stats)?);
                }
                self.send_command_response(env.kind, client_id, Value::Object(out), any);
            }

            CommandKind::ExportStatistics => {
                let args: ExportStatisticsArgs = match serde_json::from_value(env.body) {
                    Ok(args) => args,
                    Err(e) => {
                        self.send_command_response(
                            env.kind,
                            client_id,
                            json!(format!("malformed export command: {e}")),
                            false,
                        );
                        return Ok(());
                    }
                };
                let mut orders = HashMap::new();
                for strategy_id in self.shared.ledger.strategy_ids() {
                    orders.extend(self.shared.ledger.trade_orders(&strategy_id));
                }
                let stats = aggregate(
                    &orders,
                    args.start_time.as_deref(),
                    args.end_time.as_deref(),
                    args.exchange_fee,
                    args.service_fee.unwrap_or_default(),
                    args.currency_type,
                );
                let link = self
                    .report
                    .export_statistics(&self.shared.task_id, &stats);
                let response = json!({
                    "task_id": self.shared.task_id,
                    "client_id": client_id,
                    "type": "export_statistics",
                    "msg": link,
                });
                let channel = self.channels.command_response.clone();
                self.shared.publish_json(&channel, &response);
            }

            CommandKind::Download => {
                let mut orders = HashMap::new();
                for strategy_id in self.shared.ledger.strategy_ids() {
                    orders.insert(
                        strategy_id.clone(),
                        self.shared.ledger.trade_orders(&strategy_id),
                    );
                }
                let links = self.report.execution_report(&self.task, &orders);
                let response = json!({
                    "task_id": self.shared.task_id,
                    "client_id": client_id,
                    "type": "download",
                    "msg": links,
                });
                let channel = self.channels.command_response.clone();
                self.shared.publish_json(&channel, &response);
            }

            CommandKind::Start => {}
        }
        Ok(())
    }

    fn handle_manual_order(
        &mut self,
        kind: CommandKind,
        client_id: Value,
        args: SendOrderArgs,
    ) {
        let fail = |me: &mut Self, msg: &str| {
            me.send_command_response(kind, client_id.clone(), json!(msg), false);
            error!(msg, "manual order rejected");
        };
        let Some(symbol) = args.symbol.clone() else {
            fail(self, "symbol not set");
            return;
        };
        let Some(strategy_id) = args.strategy_id.clone() else {
            fail(self, "strategy_id not set");
            return;
        };
        let Some(price) = args.price.filter(|p| *p > Decimal::ZERO) else {
            fail(self, "price must be positive");
            return;
        };
        let Some(quantity) = args.quantity.filter(|q| *q > Decimal::ZERO) else {
            fail(self, "quantity must be positive");
            return;
        };
        let direction = match args.direction.as_deref() {
            Some("Buy") => Direction::Buy,
            Some("Sell") => Direction::Sell,
            _ => {
                fail(self, "direction must be Buy or Sell");
                return;
            }
        };
        let Some(trader) = args.trader.clone() else {
            fail(self, "trader not set");
            return;
        };
        let Some(rt) = self.strategies.get(&strategy_id) else {
            fail(self, "unknown strategy_id");
            return;
        };
        let params = &rt.params;
        let Some(triple) = params.triple_for(&symbol) else {
            fail(self, "symbol does not belong to this strategy");
            return;
        };
        let exchange = args.exchange.clone().unwrap_or_else(|| params.exchange.clone());
        let account = args.account.clone().unwrap_or_else(|| params.account.clone());
        let contract_type = args
            .contract_type
            .clone()
            .unwrap_or_else(|| "spot".to_string());
        let order_type = args.order_type.unwrap_or(OrderType::Limit);
        let strategy_key = format!("hand_order|{trader}");
        let order = Order::new(
            &exchange,
            &symbol,
            triple.base(),
            triple.quote(),
            &contract_type,
            price,
            quantity,
            direction,
            order_type,
            &account,
            &strategy_key,
            args.delay,
            args.post_only.unwrap_or(false),
            OrderNotes {
                task_id: self.shared.task_id.clone(),
                strategy_id: strategy_id.clone(),
            },
        );
        let order_info = format!(
            "{strategy_key} {exchange} {account} {symbol} {direction} {quantity}@{price}"
        );
        self.shared.send_order(&strategy_id, order);
        self.send_command_response(
            kind,
            client_id,
            json!(format!("order sent to the exchange => {order_info}")),
            true,
        );
    }

    // ------------------------------------------------------------------
    // timer

    fn on_timer(&mut self) {
        self.check_task_status();
        self.check_channel_staleness();
        self.update_deal_sizes();
        let ids: Vec<String> = self.strategies.keys().cloned().collect();
        for id in ids {
            self.with_strategy(&id, |algo, ctx| {
                run_common_timer(ctx);
                algo.on_timer(ctx);
            });
        }
        self.send_status();
    }

    fn check_task_status(&mut self) {
        if self.shared.status.is_terminal() || self.strategies.is_empty() {
            return;
        }
        let all_finished = self
            .strategies
            .values()
            .all(|rt| rt.state.status == TaskStatus::Finished);
        if all_finished {
            self.shared.status = TaskStatus::Finished;
            self.shared.status_msg = "Task has finished".to_string();
            self.finish();
        }
    }

    fn check_channel_staleness(&mut self) {
        if self.shared.status == TaskStatus::Paused {
            return;
        }
        let mut stale_topics: Vec<String> = Vec::new();
        for (channel, health) in self.subscriptions.market.iter_mut() {
            let window = if channel.contains("|trade") {
                self.cfg.staleness.trade_channel_secs
            } else {
                self.cfg.staleness.market_data_secs
            };
            if let Some(first_time) = health.note_silence(window) {
                if let Some((_, topic)) = channel.split_once(':') {
                    stale_topics.push(topic.to_string());
                }
                if first_time {
                    let msg = format!("{channel} has delivered no market data for {window}s");
                    self.shared.alarm(&msg, AlarmCode::DataUnreceived);
                }
            }
        }
        if !stale_topics.is_empty() {
            let channel = self.channels.market_subscribe_request.clone();
            self.shared.publish_json(&channel, &stale_topics);
        }
        for (channel, health) in self.subscriptions.order_update.iter_mut() {
            if let Some(first_time) =
                health.note_silence(self.cfg.staleness.order_update_secs)
            {
                if let Some((_, topic)) = channel.split_once(':') {
                    let subscribe = self.channels.order_update_subscribe_request.clone();
                    self.shared.publish_json(&subscribe, &topic.to_string());
                }
                if first_time {
                    let msg = format!("{channel} has delivered no order updates");
                    self.shared.alarm(&msg, AlarmCode::DataUnreceived);
                }
            }
        }
    }

    /// Signed execution progress per strategy, read from the selected
    /// balance ledger against the declared initial holdings.
    fn update_deal_sizes(&mut self) {
        for rt in self.strategies.values_mut() {
            let params = &rt.params;
            if !self.shared.balance_ready(params) {
                continue;
            }
            let Some(book) = self.shared.selected_book(params) else {
                continue;
            };
            let base = params.symbol.base();
            let quote = params.symbol.quote();
            let factor = match params.direction {
                Direction::Sell => Decimal::ONE,
                Direction::Buy => -Decimal::ONE,
            };
            let deal = match params.currency_type {
                CurrencyType::Base => {
                    params.initial_balance_of(base) - book.total_of(base)
                }
                CurrencyType::Quote => {
                    book.total_of(quote) - params.initial_balance_of(quote)
                }
            };
            rt.state.deal_size = (deal * factor).round_dp(10);
        }
    }

    fn send_status(&mut self) {
        // a warning decays back to normal after ten quiet minutes
        if self.shared.status_msg.starts_with("warning|") {
            let now = Local::now().naive_local();
            if (now - self.shared.last_warning).num_seconds() > 600 {
                self.shared.status_msg = "task is running".to_string();
            }
        }

        let mut strategies = HashMap::new();
        for (strategy_id, rt) in &self.strategies {
            strategies.insert(
                strategy_id.clone(),
                StrategyStatus {
                    strategy_id: strategy_id.clone(),
                    exchange: rt.params.exchange.clone(),
                    account: rt.params.account.clone(),
                    symbol: rt.params.symbol.pair().to_string(),
                    direction: rt.params.direction,
                    currency_type: rt.params.currency_type,
                    price_threshold: rt.params.price_threshold,
                    total_size: rt.params.total_size,
                    start_time: rt.params.start_time.clone(),
                    end_time: rt.params.end_time.clone(),
                    deal_size: rt.state.deal_size,
                    attention: rt.state.attention,
                    current_price: rt.state.current_price,
                    status: rt.state.status,
                    status_msg: rt.state.status_msg.clone(),
                },
            );
        }
        let snapshot = StatusSnapshot {
            ip: self.ip.clone(),
            pid: self.pid,
            name: self.shared.task_id.clone(),
            status: self.shared.status,
            status_msg: self.shared.status_msg.clone(),
            start_time: self.task.start_time.clone(),
            end_time: self.task.end_time.clone(),
            update_time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            strategies,
        };
        let channel = self.channels.status.clone();
        self.shared.publish_json(&channel, &snapshot);

        if self.shared.status == TaskStatus::Error {
            let note = Notification {
                kind: self.shared.status,
                message: self.shared.task_id.clone(),
                description: format!("{} {}", now_window_time(), self.shared.status_msg),
            };
            let channel = self.channels.notification.clone();
            self.shared.publish_json(&channel, &note);
        }
    }

    /// Final flush: last status, strategy teardown hooks, the execution
    /// report for real runs, the order snapshot, and the exit signal.
    fn finish(&mut self) {
        if self.finishing {
            return;
        }
        self.finishing = true;
        self.send_status();

        let ids: Vec<String> = self.strategies.keys().cloned().collect();
        for id in ids {
            self.with_strategy(&id, |algo, ctx| {
                if !ctx.state.finish_flag {
                    ctx.state.finish_flag = true;
                    algo.on_finish(ctx);
                }
            });
        }

        if self.shared.status == TaskStatus::Finished && !self.task.test_mode {
            let mut orders = HashMap::new();
            for strategy_id in self.shared.ledger.strategy_ids() {
                orders.insert(
                    strategy_id.clone(),
                    self.shared.ledger.trade_orders(&strategy_id),
                );
            }
            let links = self.report.execution_report(&self.task, &orders);
            if !links.is_empty() {
                info!(?links, "execution report generated");
            }
        }

        if let Err(e) = self
            .store
            .save(&self.shared.task_id, &self.shared.ledger.snapshot())
        {
            error!(error = %e, "order snapshot could not be saved");
        }
        self.shared.push(Outbound::Exit);
    }

    fn error_exit(&mut self, msg: &str) {
        self.shared.status = TaskStatus::Error;
        self.shared.status_msg = msg.to_string();
        self.finish();
    }
}
