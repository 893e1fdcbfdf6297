//! Order query side service.
//!
//! Answers order and statistics queries for tasks that have already
//! finished, from the per-task order snapshot on disk. Running tasks
//! answer these commands themselves; this service only reacts when a
//! snapshot file exists.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::config::AppConfig;
use crate::coordinator::command::{
    CommandEnvelope, CommandKind, CommandResponse, ExportStatisticsArgs, StatisticsArgs,
};
use crate::domain::{Order, TaskStatus};
use crate::error::Result;
use crate::ledger::OrderSnapshot;
use crate::persistence::SnapshotStore;
use crate::report::{aggregate, NoopReportSink, ReportSink};

pub struct OrderService {
    cfg: Arc<AppConfig>,
    store: SnapshotStore,
    report: Box<dyn ReportSink>,
}

fn merged_orders(snapshot: &OrderSnapshot, strategy_id: &str) -> HashMap<String, Order> {
    let mut merged: HashMap<String, Order> = snapshot
        .finished_orders
        .get(strategy_id)
        .cloned()
        .unwrap_or_default();
    if let Some(active) = snapshot.active_orders.get(strategy_id) {
        for (ref_id, order) in active {
            merged.insert(ref_id.clone(), order.clone());
        }
    }
    merged
}

fn all_orders(snapshot: &OrderSnapshot) -> HashMap<String, Order> {
    let mut merged = HashMap::new();
    for orders in snapshot
        .finished_orders
        .values()
        .chain(snapshot.active_orders.values())
    {
        for (ref_id, order) in orders {
            merged.insert(ref_id.clone(), order.clone());
        }
    }
    merged
}

impl OrderService {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        let store = SnapshotStore::new(&cfg.orders_dir);
        Self {
            cfg,
            store,
            report: Box::new(NoopReportSink),
        }
    }

    pub fn with_report(mut self, report: Box<dyn ReportSink>) -> Self {
        self.report = report;
        self
    }

    async fn respond(
        &self,
        bus: &dyn Bus,
        env: &CommandEnvelope,
        msg: Value,
        result: bool,
    ) -> Result<()> {
        let response = CommandResponse {
            task_id: env.task_id.clone(),
            kind: env.kind,
            client_id: env.client_id.clone(),
            status: TaskStatus::Finished,
            result,
            msg,
        };
        bus.publish(
            &self.cfg.channels.task_command_response,
            serde_json::to_string(&response)?,
        )
        .await
    }

    async fn handle_command(&self, bus: &dyn Bus, payload: &str) -> Result<()> {
        let env: CommandEnvelope = match serde_json::from_str(payload) {
            Ok(env) => env,
            Err(_) => return Ok(()), // commands for running tasks have other shapes too
        };
        if !matches!(
            env.kind,
            CommandKind::OmsOrderStatus
                | CommandKind::OmsFinishedOrders
                | CommandKind::OmsUnfinishedOrders
                | CommandKind::Statistics
                | CommandKind::ExportStatistics
                | CommandKind::Download
        ) {
            return Ok(());
        }
        // only answer for finished tasks; a live coordinator owns the rest
        let Some(snapshot) = self.store.load(&env.task_id)? else {
            return Ok(());
        };
        info!(task_id = %env.task_id, kind = ?env.kind, "serving from order snapshot");

        match env.kind {
            CommandKind::OmsOrderStatus => {
                self.respond(bus, &env, serde_json::to_value(&snapshot)?, true)
                    .await?;
            }
            CommandKind::OmsUnfinishedOrders => {
                self.respond(
                    bus,
                    &env,
                    json!({
                        "pending_orders": snapshot.pending_orders,
                        "active_orders": snapshot.active_orders,
                    }),
                    true,
                )
                .await?;
            }
            CommandKind::OmsFinishedOrders => {
                self.respond(
                    bus,
                    &env,
                    json!({ "link": "", "finished_orders": snapshot.finished_orders }),
                    true,
                )
                .await?;
            }
            CommandKind::Statistics => {
                let args: StatisticsArgs = match serde_json::from_value(env.body.clone()) {
                    Ok(args) => args,
                    Err(e) => {
                        self.respond(bus, &env, json!(format!("malformed: {e}")), false)
                            .await?;
                        return Ok(());
                    }
                };
                let mut any = false;
                let mut out = serde_json::Map::new();
                for (strategy_id, fees) in &args.strategies {
                    let orders = merged_orders(&snapshot, strategy_id);
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
                self.respond(bus, &env, Value::Object(out), any).await?;
            }
            CommandKind::ExportStatistics => {
                let args: ExportStatisticsArgs = match serde_json::from_value(env.body.clone()) {
                    Ok(args) => args,
                    Err(e) => {
                        self.respond(bus, &env, json!(format!("malformed: {e}")), false)
                            .await?;
                        return Ok(());
                    }
                };
                let orders = all_orders(&snapshot);
                let stats = aggregate(
                    &orders,
                    args.start_time.as_deref(),
                    args.end_time.as_deref(),
                    args.exchange_fee,
                    args.service_fee.unwrap_or_default(),
                    args.currency_type,
                );
                let link = self.report.export_statistics(&env.task_id, &stats);
                self.respond(bus, &env, json!(link), true).await?;
            }
            CommandKind::Download => {
                // spreadsheet rendering is behind the report boundary; with
                // no backend wired the links are simply empty
                self.respond(bus, &env, json!({}), true).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn run(self, bus: Arc<dyn Bus>) -> Result<()> {
        let command = self.cfg.channels.task_command.clone();
        let mut stream = bus.subscribe(&[command]).await?;
        info!("order service listening");
        while let Some(msg) = stream.recv().await {
            if let Err(e) = self.handle_command(bus.as_ref(), &msg.payload).await {
                warn!(error = %e, "command handling failed");
            }
        }
        Ok(())
    }
}
