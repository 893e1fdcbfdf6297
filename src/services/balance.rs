//! Balance query side service.
//!
//! Forwards ad-hoc balance queries from the UI to the trading gateway and
//! relays the answers back; also answers task-status inspections from a
//! cache built off the status channel, for when the UI loses track of a
//! running task.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::protocol::TradeResponse;
use crate::bus::{Bus, ChannelPlan};
use crate::config::AppConfig;
use crate::domain::OrderAction;
use crate::error::Result;

pub struct BalanceService {
    cfg: Arc<AppConfig>,
    /// Latest status snapshot per task id, fed by the status channel
    statuses: HashMap<String, Value>,
}

impl BalanceService {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        Self {
            cfg,
            statuses: HashMap::new(),
        }
    }

    async fn handle_command(&mut self, bus: &dyn Bus, payload: &str) -> Result<()> {
        let command: Value = serde_json::from_str(payload)?;
        let kind = command.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "get_balance" => {
                let test_mode = command
                    .get("test_mode")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let plan = ChannelPlan::new(&self.cfg.channels, test_mode);
                let request = json!({
                    "strategy": self.cfg.strategy_name,
                    "ref_id": command.get("client_id").cloned().unwrap_or_default(),
                    "action": "query_balance",
                    "metadata": {
                        "exchange": command.get("exchange").cloned().unwrap_or_default(),
                        "account_id": command.get("account").cloned().unwrap_or_default(),
                        "currency": "",
                    },
                });
                bus.publish(
                    &plan.trade_request(&self.cfg.strategy_name),
                    request.to_string(),
                )
                .await?;
            }
            "inspect" => {
                let task_id = command
                    .get("task_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let client_id = command.get("client_id").cloned().unwrap_or_default();
                let response = match self.statuses.get(task_id) {
                    Some(status) => {
                        let mut status = status.clone();
                        status["client_id"] = client_id;
                        status["result"] = json!(true);
                        status
                    }
                    None => json!({ "client_id": client_id, "result": false }),
                };
                bus.publish(
                    &self.cfg.channels.master_command_response,
                    response.to_string(),
                )
                .await?;
            }
            other => debug!(kind = other, "command not for this service"),
        }
        Ok(())
    }

    async fn handle_trade_response(&self, bus: &dyn Bus, payload: &str) -> Result<()> {
        let response: TradeResponse = match serde_json::from_str(payload) {
            Ok(response) => response,
            Err(_) => return Ok(()), // other response shapes share this channel
        };
        if response.action != OrderAction::QueryBalance {
            return Ok(());
        }
        // relay the gateway's balance answer to the UI
        let raw: Value = serde_json::from_str(payload)?;
        let metadata = raw
            .pointer("/metadata/metadata")
            .cloned()
            .unwrap_or_default();
        let out = json!({
            "client_id": response.ref_id,
            "action": "query_balance",
            "metadata": metadata,
        });
        bus.publish(&self.cfg.channels.master_command_response, out.to_string())
            .await?;
        Ok(())
    }

    fn cache_status(&mut self, payload: &str) {
        let Ok(status) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        if let Some(name) = status.get("name").and_then(Value::as_str) {
            self.statuses.insert(name.to_string(), status.clone());
        }
    }

    pub async fn run(mut self, bus: Arc<dyn Bus>) -> Result<()> {
        let live = ChannelPlan::new(&self.cfg.channels, false);
        let test = ChannelPlan::new(&self.cfg.channels, true);
        let response_live = live.trade_response(&self.cfg.strategy_name);
        let response_test = test.trade_response(&self.cfg.strategy_name);
        let command = self.cfg.channels.master_command.clone();
        let status = self.cfg.channels.task_status.clone();
        let mut stream = bus
            .subscribe(&[
                response_live.clone(),
                response_test.clone(),
                command.clone(),
                status.clone(),
            ])
            .await?;
        info!("balance service listening");

        while let Some(msg) = stream.recv().await {
            let result = if msg.channel == command {
                self.handle_command(bus.as_ref(), &msg.payload).await
            } else if msg.channel == status {
                self.cache_status(&msg.payload);
                Ok(())
            } else {
                self.handle_trade_response(bus.as_ref(), &msg.payload).await
            };
            if let Err(e) = result {
                warn!(channel = %msg.channel, error = %e, "message handling failed");
            }
        }
        Ok(())
    }
}
