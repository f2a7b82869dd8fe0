//! The control surface: status, settings, routes, health and repair.
//!
//! [`ControlSurface`] is the one place outside callers reach into the
//! running agent. It is exposed two ways: typed methods, and
//! [`ControlSurface::dispatch`] for the `AGENT_COMMAND` message protocol
//! (which the HTTP server mounts at `POST /rpc`).

pub mod protocol;
mod server;

pub use protocol::{COMMAND_TYPE, ControlRequest, ControlResponse, RESPONSE_TYPE};
pub use server::{ApiError, router, serve};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::agent::{
    ActionRouter, HeartbeatEvent, HeartbeatScheduler, ResponseCorrelator, ScheduleState,
};
use crate::capability::{
    CapabilityAvailability, CapabilityRegistry, HealthMonitor, HealthReport, RepairManager,
    RepairMemory, RepairOutcome,
};
use crate::config::{AgentConfig, SettingsView};
use crate::error::{Error, Result};
use crate::transport::Reply;

/// Events returned by `getTemporalEvents` when no count is given.
pub const DEFAULT_EVENT_COUNT: usize = 10;

/// Scheduler state plus derived values.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    #[serde(flatten)]
    pub state: ScheduleState,
    pub uptime_secs: Option<u64>,
    pub pending_replies: usize,
}

/// Everything the control surface operates on.
pub struct ControlSurface {
    config: Arc<AgentConfig>,
    scheduler: HeartbeatScheduler,
    router: Arc<ActionRouter>,
    correlator: ResponseCorrelator,
    registry: Arc<CapabilityRegistry>,
    health: Arc<HealthMonitor>,
    repair: Arc<RepairManager>,
}

impl ControlSurface {
    pub fn new(
        config: Arc<AgentConfig>,
        scheduler: HeartbeatScheduler,
        router: Arc<ActionRouter>,
        correlator: ResponseCorrelator,
        health: Arc<HealthMonitor>,
        repair: Arc<RepairManager>,
    ) -> Self {
        Self {
            config,
            scheduler,
            router,
            correlator,
            registry: Arc::clone(repair.registry()),
            health,
            repair,
        }
    }

    pub fn scheduler(&self) -> &HeartbeatScheduler {
        &self.scheduler
    }

    pub fn get_status(&self) -> StatusView {
        let state = self.scheduler.status();
        StatusView {
            uptime_secs: state.uptime().map(|d| d.as_secs()),
            pending_replies: self.correlator.pending_count(),
            state,
        }
    }

    pub fn get_settings(&self) -> SettingsView {
        self.config.settings_view(self.scheduler.interval().get())
    }

    /// Change the interval; rejects values outside 5..=300 seconds.
    /// Status reads made after this returns see the new schedule.
    pub async fn set_interval(&self, secs: u64) -> Result<SettingsView> {
        let state = self.scheduler.set_interval(secs).await?;
        Ok(self.config.settings_view(state.interval))
    }

    /// The last `count` tick outcomes, oldest first.
    pub async fn recent_events(&self, count: usize) -> Result<Vec<HeartbeatEvent>> {
        Ok(self.scheduler.recent_events(count).await?)
    }

    pub async fn start(&self) -> Result<ScheduleState> {
        Ok(self.scheduler.start().await?)
    }

    pub async fn stop(&self) -> Result<ScheduleState> {
        Ok(self.scheduler.stop().await?)
    }

    pub fn add_action_route(&self, action: &str, path: &str) -> Result<BTreeMap<String, String>> {
        self.router.add_action_route(action, path)?;
        Ok(self.action_routes())
    }

    pub fn remove_action_route(&self, action: &str) -> bool {
        self.router.remove_action_route(action)
    }

    pub fn action_routes(&self) -> BTreeMap<String, String> {
        self.router.action_routes().as_ref().clone()
    }

    pub async fn check_health(&self) -> HealthReport {
        self.health.check().await
    }

    pub async fn repair(&self, name: &str) -> Result<RepairOutcome> {
        Ok(self.repair.repair(name).await?)
    }

    pub fn repair_memory(&self) -> RepairMemory {
        self.repair.memory_snapshot()
    }

    /// Availability of every required capability.
    pub fn system_status(&self) -> BTreeMap<String, CapabilityAvailability> {
        self.registry
            .availability(self.health.required().iter().map(String::as_str))
    }

    pub async fn invoke(&self, name: &str, method: &str, args: Value) -> Result<Value> {
        Ok(self.registry.invoke(name, method, args).await?)
    }

    /// Hand an externally observed reply to the correlator.
    pub fn deliver_reply(&self, reply: Reply) -> bool {
        self.correlator.deliver(reply)
    }

    /// Handle one protocol message. Always produces a response.
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        match self.handle(&request).await {
            Ok(result) => ControlResponse::ok(&request, result),
            Err(err) => {
                tracing::debug!(method = %request.method, error = %err, "Control request failed");
                ControlResponse::err(&request, err)
            }
        }
    }

    async fn handle(&self, request: &ControlRequest) -> Result<Value> {
        let value = match request.method.as_str() {
            "getStatus" => to_value(self.get_status()),
            "getSettings" => to_value(self.get_settings()),
            "setInterval" => to_value(self.set_interval(request.u64_arg(0, "seconds")?).await?),
            "start" => to_value(self.start().await?),
            "stop" => to_value(self.stop().await?),
            "addActionRoute" => to_value(self.add_action_route(
                request.str_arg(0, "action")?,
                request.str_arg(1, "path")?,
            )?),
            "removeActionRoute" => {
                json!({ "removed": self.remove_action_route(request.str_arg(0, "action")?) })
            }
            "getActionRoutes" => to_value(self.action_routes()),
            "checkHealth" => to_value(self.check_health().await),
            "repair" => to_value(self.repair(request.str_arg(0, "name")?).await?),
            "getTemporalEvents" => {
                let count = match request.opt_u64_arg(0, "count")? {
                    Some(count) => usize::try_from(count).unwrap_or(usize::MAX),
                    None => DEFAULT_EVENT_COUNT,
                };
                to_value(self.recent_events(count).await?)
            }
            "getRepairMemory" => to_value(self.repair_memory()),
            "getSystemStatus" => to_value(self.system_status()),
            "invoke" => {
                let name = request.str_arg(0, "name")?;
                let method = request.str_arg(1, "method")?;
                let args = request.arg(2, "args").cloned().unwrap_or(Value::Null);
                self.invoke(name, method, args).await?
            }
            other => {
                return Err(Error::UnknownMethod {
                    method: other.to_string(),
                });
            }
        };
        Ok(value)
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
