//! Periodic probing of required capabilities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::capability::{CapabilityRegistry, RepairManager, RepairOutcome};
use crate::error::CapabilityError;

/// Default period between health cycles.
pub const DEFAULT_HEALTH_PERIOD: Duration = Duration::from_secs(60);

/// Result of one round of probes. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: bool,
    pub checks: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Required capabilities with at least one failing check.
    pub fn failing(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| {
                [present_key(name), functional_key(name)]
                    .iter()
                    .any(|key| !self.checks.get(key).copied().unwrap_or(false))
            })
            .cloned()
            .collect()
    }
}

/// A health check plus the repairs it triggered.
#[derive(Debug, Clone)]
pub struct HealthCycle {
    pub report: HealthReport,
    pub repairs: BTreeMap<String, Result<RepairOutcome, CapabilityError>>,
}

fn present_key(name: &str) -> String {
    format!("{}.present", name)
}

fn functional_key(name: &str) -> String {
    format!("{}.functional", name)
}

/// Probes a fixed set of required capabilities.
pub struct HealthMonitor {
    registry: Arc<CapabilityRegistry>,
    repair: Arc<RepairManager>,
    required: Vec<String>,
}

impl HealthMonitor {
    pub fn new(repair: Arc<RepairManager>, required: Vec<String>) -> Self {
        Self {
            registry: Arc::clone(repair.registry()),
            repair,
            required,
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Probe every required capability.
    pub async fn check(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        for name in &self.required {
            let active = self.registry.get(name);
            let present = active.is_some();
            let functional = match active {
                Some(capability) => match capability.probe().await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!(capability = %name, error = %err, "Capability probe failed");
                        false
                    }
                },
                None => false,
            };

            checks.insert(present_key(name), present);
            checks.insert(functional_key(name), functional);
        }

        HealthReport {
            overall: checks.values().all(|ok| *ok),
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Check, then make one repair attempt per failing capability.
    pub async fn run_once(&self) -> HealthCycle {
        let report = self.check().await;
        let mut repairs = BTreeMap::new();

        if !report.overall {
            for name in report.failing(&self.required) {
                tracing::warn!(capability = %name, "Required capability failed health check");
                let outcome = self.repair.repair(&name).await;
                repairs.insert(name, outcome);
            }
        }

        HealthCycle { report, repairs }
    }

    /// Run [`HealthMonitor::run_once`] every `period`, starting now.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(
                period_secs = period.as_secs(),
                required = ?self.required,
                "Health monitor started"
            );

            loop {
                ticker.tick().await;
                let cycle = self.run_once().await;
                if cycle.report.overall {
                    tracing::debug!("All required capabilities healthy");
                }
            }
        })
    }
}
