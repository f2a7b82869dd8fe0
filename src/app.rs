//! Wiring: build every service from an [`AgentConfig`].

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::agent::{
    ActionRouter, HeartbeatConfig, HeartbeatParts, HeartbeatPayload, HeartbeatScheduler,
    IntervalController, PayloadSource, ResponseCorrelator,
};
use crate::capability::{
    Capability, CapabilityRegistry, HealthMonitor, MinimalFallback, RepairManager,
};
use crate::config::AgentConfig;
use crate::control::ControlSurface;
use crate::error::{ConfigError, Result};
use crate::hooks::{HookBundleConfig, HookRegistry, register_bundle, register_bundled_hooks};
use crate::transport::{HttpTransport, Transport};

/// The running agent.
pub struct AgentRuntime {
    pub surface: Arc<ControlSurface>,
    pub scheduler: HeartbeatScheduler,
    pub registry: Arc<CapabilityRegistry>,
    pub health: Arc<HealthMonitor>,
    scheduler_task: JoinHandle<()>,
}

/// Optional overrides for [`build`].
#[derive(Default)]
pub struct BuildOptions {
    pub transport: Option<Arc<dyn Transport>>,
    pub payloads: Option<Arc<dyn PayloadSource>>,
}

/// Load the hook registry: bundled hooks plus the configured bundle file.
pub fn load_hooks(config: &AgentConfig) -> Result<HookRegistry> {
    let mut builder = HookRegistry::builder();
    let mut summary = register_bundled_hooks(&mut builder);

    if let Some(path) = &config.hooks_file {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let bundle = HookBundleConfig::from_json(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let source = format!("file:{}", path.display());
        summary.merge(register_bundle(&mut builder, &source, bundle));
    }

    tracing::info!(
        registered = summary.total_registered(),
        webhooks = summary.outbound_webhooks,
        skipped = summary.errors,
        "Hooks registered"
    );
    Ok(builder.build())
}

/// Construct every service and spawn the scheduler. Nothing is started.
pub fn build(config: AgentConfig, options: BuildOptions) -> Result<AgentRuntime> {
    let config = Arc::new(config);
    let hooks = Arc::new(load_hooks(&config)?);

    let interval = Arc::new(IntervalController::new(config.interval)?);
    let router = Arc::new(ActionRouter::new(&config.base_url)?);
    for (action, path) in &config.routes {
        router.add_action_route(action, path)?;
    }

    let correlator = ResponseCorrelator::new(config.correlation);
    let transport: Arc<dyn Transport> = match options.transport {
        Some(transport) => transport,
        None => Arc::new(HttpTransport::new(correlator.clone(), config.reply_timeout)?),
    };
    let payloads: Arc<dyn PayloadSource> = match options.payloads {
        Some(payloads) => payloads,
        None => Arc::new(HeartbeatPayload::new()),
    };

    let (scheduler, scheduler_task) = HeartbeatScheduler::spawn(HeartbeatParts {
        interval,
        router: Arc::clone(&router),
        correlator: correlator.clone(),
        transport,
        payloads,
        hooks: Arc::clone(&hooks),
        config: HeartbeatConfig {
            reply_timeout: config.reply_timeout,
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
            event_history: config.event_history,
        },
    });

    let registry = Arc::new(CapabilityRegistry::new());
    let repair = Arc::new(RepairManager::new(Arc::clone(&registry), hooks));
    for name in &config.required_capabilities {
        let fallback_name = name.clone();
        repair.register_fallback(name.clone(), move || -> Arc<dyn Capability> {
            Arc::new(MinimalFallback::new(fallback_name.clone()))
        });
    }
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&repair),
        config.required_capabilities.clone(),
    ));

    let surface = Arc::new(ControlSurface::new(
        Arc::clone(&config),
        scheduler.clone(),
        router,
        correlator,
        Arc::clone(&health),
        repair,
    ));

    Ok(AgentRuntime {
        surface,
        scheduler,
        registry,
        health,
        scheduler_task,
    })
}

impl AgentRuntime {
    /// Stop the scheduler and wait for its task to end.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        if let Err(err) = self.scheduler_task.await {
            tracing::warn!(error = %err, "Scheduler task ended abnormally");
        }
    }
}
