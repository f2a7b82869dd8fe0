//! Lifecycle hooks for the heartbeat loop and capability repair.
//!
//! Hooks observe; they never change scheduler behavior. The registry is
//! built once at startup and is immutable afterwards, so the order hooks
//! run in is fixed for the life of the process (lower priority first,
//! registration order breaks ties).

mod bundled;

pub use bundled::{
    HookBundleConfig, HookBundleError, HookRegistrationSummary, OutboundWebhookConfig,
    register_bundle, register_bundled_hooks,
};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Points in the lifecycle where hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPoint {
    Started,
    Stopped,
    TickSent,
    ReplyReceived,
    AttemptFailed,
    Degraded,
    IntervalChanged,
    CapabilityRepaired,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::TickSent => "tickSent",
            Self::ReplyReceived => "replyReceived",
            Self::AttemptFailed => "attemptFailed",
            Self::Degraded => "degraded",
            Self::IntervalChanged => "intervalChanged",
            Self::CapabilityRepaired => "capabilityRepaired",
        }
    }
}

/// A lifecycle event delivered to hooks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "point", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HookEvent {
    Started {
        generation: u64,
    },
    Stopped {
        generation: u64,
    },
    TickSent {
        request_id: u64,
        generation: u64,
        endpoint: String,
    },
    ReplyReceived {
        request_id: u64,
        generation: u64,
    },
    AttemptFailed {
        request_id: u64,
        generation: u64,
        attempt: u32,
        reason: String,
    },
    Degraded {
        attempts: u32,
    },
    IntervalChanged {
        interval_secs: u64,
    },
    CapabilityRepaired {
        capability: String,
        outcome: String,
    },
}

impl HookEvent {
    pub fn hook_point(&self) -> HookPoint {
        match self {
            Self::Started { .. } => HookPoint::Started,
            Self::Stopped { .. } => HookPoint::Stopped,
            Self::TickSent { .. } => HookPoint::TickSent,
            Self::ReplyReceived { .. } => HookPoint::ReplyReceived,
            Self::AttemptFailed { .. } => HookPoint::AttemptFailed,
            Self::Degraded { .. } => HookPoint::Degraded,
            Self::IntervalChanged { .. } => HookPoint::IntervalChanged,
            Self::CapabilityRepaired { .. } => HookPoint::CapabilityRepaired,
        }
    }
}

/// Hook execution errors. Hooks always fail open.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// An observer of lifecycle events.
///
/// `on_event` runs inline on the scheduler task and must not block; hooks
/// that do I/O spawn it.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Points this hook wants to see.
    fn hook_points(&self) -> &[HookPoint];

    fn on_event(&self, event: &HookEvent) -> Result<(), HookError>;
}

struct RegisteredHook {
    priority: u32,
    hook: Arc<dyn Hook>,
}

/// Collects hooks before the registry is frozen.
#[derive(Default)]
pub struct HookRegistryBuilder {
    hooks: Vec<RegisteredHook>,
}

impl HookRegistryBuilder {
    pub fn register_with_priority(&mut self, hook: Arc<dyn Hook>, priority: u32) -> &mut Self {
        self.hooks.push(RegisteredHook { priority, hook });
        self
    }

    /// Freeze into an ordered registry.
    pub fn build(mut self) -> HookRegistry {
        // Stable sort keeps registration order within a priority.
        self.hooks.sort_by_key(|h| h.priority);
        HookRegistry { hooks: self.hooks }
    }
}

/// Ordered, immutable list of hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<RegisteredHook>,
}

impl HookRegistry {
    /// Registry with no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hook names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.hook.name().to_string()).collect()
    }

    /// Run every hook subscribed to the event's point, in order.
    pub fn dispatch(&self, event: &HookEvent) {
        let point = event.hook_point();
        for registered in &self.hooks {
            let hook = &registered.hook;
            if !hook.hook_points().contains(&point) {
                continue;
            }
            if let Err(err) = hook.on_event(event) {
                tracing::warn!(
                    hook = hook.name(),
                    point = point.as_str(),
                    error = %err,
                    "Hook failed; continuing"
                );
            }
        }
    }
}
