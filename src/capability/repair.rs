//! Replacing missing or broken capabilities with fallbacks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capability::{Capability, CapabilityRegistry};
use crate::error::CapabilityError;
use crate::hooks::{HookEvent, HookRegistry};

/// Builds a fresh fallback implementation.
pub type FallbackFactory = Arc<dyn Fn() -> Arc<dyn Capability> + Send + Sync>;

/// What a repair attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The active implementation answered its probe; nothing was replaced.
    AlreadyHealthy,
    /// A fallback is now active.
    InstalledFallback,
}

impl RepairOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyHealthy => "already_healthy",
            Self::InstalledFallback => "installed_fallback",
        }
    }
}

/// The last repair attempt for one capability.
#[derive(Debug, Clone, Serialize)]
pub struct RepairRecord {
    pub capability: String,
    pub succeeded: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Running totals of repair attempts that had something to fix.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairMemory {
    pub total_repairs: u64,
    pub successful_repairs: u64,
    pub last_repair: Option<RepairRecord>,
    pub by_capability: BTreeMap<String, RepairRecord>,
}

/// Installs fallbacks for capabilities that are missing or fail their probe.
pub struct RepairManager {
    registry: Arc<CapabilityRegistry>,
    factories: RwLock<HashMap<String, FallbackFactory>>,
    memory: Mutex<RepairMemory>,
    hooks: Arc<HookRegistry>,
}

impl RepairManager {
    pub fn new(registry: Arc<CapabilityRegistry>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            registry,
            factories: RwLock::new(HashMap::new()),
            memory: Mutex::new(RepairMemory::default()),
            hooks,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Register how to build the fallback for `name`.
    pub fn register_fallback(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Capability> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut factories = match self.factories.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        factories.insert(name, Arc::new(factory));
    }

    pub fn has_fallback(&self, name: &str) -> bool {
        self.factory(name).is_some()
    }

    fn factory(&self, name: &str) -> Option<FallbackFactory> {
        let factories = match self.factories.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        factories.get(name).cloned()
    }

    fn memory(&self) -> MutexGuard<'_, RepairMemory> {
        match self.memory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Repair `name` if it needs it.
    pub async fn repair(&self, name: &str) -> Result<RepairOutcome, CapabilityError> {
        let reason = match self.registry.get(name) {
            Some(active) => match active.probe().await {
                Ok(()) => {
                    tracing::debug!(capability = name, "Capability healthy; no repair needed");
                    return Ok(RepairOutcome::AlreadyHealthy);
                }
                Err(err) => err.to_string(),
            },
            None => "missing".to_string(),
        };

        let Some(factory) = self.factory(name) else {
            tracing::error!(capability = name, reason = %reason, "Capability unavailable and no fallback registered");
            self.record(name, false, format!("no fallback ({})", reason));
            return Err(CapabilityError::NoFallback {
                name: name.to_string(),
            });
        };

        let fallback = factory();
        if fallback.name() != name {
            let actual = fallback.name().to_string();
            tracing::error!(capability = name, built = %actual, "Fallback factory built the wrong capability");
            self.record(name, false, format!("fallback named '{}' ({})", actual, reason));
            return Err(CapabilityError::FallbackNameMismatch {
                name: name.to_string(),
                actual,
            });
        }
        self.registry.install_fallback(fallback);

        tracing::warn!(capability = name, reason = %reason, "Installed fallback capability");
        self.record(name, true, format!("installed fallback ({})", reason));
        self.hooks.dispatch(&HookEvent::CapabilityRepaired {
            capability: name.to_string(),
            outcome: RepairOutcome::InstalledFallback.as_str().to_string(),
        });

        Ok(RepairOutcome::InstalledFallback)
    }

    fn record(&self, name: &str, succeeded: bool, detail: String) {
        let record = RepairRecord {
            capability: name.to_string(),
            succeeded,
            detail,
            at: Utc::now(),
        };

        let mut memory = self.memory();
        memory.total_repairs += 1;
        if succeeded {
            memory.successful_repairs += 1;
        }
        memory.by_capability.insert(name.to_string(), record.clone());
        memory.last_repair = Some(record);
    }

    /// Copy of the repair history.
    pub fn memory_snapshot(&self) -> RepairMemory {
        self.memory().clone()
    }
}
