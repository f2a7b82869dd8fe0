//! Required capabilities and their self-repair.
//!
//! The agent depends on external capability objects it does not own. The
//! [`CapabilityRegistry`] holds exactly one active implementation per name,
//! tagged with where it came from. [`HealthMonitor`] probes the required
//! names and hands failures to [`RepairManager`], which swaps in a minimal
//! fallback so dependents keep working in a degraded mode.

mod fallback;
mod health;
mod repair;

pub use fallback::MinimalFallback;
pub use health::{DEFAULT_HEALTH_PERIOD, HealthCycle, HealthMonitor, HealthReport};
pub use repair::{FallbackFactory, RepairManager, RepairMemory, RepairOutcome, RepairRecord};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CapabilityError;

/// Where the active implementation of a capability came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the host at load time.
    Primary,
    /// Installed by repair.
    Fallback,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// An external capability the agent relies on.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Cheap functional check.
    async fn probe(&self) -> Result<(), CapabilityError>;

    /// Call a method on the capability.
    async fn invoke(&self, method: &str, args: Value) -> Result<Value, CapabilityError>;
}

#[derive(Clone)]
struct Installed {
    capability: Arc<dyn Capability>,
    provenance: Provenance,
    installed_at: DateTime<Utc>,
}

/// Status of one installed capability.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub provenance: Provenance,
    pub installed_at: DateTime<Utc>,
}

/// Availability of a required capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityAvailability {
    pub available: bool,
    pub provenance: Option<Provenance>,
    pub is_fallback: bool,
}

/// Name → active implementation.
#[derive(Default)]
pub struct CapabilityRegistry {
    slots: RwLock<HashMap<String, Installed>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Installed>> {
        match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Installed>> {
        match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install a host-supplied implementation. Replaces whatever was
    /// active, fallback included.
    pub fn install_primary(&self, capability: Arc<dyn Capability>) -> Option<Provenance> {
        self.install(capability, Provenance::Primary)
    }

    /// Install a fallback implementation.
    pub fn install_fallback(&self, capability: Arc<dyn Capability>) -> Option<Provenance> {
        self.install(capability, Provenance::Fallback)
    }

    fn install(&self, capability: Arc<dyn Capability>, provenance: Provenance) -> Option<Provenance> {
        let name = capability.name().to_string();
        let previous = self.write().insert(
            name.clone(),
            Installed {
                capability,
                provenance,
                installed_at: Utc::now(),
            },
        );
        let previous = previous.map(|p| p.provenance);

        tracing::info!(
            capability = %name,
            provenance = provenance.as_str(),
            replaced = ?previous.map(|p| p.as_str()),
            "Capability installed"
        );
        previous
    }

    /// The active implementation, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.read().get(name).map(|i| Arc::clone(&i.capability))
    }

    /// Remove the active implementation.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let removed = self.write().remove(name).map(|i| i.capability);
        if removed.is_some() {
            tracing::info!(capability = name, "Capability removed");
        }
        removed
    }

    pub fn provenance(&self, name: &str) -> Option<Provenance> {
        self.read().get(name).map(|i| i.provenance)
    }

    pub fn is_fallback(&self, name: &str) -> bool {
        self.provenance(name) == Some(Provenance::Fallback)
    }

    /// Call `method` on the active implementation of `name`.
    pub async fn invoke(&self, name: &str, method: &str, args: Value) -> Result<Value, CapabilityError> {
        let capability = self.get(name).ok_or_else(|| CapabilityError::NotFound {
            name: name.to_string(),
        })?;
        capability.invoke(method, args).await
    }

    /// Everything installed, sorted by name.
    pub fn snapshot(&self) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .read()
            .iter()
            .map(|(name, installed)| CapabilityInfo {
                name: name.clone(),
                provenance: installed.provenance,
                installed_at: installed.installed_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Availability of each of `names`.
    pub fn availability<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, CapabilityAvailability> {
        let slots = self.read();
        names
            .into_iter()
            .map(|name| {
                let provenance = slots.get(name).map(|i| i.provenance);
                (
                    name.to_string(),
                    CapabilityAvailability {
                        available: provenance.is_some(),
                        provenance,
                        is_fallback: provenance == Some(Provenance::Fallback),
                    },
                )
            })
            .collect()
    }
}
