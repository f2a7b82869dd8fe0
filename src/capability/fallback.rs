//! The stand-in installed when a required capability is missing.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::capability::Capability;
use crate::error::CapabilityError;

/// Answers `ping` and `describe`; every other method is unsupported so
/// callers fail loudly instead of silently doing nothing.
#[derive(Debug, Clone)]
pub struct MinimalFallback {
    name: String,
}

impl MinimalFallback {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Capability for MinimalFallback {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn invoke(&self, method: &str, _args: Value) -> Result<Value, CapabilityError> {
        match method {
            "ping" => Ok(json!("pong")),
            "describe" => Ok(json!({
                "name": self.name,
                "fallback": true,
                "methods": ["ping", "describe"],
            })),
            other => Err(CapabilityError::Unsupported {
                name: self.name.clone(),
                method: other.to_string(),
            }),
        }
    }
}
