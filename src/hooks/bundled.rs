//! Bundled hook implementations and declarative hook registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hooks::{Hook, HookError, HookEvent, HookPoint, HookRegistryBuilder};

const AUDIT_PRIORITY: u32 = 25;
const DEFAULT_WEBHOOK_PRIORITY: u32 = 300;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 2000;
const MAX_HOOK_TIMEOUT_MS: u64 = 30_000;

const ALL_HOOK_POINTS: [HookPoint; 8] = [
    HookPoint::Started,
    HookPoint::Stopped,
    HookPoint::TickSent,
    HookPoint::ReplyReceived,
    HookPoint::AttemptFailed,
    HookPoint::Degraded,
    HookPoint::IntervalChanged,
    HookPoint::CapabilityRepaired,
];

/// Errors while parsing or compiling declarative hook bundles.
#[derive(Debug, thiserror::Error)]
pub enum HookBundleError {
    #[error("Invalid hook bundle format: {0}")]
    InvalidFormat(String),

    #[error("Hook '{hook}' must declare at least one hook point")]
    MissingHookPoints { hook: String },

    #[error("Hook '{hook}' timeout must be between 1 and {max_ms} ms")]
    InvalidTimeout { hook: String, max_ms: u64 },

    #[error("Outbound webhook hook '{hook}' has invalid url: {url}")]
    InvalidWebhookUrl { hook: String, url: String },
}

/// A declarative hook bundle loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookBundleConfig {
    /// Fire-and-forget webhook notifications on selected hook points.
    #[serde(default)]
    pub outbound_webhooks: Vec<OutboundWebhookConfig>,
}

impl HookBundleConfig {
    /// Parse a hook bundle from JSON value.
    ///
    /// Accepts either:
    /// - object form: `{ "outbound_webhooks": [...] }`
    /// - array form:  `[ {webhook}, {webhook} ]`
    pub fn from_value(value: &serde_json::Value) -> Result<Self, HookBundleError> {
        if value.is_array() {
            let outbound_webhooks: Vec<OutboundWebhookConfig> =
                serde_json::from_value(value.clone())
                    .map_err(|e| HookBundleError::InvalidFormat(e.to_string()))?;
            return Ok(Self { outbound_webhooks });
        }

        serde_json::from_value(value.clone())
            .map_err(|e| HookBundleError::InvalidFormat(e.to_string()))
    }

    /// Parse a hook bundle from JSON text.
    pub fn from_json(text: &str) -> Result<Self, HookBundleError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| HookBundleError::InvalidFormat(e.to_string()))?;
        Self::from_value(&value)
    }
}

/// Summary of hook registrations performed from a bundle.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookRegistrationSummary {
    /// Number of built-in hook registrations.
    pub hooks: usize,
    /// Number of outbound webhook hook registrations.
    pub outbound_webhooks: usize,
    /// Number of invalid registrations skipped.
    pub errors: usize,
}

impl HookRegistrationSummary {
    /// Total number of hooks successfully registered.
    pub fn total_registered(&self) -> usize {
        self.hooks + self.outbound_webhooks
    }

    pub fn merge(&mut self, other: HookRegistrationSummary) {
        self.hooks += other.hooks;
        self.outbound_webhooks += other.outbound_webhooks;
        self.errors += other.errors;
    }
}

/// Register the hooks that always ship with the agent.
pub fn register_bundled_hooks(builder: &mut HookRegistryBuilder) -> HookRegistrationSummary {
    builder.register_with_priority(Arc::new(AuditLogHook), AUDIT_PRIORITY);

    HookRegistrationSummary {
        hooks: 1,
        outbound_webhooks: 0,
        errors: 0,
    }
}

/// Register all hooks from a declarative bundle. Invalid entries are
/// skipped and counted.
pub fn register_bundle(
    builder: &mut HookRegistryBuilder,
    source: &str,
    bundle: HookBundleConfig,
) -> HookRegistrationSummary {
    let mut summary = HookRegistrationSummary::default();

    for webhook in bundle.outbound_webhooks {
        match OutboundWebhookHook::from_config(source, webhook) {
            Ok((hook, priority)) => {
                builder.register_with_priority(Arc::new(hook), priority);
                summary.outbound_webhooks += 1;
            }
            Err(err) => {
                summary.errors += 1;
                tracing::warn!(source = source, error = %err, "Skipping invalid outbound webhook hook");
            }
        }
    }

    summary
}

/// Declarative fire-and-forget outbound webhook hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundWebhookConfig {
    /// Stable webhook hook name (scoped with source during registration).
    pub name: String,
    /// Lifecycle points that trigger this webhook.
    pub points: Vec<HookPoint>,
    /// Target URL.
    pub url: String,
    /// Optional static headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Optional priority override (lower runs first).
    #[serde(default)]
    pub priority: Option<u32>,
}

/// Built-in audit trail hook that logs lifecycle events.
struct AuditLogHook;

impl Hook for AuditLogHook {
    fn name(&self) -> &str {
        "builtin.audit_log"
    }

    fn hook_points(&self) -> &[HookPoint] {
        &ALL_HOOK_POINTS
    }

    fn on_event(&self, event: &HookEvent) -> Result<(), HookError> {
        tracing::debug!(
            target: "hooks::audit",
            hook = self.name(),
            point = event.hook_point().as_str(),
            event = ?event,
            "Heartbeat lifecycle event"
        );

        Ok(())
    }
}

/// Runtime outbound webhook hook.
struct OutboundWebhookHook {
    name: String,
    points: Vec<HookPoint>,
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl OutboundWebhookHook {
    fn from_config(
        source: &str,
        config: OutboundWebhookConfig,
    ) -> Result<(Self, u32), HookBundleError> {
        let scoped_name = format!("{}::{}", source, config.name);

        if config.points.is_empty() {
            return Err(HookBundleError::MissingHookPoints { hook: scoped_name });
        }

        if reqwest::Url::parse(&config.url).is_err() {
            return Err(HookBundleError::InvalidWebhookUrl {
                hook: scoped_name,
                url: config.url,
            });
        }

        let timeout = timeout_from_ms(
            config.timeout_ms.unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS),
            &scoped_name,
        )?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HookBundleError::InvalidFormat(e.to_string()))?;

        let hook = Self {
            name: scoped_name,
            points: config.points,
            client,
            url: config.url,
            headers: config.headers,
        };

        Ok((hook, config.priority.unwrap_or(DEFAULT_WEBHOOK_PRIORITY)))
    }
}

#[derive(Debug, Serialize)]
struct OutboundWebhookPayload {
    delivery_id: uuid::Uuid,
    hook: String,
    point: String,
    timestamp: String,
    event: serde_json::Value,
}

impl Hook for OutboundWebhookHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn hook_points(&self) -> &[HookPoint] {
        &self.points
    }

    fn on_event(&self, event: &HookEvent) -> Result<(), HookError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| HookError::Failed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        let payload = OutboundWebhookPayload {
            delivery_id: uuid::Uuid::new_v4(),
            hook: self.name.clone(),
            point: event.hook_point().as_str().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let hook_name = self.name.clone();

        runtime.spawn(async move {
            let mut request = client.post(url).json(&payload);

            for (name, value) in headers {
                request = request.header(name, value);
            }

            if let Err(err) = request.send().await {
                tracing::warn!(hook = %hook_name, error = %err, "Outbound webhook delivery failed");
            }
        });

        Ok(())
    }
}

fn timeout_from_ms(ms: u64, hook_name: &str) -> Result<Duration, HookBundleError> {
    if ms == 0 || ms > MAX_HOOK_TIMEOUT_MS {
        return Err(HookBundleError::InvalidTimeout {
            hook: hook_name.to_string(),
            max_ms: MAX_HOOK_TIMEOUT_MS,
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookRegistry;

    fn webhook(name: &str, url: &str, points: Vec<HookPoint>) -> OutboundWebhookConfig {
        OutboundWebhookConfig {
            name: name.to_string(),
            points,
            url: url.to_string(),
            headers: HashMap::new(),
            timeout_ms: Some(1000),
            priority: None,
        }
    }

    #[test]
    fn test_parse_bundle_array_shorthand() {
        let value = serde_json::json!([
            {
                "name": "notify-degraded",
                "points": ["degraded"],
                "url": "http://127.0.0.1:9/hook"
            }
        ]);

        let parsed = HookBundleConfig::from_value(&value).unwrap();
        assert_eq!(parsed.outbound_webhooks.len(), 1);
        assert_eq!(parsed.outbound_webhooks[0].points, vec![HookPoint::Degraded]);
    }

    #[test]
    fn test_parse_bundle_rejects_garbage() {
        assert!(matches!(
            HookBundleConfig::from_json("{\"outbound_webhooks\": 3}"),
            Err(HookBundleError::InvalidFormat(_))
        ));
        assert!(HookBundleConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_invalid_webhooks_are_skipped() {
        let mut builder = HookRegistry::builder();
        let bundle = HookBundleConfig {
            outbound_webhooks: vec![
                webhook("no-points", "http://127.0.0.1:9/hook", vec![]),
                webhook("bad-url", "not a url", vec![HookPoint::Degraded]),
                OutboundWebhookConfig {
                    timeout_ms: Some(60_000),
                    ..webhook("slow", "http://127.0.0.1:9/hook", vec![HookPoint::Degraded])
                },
                webhook("ok", "http://127.0.0.1:9/hook", vec![HookPoint::Degraded]),
            ],
        };

        let summary = register_bundle(&mut builder, "file:hooks.json", bundle);
        assert_eq!(summary.outbound_webhooks, 1);
        assert_eq!(summary.errors, 3);

        let registry = builder.build();
        assert_eq!(registry.names(), vec!["file:hooks.json::ok"]);
    }

    #[test]
    fn test_webhook_timeout_bounds() {
        assert_eq!(
            timeout_from_ms(DEFAULT_WEBHOOK_TIMEOUT_MS, "hook").unwrap(),
            Duration::from_millis(2000)
        );
        assert_eq!(
            timeout_from_ms(MAX_HOOK_TIMEOUT_MS, "hook").unwrap(),
            Duration::from_secs(30)
        );
        assert!(matches!(
            timeout_from_ms(0, "hook"),
            Err(HookBundleError::InvalidTimeout { .. })
        ));

        let (hook, priority) = OutboundWebhookHook::from_config(
            "file:hooks.json",
            OutboundWebhookConfig {
                timeout_ms: None,
                ..webhook("defaulted", "http://127.0.0.1:9/hook", vec![HookPoint::Degraded])
            },
        )
        .unwrap();
        assert_eq!(hook.name, "file:hooks.json::defaulted");
        assert_eq!(priority, DEFAULT_WEBHOOK_PRIORITY);
    }

    #[tokio::test]
    async fn test_outbound_webhook_hook_is_fire_and_forget() {
        let mut builder = HookRegistry::builder();
        let mut summary = register_bundled_hooks(&mut builder);
        summary.merge(register_bundle(
            &mut builder,
            "file:hooks.json",
            HookBundleConfig {
                outbound_webhooks: vec![webhook(
                    "notify",
                    "http://127.0.0.1:9/hook",
                    vec![HookPoint::Degraded],
                )],
            },
        ));
        assert_eq!(summary.total_registered(), 2);

        let registry = builder.build();
        assert_eq!(
            registry.names(),
            vec!["builtin.audit_log", "file:hooks.json::notify"]
        );

        // Returns immediately regardless of webhook delivery result.
        registry.dispatch(&HookEvent::Degraded { attempts: 10 });
    }
}
