//! Building the payload for each tick.

use std::time::Duration;

use serde_json::{Map, Value, json};

/// What the scheduler knows when it asks for a payload.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub request_id: u64,
    pub generation: u64,
    /// 1-based tick number since the process started.
    pub tick: u64,
    /// Consecutive failures before this tick.
    pub attempt: u32,
    pub interval: Duration,
}

/// Produces the outgoing payload for a tick.
///
/// Called on the scheduler task; implementations must not block.
pub trait PayloadSource: Send + Sync {
    fn build(&self, ctx: &TickContext) -> Value;
}

impl<F> PayloadSource for F
where
    F: Fn(&TickContext) -> Value + Send + Sync,
{
    fn build(&self, ctx: &TickContext) -> Value {
        self(ctx)
    }
}

/// Default heartbeat payload.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatPayload {
    action: Option<String>,
    extra: Map<String, Value>,
}

impl HeartbeatPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an action so the router can pick a specific endpoint.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Add a static field to every payload.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl PayloadSource for HeartbeatPayload {
    fn build(&self, ctx: &TickContext) -> Value {
        let mut payload = json!({
            "type": "heartbeat",
            "requestId": ctx.request_id,
            "generation": ctx.generation,
            "tick": ctx.tick,
            "attempt": ctx.attempt,
            "intervalSecs": ctx.interval.as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(object) = payload.as_object_mut() {
            for (key, value) in &self.extra {
                object.insert(key.clone(), value.clone());
            }
            if let Some(ref action) = self.action {
                object.insert("action".to_string(), Value::String(action.clone()));
            }
        }

        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TickContext {
        TickContext {
            request_id: 9,
            generation: 2,
            tick: 3,
            attempt: 0,
            interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_default_payload_has_no_action() {
        let payload = HeartbeatPayload::new().build(&ctx());
        assert_eq!(payload["type"], "heartbeat");
        assert_eq!(payload["requestId"], 9);
        assert_eq!(payload["intervalSecs"], 30);
        assert!(payload.get("action").is_none());
    }

    #[test]
    fn test_action_and_fields_are_merged() {
        let payload = HeartbeatPayload::new()
            .with_action("reflect")
            .with_field("assigned_by", json!("agent"))
            .build(&ctx());
        assert_eq!(payload["action"], "reflect");
        assert_eq!(payload["assigned_by"], "agent");
    }

    #[test]
    fn test_closure_source() {
        let source = |ctx: &TickContext| json!({"task": [{"action": "web_search"}], "n": ctx.tick});
        assert_eq!(source.build(&ctx())["n"], 3);
    }
}
