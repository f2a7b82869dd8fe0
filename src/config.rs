//! Configuration for the heartbeat agent.
//!
//! Values come from environment variables (a `.env` file is loaded first),
//! then an optional TOML file overrides them, then CLI flags override
//! both. Everything is validated once, up front.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{
    CorrelationMode, DEFAULT_EVENT_HISTORY, DEFAULT_INTERVAL, DEFAULT_MAX_ATTEMPTS, DEFAULT_REPLY_TIMEOUT,
    DEFAULT_RETRY_DELAY, MAX_INTERVAL, MIN_INTERVAL, RoutingTable,
};
use crate::capability::DEFAULT_HEALTH_PERIOD;
use crate::error::ConfigError;

pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_REQUIRED_CAPABILITY: &str = "dom_interface";

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control server base URL ticks are routed under.
    pub base_url: String,
    pub interval: Duration,
    pub reply_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub health_period: Duration,
    /// Tick outcomes kept for `getTemporalEvents`; 0 keeps none.
    pub event_history: usize,
    /// Bind address of the local control server.
    pub control_addr: SocketAddr,
    pub correlation: CorrelationMode,
    /// Optional JSON hook bundle.
    pub hooks_file: Option<PathBuf>,
    /// Capabilities the health monitor watches.
    pub required_capabilities: Vec<String>,
    /// Routes added on top of the defaults.
    pub routes: BTreeMap<String, String>,
}

/// The shape of the optional TOML file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub interval_secs: Option<u64>,
    pub reply_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub health_period_secs: Option<u64>,
    pub event_history: Option<usize>,
    pub control_addr: Option<String>,
    pub correlation: Option<CorrelationMode>,
    pub hooks_file: Option<PathBuf>,
    pub required_capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Read-only view of the settings, as reported by the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub reply_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub health_period_secs: u64,
    pub event_history: usize,
    pub base_url: String,
    pub correlation: CorrelationMode,
}

impl AgentConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("HEARTBEAT_BASE_URL").ok_or_else(|| ConfigError::MissingRequired {
            key: "HEARTBEAT_BASE_URL".to_string(),
        })?;

        let interval_secs = parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", DEFAULT_INTERVAL.as_secs())?;
        let reply_timeout_secs = parse_or(
            &lookup,
            "HEARTBEAT_REPLY_TIMEOUT_SECS",
            DEFAULT_REPLY_TIMEOUT.as_secs(),
        )?;
        let max_attempts = parse_or(&lookup, "HEARTBEAT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let retry_delay_ms = parse_or(
            &lookup,
            "HEARTBEAT_RETRY_DELAY_MS",
            DEFAULT_RETRY_DELAY.as_millis() as u64,
        )?;
        let health_period_secs = parse_or(
            &lookup,
            "HEARTBEAT_HEALTH_PERIOD_SECS",
            DEFAULT_HEALTH_PERIOD.as_secs(),
        )?;
        let event_history = parse_or(&lookup, "HEARTBEAT_EVENT_HISTORY", DEFAULT_EVENT_HISTORY)?;
        let control_addr = parse_or(
            &lookup,
            "HEARTBEAT_CONTROL_ADDR",
            parse_addr("HEARTBEAT_CONTROL_ADDR", DEFAULT_CONTROL_ADDR)?,
        )?;
        let correlation = match lookup("HEARTBEAT_CORRELATION") {
            Some(raw) => raw
                .parse::<CorrelationMode>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "HEARTBEAT_CORRELATION".to_string(),
                    message,
                })?,
            None => CorrelationMode::default(),
        };
        let hooks_file = lookup("HEARTBEAT_HOOKS_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let required_capabilities = match lookup("HEARTBEAT_REQUIRED_CAPABILITIES") {
            Some(raw) => split_list(&raw),
            None => vec![DEFAULT_REQUIRED_CAPABILITY.to_string()],
        };

        let config = Self {
            base_url,
            interval: Duration::from_secs(interval_secs),
            reply_timeout: Duration::from_secs(reply_timeout_secs),
            max_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            health_period: Duration::from_secs(health_period_secs),
            event_history,
            control_addr,
            correlation,
            hooks_file,
            required_capabilities,
            routes: BTreeMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Override with values from a TOML file.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut merged = self.clone();
        merged.merge(file)?;
        merged.validate()?;
        *self = merged;
        Ok(())
    }

    fn merge(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(secs) = file.interval_secs {
            self.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.reply_timeout_secs {
            self.reply_timeout = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = file.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(ms) = file.retry_delay_ms {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.health_period_secs {
            self.health_period = Duration::from_secs(secs);
        }
        if let Some(event_history) = file.event_history {
            self.event_history = event_history;
        }
        if let Some(addr) = file.control_addr {
            self.control_addr = parse_addr("control_addr", &addr)?;
        }
        if let Some(correlation) = file.correlation {
            self.correlation = correlation;
        }
        if let Some(hooks_file) = file.hooks_file {
            self.hooks_file = Some(hooks_file);
        }
        if let Some(required) = file.required_capabilities {
            self.required_capabilities = required;
        }
        self.routes.extend(file.routes);
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidValue {
            key: "base_url".to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "base_url".to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL {
            return Err(ConfigError::InvalidValue {
                key: "interval".to_string(),
                message: format!(
                    "{}s is outside {}s..={}s",
                    self.interval.as_secs(),
                    MIN_INTERVAL.as_secs(),
                    MAX_INTERVAL.as_secs()
                ),
            });
        }
        if self.reply_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "reply_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.health_period.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "health_period".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        // Same checks the router applies at startup.
        let table = RoutingTable::new();
        for (action, path) in &self.routes {
            table
                .insert(action, path)
                .map_err(|e| ConfigError::InvalidValue {
                    key: format!("routes.{}", action),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Settings as reported to clients, with the live interval.
    pub fn settings_view(&self, interval: Duration) -> SettingsView {
        SettingsView {
            interval_secs: interval.as_secs(),
            min_interval_secs: MIN_INTERVAL.as_secs(),
            max_interval_secs: MAX_INTERVAL.as_secs(),
            reply_timeout_secs: self.reply_timeout.as_secs(),
            max_attempts: self.max_attempts,
            retry_delay_ms: self.retry_delay.as_millis() as u64,
            health_period_secs: self.health_period.as_secs(),
            event_history: self.event_history,
            base_url: self.base_url.clone(),
            correlation: self.correlation,
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_addr(key: &str, raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "http://localhost:8000")]))
                .unwrap();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.reply_timeout, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.health_period, Duration::from_secs(60));
        assert_eq!(config.event_history, 100);
        assert_eq!(config.control_addr.to_string(), "127.0.0.1:8787");
        assert_eq!(config.correlation, CorrelationMode::Exact);
        assert_eq!(config.required_capabilities, vec!["dom_interface"]);
    }

    #[test]
    fn test_base_url_required() {
        let err = AgentConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key } if key == "HEARTBEAT_BASE_URL"));
    }

    #[test]
    fn test_env_values_parsed_and_validated() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("HEARTBEAT_BASE_URL", "https://example.com/api"),
            ("HEARTBEAT_INTERVAL_SECS", "120"),
            ("HEARTBEAT_CORRELATION", "single_slot"),
            ("HEARTBEAT_REQUIRED_CAPABILITIES", "dom_interface, speech,"),
        ]))
        .unwrap();
        assert_eq!(config.interval, Duration::from_secs(120));
        assert_eq!(config.correlation, CorrelationMode::SingleSlot);
        assert_eq!(config.required_capabilities, vec!["dom_interface", "speech"]);

        for (key, value) in [
            ("HEARTBEAT_INTERVAL_SECS", "4"),
            ("HEARTBEAT_INTERVAL_SECS", "soon"),
            ("HEARTBEAT_MAX_ATTEMPTS", "0"),
            ("HEARTBEAT_CORRELATION", "fuzzy"),
            ("HEARTBEAT_CONTROL_ADDR", "localhost"),
        ] {
            let result = AgentConfig::from_lookup(lookup(&[
                ("HEARTBEAT_BASE_URL", "http://localhost:8000"),
                (key, value),
            ]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { .. })),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let err = AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "ftp://example.com")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_toml_overlay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
interval_secs = 15
correlation = "single_slot"
event_history = 20

[routes]
summarize = "/summarize"
"#
        )
        .unwrap();

        let mut config =
            AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "http://localhost:8000")]))
                .unwrap();
        config.apply_file(file.path()).unwrap();

        assert_eq!(config.interval, Duration::from_secs(15));
        assert_eq!(config.correlation, CorrelationMode::SingleSlot);
        assert_eq!(config.routes["summarize"], "/summarize");
        assert_eq!(config.event_history, 20);
        assert_eq!(config.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_toml_errors() {
        let mut config =
            AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "http://localhost:8000")]))
                .unwrap();

        let missing = config.apply_file(Path::new("/nonexistent/heartbeat.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "interval_secs = \"often\"").unwrap();
        assert!(matches!(
            config.apply_file(bad.path()),
            Err(ConfigError::Parse { .. })
        ));

        let mut out_of_range = tempfile::NamedTempFile::new().unwrap();
        writeln!(out_of_range, "interval_secs = 301").unwrap();
        assert!(matches!(
            config.apply_file(out_of_range.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_route_paths_checked_like_the_router() {
        let mut root_only = tempfile::NamedTempFile::new().unwrap();
        writeln!(root_only, "[routes]\nsummarize = \"/\"").unwrap();

        let mut config =
            AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "http://localhost:8000")]))
                .unwrap();
        let err = config.apply_file(root_only.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "routes.summarize"));
        assert!(config.routes.is_empty());

        config.routes.insert("  ".to_string(), "/x".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_settings_view_uses_live_interval() {
        let config =
            AgentConfig::from_lookup(lookup(&[("HEARTBEAT_BASE_URL", "http://localhost:8000")]))
                .unwrap();
        let view = config.settings_view(Duration::from_secs(45));
        assert_eq!(view.interval_secs, 45);
        assert_eq!(view.min_interval_secs, 5);
        assert_eq!(view.max_interval_secs, 300);

        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["correlation"], "exact");
        assert_eq!(value["retryDelayMs"], 1000);
    }
}
