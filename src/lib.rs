//! Heartbeat agent.
//!
//! Drives a periodic heartbeat exchange with a remote control server:
//! the scheduler ticks on a bounded interval, routes each payload by its
//! declared action, correlates the reply, retries a bounded number of
//! times and degrades when the server stays silent. Alongside it a health
//! monitor keeps required capabilities available, installing minimal
//! fallbacks when they go missing.

pub mod agent;
pub mod app;
pub mod capability;
pub mod config;
pub mod control;
pub mod error;
pub mod hooks;
pub mod transport;

pub use app::{AgentRuntime, BuildOptions, build};
pub use config::AgentConfig;
pub use error::{Error, Result};
