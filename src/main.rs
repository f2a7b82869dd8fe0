use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use heartbeat_agent::agent::{ActionRouter, HeartbeatPayload};
use heartbeat_agent::{AgentConfig, BuildOptions};

#[derive(Parser)]
#[command(
    name = "heartbeat-agent",
    about = "Periodic heartbeat with action routing, reply correlation and capability self-repair",
    version
)]
struct Cli {
    /// TOML file overriding environment configuration
    #[arg(long, short = 'c', global = true, env = "HEARTBEAT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "HEARTBEAT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the heartbeat loop, health monitor and control server
    Run {
        /// Override the control server address
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,

        /// Override the tick interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Action declared by every heartbeat payload
        #[arg(long)]
        action: Option<String>,

        /// Don't start the heartbeat until asked over the control server
        #[arg(long)]
        paused: bool,
    },

    /// Print the resolved action routes
    Routes,

    /// Validate configuration and print the resolved settings
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("heartbeat_agent=info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AgentConfig> {
    let mut config = AgentConfig::from_env().context("failed to load configuration")?;
    if let Some(path) = path {
        config
            .apply_file(path)
            .with_context(|| format!("failed to apply {}", path.display()))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            listen,
            interval,
            action,
            paused,
        } => {
            if let Some(addr) = listen {
                config.control_addr = addr;
            }
            if let Some(secs) = interval {
                config.interval = std::time::Duration::from_secs(secs);
                config.validate()?;
            }
            run(config, action, paused).await
        }
        Commands::Routes => {
            let router = ActionRouter::new(&config.base_url)?;
            for (action, path) in &config.routes {
                router.add_action_route(action, path)?;
            }
            for (action, path) in router.action_routes().iter() {
                println!("{:<20} {}{}", action, router.base_url(), path);
            }
            println!("{:<20} {}", "(default)", router.root());
            Ok(())
        }
        Commands::CheckConfig => {
            let settings = config.settings_view(config.interval);
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!("control_addr: {}", config.control_addr);
            println!("required_capabilities: {}", config.required_capabilities.join(", "));
            if let Some(path) = &config.hooks_file {
                let hooks = heartbeat_agent::app::load_hooks(&config)?;
                println!("hooks ({}): {}", path.display(), hooks.names().join(", "));
            }
            Ok(())
        }
    }
}

async fn run(config: AgentConfig, action: Option<String>, paused: bool) -> anyhow::Result<()> {
    let addr = config.control_addr;
    let health_period = config.health_period;

    let payloads = match action {
        Some(action) => HeartbeatPayload::new().with_action(action),
        None => HeartbeatPayload::new(),
    };
    let runtime = heartbeat_agent::build(
        config,
        BuildOptions {
            transport: None,
            payloads: Some(Arc::new(payloads)),
        },
    )?;

    let health_task = Arc::clone(&runtime.health).spawn(health_period);

    if !paused {
        runtime.scheduler.start().await?;
    }

    // Report degradation as it happens.
    let mut status_rx = runtime.scheduler.watch_status();
    let degraded_watch = tokio::spawn(async move {
        let mut was_degraded = false;
        while status_rx.changed().await.is_ok() {
            let result = status_rx.borrow_and_update().ensure_not_degraded();
            match result {
                Err(err) if !was_degraded => {
                    tracing::error!(error = %err, "Heartbeat needs a manual restart");
                    was_degraded = true;
                }
                Ok(()) => was_degraded = false,
                Err(_) => {}
            }
        }
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    };

    heartbeat_agent::control::serve(Arc::clone(&runtime.surface), addr, shutdown)
        .await
        .with_context(|| format!("control server on {} failed", addr))?;

    health_task.abort();
    degraded_watch.abort();
    runtime.shutdown().await;
    Ok(())
}
