//! Foreground hub runner.
//!
//! Configuration comes from the environment; argument parsing and
//! daemonization belong to the operating integration layer. Runs until
//! SIGINT/SIGTERM, then shuts down gracefully.

use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mergeflow_hub::{Hub, HubConfig, HubError};
use mergeflow_types::{AgentType, Tier};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn build_config() -> HubConfig {
    let work_dir = env_or("MERGEFLOW_WORK_DIR", ".mergeflow");
    let repo_dir = env_or("MERGEFLOW_REPO_DIR", ".");
    let mut config = HubConfig::new(work_dir, repo_dir);

    config.store_url = env_or("MERGEFLOW_STORE_URL", &config.store_url);
    config.plan_file = env_or("MERGEFLOW_PLAN_FILE", &config.plan_file);
    if let Ok(raw) = std::env::var("MERGEFLOW_HEARTBEAT_INTERVAL_MS") {
        if let Ok(ms) = raw.parse::<u64>() {
            config.heartbeat_interval = Duration::from_millis(ms);
            config.heartbeat_timeout = Duration::from_millis(ms * 3);
        }
    }
    if let Ok(raw) = std::env::var("MERGEFLOW_AGENT_PROGRAM") {
        config.agent_program = raw.into();
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(graceful) => {
            if !graceful {
                std::process::exit(HubError::ShutdownTimeout.exit_code());
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "hub failed");
            let code = err
                .downcast_ref::<HubError>()
                .map(HubError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run() -> anyhow::Result<bool> {
    let config = build_config();
    let hub = Hub::start(config).await.context("hub startup")?;

    if let Ok(raw) = std::env::var("MERGEFLOW_AGENTS") {
        if let Ok(count) = raw.parse::<usize>() {
            hub.spawn_agents(AgentType::Worker, Tier::Mid, count)
                .await
                .context("agent spawn")?;
        }
    }

    wait_for_signal().await;

    let outcome = hub.stop().await;
    Ok(outcome.graceful)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
