//! Dry-run entry point wired to the simulated venue. The engine itself is
//! venue-agnostic: live trading means embedding the library with a real
//! [`deltamm::ExchangeGateway`] implementation, so this binary refuses to
//! start with `dry_run = false`.

use std::sync::Arc;

use anyhow::{Context, Result};

use deltamm::{Engine, EngineConfig, EventLog, JsonlSink, SimGateway};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    anyhow::ensure!(
        cfg.dry_run,
        "this binary wires the simulated venue; live trading requires an exchange gateway"
    );

    let sink = Arc::new(JsonlSink::open(&cfg.log_path).context("opening event log")?);
    let log = EventLog::new(sink);
    let gateway = Arc::new(SimGateway::new(
        3_500.0,
        0.0005,
        cfg.expected_position_mode.clone(),
    ));

    Engine::new(cfg, gateway, log).run().await
}
