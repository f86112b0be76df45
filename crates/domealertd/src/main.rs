mod config;
mod digital;
mod error;
mod export;
mod link;
mod onewire;
mod smoother;
mod state;
mod supervisor;
mod switches;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::EnvFilter;

use digital::{DigitalWatcher, SerialConnector};
use export::Exporter;
use onewire::OneWireWatcher;
use switches::SwitchWatcher;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "domealert.toml".to_string());
    let cfg = config::load(&config_path)?;

    let window = cfg.median_window();
    let timeout = cfg.timeout();
    let poll = cfg.poll_interval();

    // ── Digital (serial) sensors ────────────────────────────────────
    let digital = DigitalWatcher::new(&cfg.digital, window, timeout);
    // Validation guarantees [serial] whenever digital sensors are listed.
    if let Some(serial) = &cfg.serial {
        digital.spawn(SerialConnector::new(serial), serial.read_timeout());
    }

    // ── One-wire probes ─────────────────────────────────────────────
    let onewire = OneWireWatcher::new(&cfg.onewire_root, &cfg.onewire, window, timeout);
    onewire.spawn(poll);

    // ── Switch bank + relay ─────────────────────────────────────────
    let switches = if cfg.switches.is_empty() {
        None
    } else {
        let (inputs, relay) = switches::open()?;
        let watcher = SwitchWatcher::new(&cfg.switches, relay, timeout);
        watcher.spawn(inputs, poll);
        Some(watcher)
    };

    info!(
        name = %cfg.name,
        serial = cfg.serial.is_some(),
        switches = switches.is_some(),
        "watchers started"
    );

    // ── Export API ──────────────────────────────────────────────────
    let ip: IpAddr = cfg
        .ip
        .parse()
        .with_context(|| format!("invalid listen address: {}", cfg.ip))?;
    let state = AppState::new(Exporter::new(digital, onewire, switches), &cfg);
    web::serve(state, SocketAddr::new(ip, cfg.port)).await
}
