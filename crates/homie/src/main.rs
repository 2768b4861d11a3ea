#[cfg(feature = "adc")]
mod adc;
mod clock;
mod config;
mod controller;
mod db;
mod hardware;
mod pump;
mod ring;
mod sampler;
mod settings;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod web;

#[cfg(not(any(feature = "adc", feature = "sim")))]
compile_error!("enable the `adc` feature (ADS1115 board) or the `sim` feature (simulated sensors)");

use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use config::Config;
use controller::Controller;
use db::Db;
use hardware::SensorBoard;
use pump::RelayPump;
use sampler::SensorSampler;
use settings::SettingsStore;
use state::AppState;

const DEFAULT_CONFIG_PATH: &str = "homie.toml";
const DEFAULT_DB_URL: &str = "sqlite:homie.db?mode=rwc";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let mut cfg = match env::var("CONFIG_PATH") {
        Ok(path) => config::load(&path)?,
        Err(_) => config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }
    if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
        cfg.pump.active_low = v == "1" || v.eq_ignore_ascii_case("true");
    }
    info!(
        port = cfg.web.port,
        pump_gpio = cfg.pump.gpio_pin,
        active_low = cfg.pump.active_low,
        digital_enabled = cfg.sensors.digital_enabled,
        "config loaded"
    );

    // ── Runtime settings ────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let settings = Arc::new(SettingsStore::open(db, cfg.default_settings()).await?);

    // ── Hardware ────────────────────────────────────────────────────
    let board = build_board(&cfg)?;
    let pump_pin = u8::try_from(cfg.pump.gpio_pin).context("pump.gpio_pin")?;
    let pump = RelayPump::new(pump_pin, cfg.pump.active_low)?;

    let sampler = SensorSampler::new(board, cfg.sampler_options());
    let controller = Controller::new(
        sampler,
        Box::new(pump),
        Arc::new(SystemClock::new()),
        Arc::clone(&settings),
        cfg.controller_options(),
    );
    let state = AppState::new(controller, settings, cfg.local_network()?);

    // ── Control loop (dedicated thread) ─────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    let control = {
        let shared = Arc::clone(&state.controller);
        let stop = Arc::clone(&stop);
        let tick = cfg.tick();
        std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || controller::run(shared, tick, stop))
            .context("failed to spawn control thread")?
    };

    // ── Web server until Ctrl-C ─────────────────────────────────────
    let served = web::serve(state.clone(), cfg.web.port, shutdown_signal()).await;

    stop.store(true, Ordering::Relaxed);
    match tokio::task::spawn_blocking(move || control.join()).await {
        Ok(Ok(())) => {}
        _ => error!("control thread did not exit cleanly"),
    }
    state.controller.lock().await.shutdown();

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(feature = "adc")]
fn build_board(cfg: &Config) -> Result<Box<dyn SensorBoard>> {
    let s = &cfg.sensors;
    let pin = |key: &str, v: i64| u8::try_from(v).with_context(|| format!("sensors.{key}"));

    let wiring = adc::AdcWiring {
        i2c_address: s.i2c_address,
        tank_channel: pin("tank_channel", s.tank_channel)?,
        plant_channel: pin("plant_channel", s.plant_channel)?,
        power_gpio_pins: s
            .power_gpio_pins
            .iter()
            .map(|p| pin("power_gpio_pins", *p))
            .collect::<Result<_>>()?,
        digital_gpio_pin: if s.digital_enabled {
            Some(pin("digital_gpio_pin", s.digital_gpio_pin)?)
        } else {
            None
        },
        calibration: cfg.sampler_options().calibration,
    };
    Ok(Box::new(adc::AdcBoard::new(&wiring)?))
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn build_board(cfg: &Config) -> Result<Box<dyn SensorBoard>> {
    let scenario = sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    info!(%scenario, "using simulated sensor board");
    Ok(Box::new(sim::SimBoard::new(
        scenario,
        cfg.sampler_options().calibration,
    )))
}
