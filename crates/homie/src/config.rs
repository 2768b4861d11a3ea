//! TOML device configuration: wiring, sensor calibration, control cadences,
//! buffer sizes and the initial runtime settings.
//!
//! Every section and key is optional; an empty file yields the stock
//! HydroHomie wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::controller::{ControllerOptions, DigitalPolarity, PumpPolicy};
use crate::sampler::{Calibration, SamplerOptions, LEVEL_MAX};
use crate::settings::Settings;
use crate::web::LocalNetwork;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web: WebSection,
    pub sensors: SensorSection,
    pub pump: PumpSection,
    pub timing: TimingSection,
    pub buffers: BufferSection,
    pub defaults: DefaultsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
    /// CIDR of the local network, e.g. "192.168.1.0/24". Without it,
    /// callers must share the /24 of the address the request arrived on.
    pub lan_subnet: Option<String>,
    pub tick_ms: u64,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: 80,
            lan_subnet: None,
            tick_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub tank_channel: i64,
    pub plant_channel: i64,
    pub i2c_address: u16,
    pub raw_min: i32,
    pub raw_max: i32,
    pub keep_powered: bool,
    pub power_gpio_pins: Vec<i64>,
    pub digital_enabled: bool,
    pub digital_gpio_pin: i64,
    /// `true`: the pot-full sensor reads HIGH when triggered.
    pub digital_triggered_high: bool,
}

impl Default for SensorSection {
    fn default() -> Self {
        let cal = Calibration::default();
        Self {
            tank_channel: 0,
            plant_channel: 1,
            i2c_address: 0x48,
            raw_min: cal.raw_min,
            raw_max: cal.raw_max,
            keep_powered: true,
            power_gpio_pins: vec![19],
            digital_enabled: false,
            digital_gpio_pin: 21,
            digital_triggered_high: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpSection {
    pub gpio_pin: i64,
    pub active_low: bool,
    /// Plant level above which the pump is never driven.
    pub flood_ceiling: i64,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            gpio_pin: 23,
            active_low: false,
            flood_ceiling: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub poll_interval_ms: u64,
    pub watering_poll_interval_ms: u64,
    pub history_interval_ms: u64,
    pub reads_per_poll: u32,
    pub settle_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            watering_poll_interval_ms: 500,
            history_interval_ms: 60_000,
            reads_per_poll: 5,
            settle_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub recent_window: usize,
    pub history_window: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            recent_window: 10,
            history_window: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub name: String,
    pub watering_interval: u32,
    pub watering_duration: u32,
    pub water_tank_threshold: i32,
    pub plant_flood_buffer: i32,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        let s = Settings::default();
        Self {
            name: s.name,
            watering_interval: s.watering_interval,
            watering_duration: s.watering_duration,
            water_tank_threshold: s.water_tank_threshold,
            plant_flood_buffer: s.plant_flood_buffer,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// ADS1115 single-ended inputs.
const VALID_ADC_CHANNELS: std::ops::RangeInclusive<i64> = 0..=3;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_web(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        if let Some(subnet) = &self.web.lan_subnet {
            if let Err(e) = LocalNetwork::parse(subnet) {
                errors.push(format!("web.lan_subnet: {e}"));
            }
        }
        if self.web.tick_ms == 0 {
            errors.push("web.tick_ms must be positive".to_string());
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;

        for (key, ch) in [("tank_channel", s.tank_channel), ("plant_channel", s.plant_channel)] {
            if !VALID_ADC_CHANNELS.contains(&ch) {
                errors.push(format!(
                    "sensors.{key} {ch} out of range (0-3)"
                ));
            }
        }
        if s.tank_channel == s.plant_channel {
            errors.push(format!(
                "sensors.tank_channel and sensors.plant_channel are both {}",
                s.tank_channel
            ));
        }

        if s.raw_min == s.raw_max {
            errors.push(format!(
                "sensors.raw_min and sensors.raw_max are both {}: calibration range is zero",
                s.raw_min
            ));
        }

        if !(0..=i64::from(LEVEL_MAX)).contains(&self.pump.flood_ceiling) {
            errors.push(format!(
                "pump.flood_ceiling {} out of range [0, {LEVEL_MAX}]",
                self.pump.flood_ceiling
            ));
        }
    }

    /// Every GPIO must be a usable header pin and no pin may serve two roles.
    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut pins: Vec<(String, i64)> = vec![("pump.gpio_pin".to_string(), self.pump.gpio_pin)];
        for (i, pin) in self.sensors.power_gpio_pins.iter().enumerate() {
            pins.push((format!("sensors.power_gpio_pins[{i}]"), *pin));
        }
        if self.sensors.digital_enabled {
            pins.push((
                "sensors.digital_gpio_pin".to_string(),
                self.sensors.digital_gpio_pin,
            ));
        }

        let mut seen: HashSet<i64> = HashSet::new();
        for (key, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{key}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("{key}: GPIO {pin} is already in use"));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (key, v) in [
            ("poll_interval_ms", t.poll_interval_ms),
            ("watering_poll_interval_ms", t.watering_poll_interval_ms),
            ("history_interval_ms", t.history_interval_ms),
        ] {
            if v == 0 {
                errors.push(format!("timing.{key} must be positive"));
            }
        }
        if t.reads_per_poll == 0 {
            errors.push("timing.reads_per_poll must be at least 1".to_string());
        }
        if self.buffers.recent_window == 0 {
            errors.push("buffers.recent_window must be positive".to_string());
        }
        if self.buffers.history_window == 0 {
            errors.push("buffers.history_window must be positive".to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Derived options
    // -----------------------------------------------------------------------

    pub fn sampler_options(&self) -> SamplerOptions {
        SamplerOptions {
            calibration: Calibration {
                raw_min: self.sensors.raw_min,
                raw_max: self.sensors.raw_max,
            },
            keep_powered: self.sensors.keep_powered,
            digital_enabled: self.sensors.digital_enabled,
            recent_window: self.buffers.recent_window,
            history_window: self.buffers.history_window,
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            watering_poll_interval: Duration::from_millis(self.timing.watering_poll_interval_ms),
            history_interval: Duration::from_millis(self.timing.history_interval_ms),
            reads_per_poll: self.timing.reads_per_poll,
            settle: Duration::from_millis(self.timing.settle_ms),
            policy: PumpPolicy {
                flood_ceiling: self.pump.flood_ceiling.clamp(0, i64::from(LEVEL_MAX)) as u16,
                digital: if !self.sensors.digital_enabled {
                    None
                } else if self.sensors.digital_triggered_high {
                    Some(DigitalPolarity::TriggeredHigh)
                } else {
                    Some(DigitalPolarity::TriggeredLow)
                },
            },
        }
    }

    pub fn default_settings(&self) -> Settings {
        let d = &self.defaults;
        Settings {
            name: d.name.clone(),
            watering_interval: d.watering_interval,
            watering_duration: d.watering_duration,
            water_tank_threshold: d.water_tank_threshold,
            plant_flood_buffer: d.plant_flood_buffer,
        }
    }

    pub fn local_network(&self) -> Result<LocalNetwork> {
        match &self.web.lan_subnet {
            Some(s) => LocalNetwork::parse(s),
            None => Ok(LocalNetwork::SameSubnet),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.web.tick_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the built-in defaults. Used for
/// the default path only; an explicitly configured path must exist.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        return load(path);
    }
    warn!(path, "config file not found, using built-in defaults");
    let config = Config::default();
    config.validate().context("invalid built-in config")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
