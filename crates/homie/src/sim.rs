//! Simulated sensor board for development without hardware.
//!
//! Both analog channels follow a random walk with mean reversion inside the
//! calibration range, plus per-read ADC noise and occasional spikes. The tank
//! drains slowly and is "refilled" when it runs dry. The digital input goes
//! HIGH when the simulated soil is close to saturation.

use std::fmt;

use crate::hardware::{AnalogChannel, SensorBoard};
use crate::sampler::Calibration;

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Simulation profile, selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Soil drifts toward dry, moderate noise.
    Drying,
    /// Hovers mid-range with little noise.
    Stable,
    /// Heavy noise and frequent spikes; exercises the averaging window.
    Flaky,
    /// Soil near saturation; the flood ceiling should keep the pump off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

/// One simulated analog channel, in raw units. Higher raw = drier / emptier.
struct Channel {
    base: f64,
    drift: f64,
    center: f64,
}

pub struct SimBoard {
    tank: Channel,
    plant: Channel,
    // raw endpoints: `wet` maps to 1000, `dry` to 0
    wet: f64,
    dry: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    powered: bool,
}

impl SimBoard {
    pub fn new(scenario: Scenario, calibration: Calibration) -> Self {
        let wet = f64::from(calibration.raw_min);
        let dry = f64::from(calibration.raw_max);
        let range = dry - wet; // negative for inverted calibrations

        // fractions of the range; 0.0 = wet end, 1.0 = dry end
        let (plant_start, plant_drift, walk, noise, spike_prob, spike) = match scenario {
            Scenario::Drying => (0.5, 0.004, 0.01, 0.01, 0.03_f32, 0.2),
            Scenario::Stable => (0.5, 0.0, 0.004, 0.005, 0.005, 0.1),
            Scenario::Flaky => (0.5, 0.002, 0.02, 0.04, 0.10, 0.3),
            Scenario::Wet => (0.03, 0.0, 0.006, 0.01, 0.02, 0.15),
        };

        Self {
            tank: Channel {
                base: wet + 0.1 * range,
                drift: 0.002 * range,
                center: wet + 0.1 * range,
            },
            plant: Channel {
                base: wet + plant_start * range,
                drift: plant_drift * range,
                center: wet + plant_start * range,
            },
            wet,
            dry,
            walk_sigma: walk * range.abs(),
            mean_reversion: if plant_drift > 0.0 { 0.0 } else { 0.05 },
            noise_sigma: noise * range.abs(),
            spike_prob,
            spike_sigma: spike * range.abs(),
            powered: false,
        }
    }

    fn lo(&self) -> f64 {
        self.wet.min(self.dry)
    }

    fn hi(&self) -> f64 {
        self.wet.max(self.dry)
    }

    fn step_tank(&mut self) {
        let (lo, hi) = (self.lo(), self.hi());
        let t = &mut self.tank;
        t.base += t.drift + gaussian(0.0, self.walk_sigma * 0.2);
        // ran dry: refilled
        if (t.base - self.dry).abs() < (t.drift.abs() * 2.0).max(1.0) || t.base > hi || t.base < lo
        {
            t.base = t.center;
        }
    }

    fn step_plant(&mut self) {
        let (lo, hi) = (self.lo(), self.hi());
        let p = &mut self.plant;
        let pull = self.mean_reversion * (p.center - p.base);
        p.base = (p.base + p.drift + pull + gaussian(0.0, self.walk_sigma)).clamp(lo, hi);
    }

    fn observe(&self, base: f64) -> i32 {
        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        let margin = (self.hi() - self.lo()) * 0.25;
        (base + noise + spike)
            .round()
            .clamp(self.lo() - margin, self.hi() + margin) as i32
    }
}

impl SensorBoard for SimBoard {
    fn set_power(&mut self, on: bool) {
        self.powered = on;
    }

    fn read_raw(&mut self, channel: AnalogChannel) -> i32 {
        // unpowered probes float to the dry end
        if !self.powered {
            return self.dry as i32;
        }
        match channel {
            AnalogChannel::Tank => {
                self.step_tank();
                self.observe(self.tank.base)
            }
            AnalogChannel::Plant => {
                self.step_plant();
                self.observe(self.plant.base)
            }
        }
    }

    fn read_digital(&mut self) -> bool {
        let saturated = self.wet + 0.05 * (self.dry - self.wet);
        self.powered && (self.plant.base - self.wet).abs() <= (saturated - self.wet).abs()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
