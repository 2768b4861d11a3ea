//! Sensor sampling: raw conversions → normalized 0–1000 readings, a
//! short-term averaging window, and the long-term history ring.
//!
//! The controller polls often (every 0.5–10 s) but writes history only once
//! per history interval. Between history writes the raw readings accumulate
//! in the short-term window; on a history write the window is averaged,
//! pushed to history, and cleared.

use crate::hardware::{AnalogChannel, SensorBoard};
use crate::ring::RingBuffer;

/// Upper bound of the normalized scale.
pub const LEVEL_MAX: u16 = 1000;

/// One sample of all channels, normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reading {
    /// Reservoir fullness, 0 = empty, 1000 = full.
    pub tank_level: u16,
    /// Soil moisture, 0 = dry, 1000 = saturated.
    pub plant_level: u16,
    /// Raw digital flag (`true` = input HIGH). Always `false` when the
    /// digital sensor is disabled.
    pub digital: bool,
}

impl Reading {
    /// Per-channel arithmetic mean (truncating) with a majority vote on the
    /// digital flag: set iff at least half of the readings have it set.
    /// Returns `None` for an empty input.
    pub fn mean<'a, I>(readings: I) -> Option<Reading>
    where
        I: IntoIterator<Item = &'a Reading>,
    {
        let mut count: u32 = 0;
        let (mut tank, mut plant, mut flags) = (0u32, 0u32, 0u32);
        for r in readings {
            count += 1;
            tank += u32::from(r.tank_level);
            plant += u32::from(r.plant_level);
            flags += u32::from(r.digital);
        }
        if count == 0 {
            return None;
        }
        Some(Reading {
            tank_level: (tank / count) as u16,
            plant_level: (plant / count) as u16,
            digital: 2 * flags >= count,
        })
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Raw-unit endpoints of the linear map onto the 0–1000 scale. The defaults
/// are the empirical range of the capacitive probes on a 12-bit ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub raw_min: i32,
    pub raw_max: i32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            raw_min: 1350,
            raw_max: 2000,
        }
    }
}

impl Calibration {
    /// Map `raw` linearly from `[raw_min, raw_max]` to `[0, 1000]`, invert,
    /// and clamp. Out-of-range inputs saturate at the ends of the scale.
    pub fn normalize(&self, raw: i32) -> u16 {
        let span = i64::from(self.raw_max) - i64::from(self.raw_min);
        if span == 0 {
            return 0;
        }
        let mapped = (i64::from(raw) - i64::from(self.raw_min)) * i64::from(LEVEL_MAX) / span;
        (i64::from(LEVEL_MAX) - mapped).clamp(0, i64::from(LEVEL_MAX)) as u16
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SamplerOptions {
    pub calibration: Calibration,
    /// Leave the rails energized between polls to skip settling time.
    pub keep_powered: bool,
    pub digital_enabled: bool,
    pub recent_window: usize,
    pub history_window: usize,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            keep_powered: false,
            digital_enabled: false,
            recent_window: 10,
            history_window: 1000,
        }
    }
}

pub struct SensorSampler {
    board: Box<dyn SensorBoard>,
    options: SamplerOptions,
    recent: RingBuffer<Reading>,
    history: RingBuffer<Reading>,
    last_value: Reading,
}

impl SensorSampler {
    /// Builds the sampler and powers the rails once so the first read does
    /// not hit cold sensors.
    pub fn new(board: Box<dyn SensorBoard>, options: SamplerOptions) -> Self {
        let mut sampler = Self {
            board,
            recent: RingBuffer::new(options.recent_window),
            history: RingBuffer::new(options.history_window),
            options,
            last_value: Reading::default(),
        };
        sampler.activate();
        sampler
    }

    pub fn activate(&mut self) {
        self.board.set_power(true);
    }

    /// No-op when the sampler is configured to keep the rails powered.
    pub fn deactivate(&mut self) {
        if self.options.keep_powered {
            return;
        }
        self.board.set_power(false);
    }

    /// Take one reading of every active channel.
    ///
    /// The raw reading always lands in the short-term window. With
    /// `update_history`, either the window average (`average_out`, which also
    /// clears the window) or the raw reading is appended to history. The
    /// returned value is what `last_value` now holds.
    pub fn read_sensors(&mut self, update_history: bool, average_out: bool) -> Reading {
        let cal = self.options.calibration;
        let tank = self.board.read_raw(AnalogChannel::Tank);
        let plant = self.board.read_raw(AnalogChannel::Plant);
        let digital = self.options.digital_enabled && self.board.read_digital();

        let raw = Reading {
            tank_level: cal.normalize(tank),
            plant_level: cal.normalize(plant),
            digital,
        };
        self.recent.push(raw);

        let mut value = raw;
        if update_history {
            if average_out {
                if let Some(avg) = Reading::mean(self.recent.iter()) {
                    value = avg;
                }
                self.recent.clear();
            }
            self.history.push(value);
        }

        self.last_value = value;
        value
    }

    /// Forward the settling delay to the board.
    pub fn settle(&mut self, delay: std::time::Duration) {
        self.board.settle(delay);
    }

    pub fn last_value(&self) -> Reading {
        self.last_value
    }

    /// History entries, oldest first.
    pub fn history(&self) -> Vec<Reading> {
        self.history.snapshot()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
