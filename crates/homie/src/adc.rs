//! Physical sensor board: ADS1115 16-bit ADC over I2C for the tank and plant
//! probes, GPIO outputs for the probe power rails, and an optional GPIO input
//! for the digital "pot full" sensor.
//!
//! Reads single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode,
//! and reports them on a 12-bit scale over 0..3.3 V so calibration values
//! carry over from 12-bit microcontroller ADCs.

use anyhow::{ensure, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use rppal::i2c::I2c;
use std::{thread, time::Duration};
use tracing::{error, info};

use crate::hardware::{AnalogChannel, SensorBoard};
use crate::sampler::Calibration;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       write 1 to start single-shot conversion
//   [14:12] MUX      input multiplexer (channel selection)
//   [11:9]  PGA      programmable gain amplifier
//   [8]     MODE     0 = continuous, 1 = single-shot
//   [7:5]   DR       data rate
//   [4:2]   comparator mode/polarity/latch
//   [1:0]   COMP_QUE 11 = comparator off

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// Single-ended MUX values, AIN0..AIN3 vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: u8 = 3;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

/// ADS1115 counts per millivolt at ±4.096 V (0.125 mV/LSB).
const COUNTS_PER_MV: i32 = 8;
/// Reported scale: 0..=4095 over 0..3300 mV.
const SCALE_MAX: i32 = 4095;
const SCALE_FULL_MV: i32 = 3300;

/// Convert a single-ended conversion result to the 12-bit reporting scale.
fn to_twelve_bit(counts: i16) -> i32 {
    // bus corruption can yield negative single-ended values
    let counts = i32::from(counts).max(0);
    (counts * SCALE_MAX / (COUNTS_PER_MV * SCALE_FULL_MV)).min(SCALE_MAX)
}

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel)] << MUX_SHIFT)
}

/// Raw value reported when a conversion fails: beyond the dry end of the
/// calibration, so it normalizes to 0.
fn dry_sentinel(calibration: Calibration) -> i32 {
    if calibration.raw_max >= calibration.raw_min {
        i32::MAX
    } else {
        i32::MIN
    }
}

// ── Wiring ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdcWiring {
    pub i2c_address: u16,
    pub tank_channel: u8,
    pub plant_channel: u8,
    pub power_gpio_pins: Vec<u8>,
    /// `None` when no digital sensor is fitted.
    pub digital_gpio_pin: Option<u8>,
    pub calibration: Calibration,
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct AdcBoard {
    i2c: I2c,
    tank_channel: u8,
    plant_channel: u8,
    power: Vec<OutputPin>,
    digital: Option<InputPin>,
    dry: i32,
}

impl AdcBoard {
    /// Open I2C bus 1 and claim the GPIO pins. Power rails start OFF.
    pub fn new(wiring: &AdcWiring) -> Result<Self> {
        for ch in [wiring.tank_channel, wiring.plant_channel] {
            ensure!(
                ch <= MAX_CHANNEL,
                "ADS1115 channel {ch} out of range (0-{MAX_CHANNEL})"
            );
        }

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(wiring.i2c_address)?;

        let gpio = Gpio::new()?;
        let mut power = Vec::with_capacity(wiring.power_gpio_pins.len());
        for pin in &wiring.power_gpio_pins {
            let mut out = gpio.get(*pin)?.into_output();
            out.set_low();
            power.push(out);
        }
        let digital = match wiring.digital_gpio_pin {
            Some(pin) => Some(gpio.get(pin)?.into_input()),
            None => None,
        };

        info!(
            addr = format_args!("0x{:02x}", wiring.i2c_address),
            tank_channel = wiring.tank_channel,
            plant_channel = wiring.plant_channel,
            power_pins = ?wiring.power_gpio_pins,
            digital_pin = ?wiring.digital_gpio_pin,
            "ads1115 sensor board initialised"
        );

        Ok(Self {
            i2c,
            tank_channel: wiring.tank_channel,
            plant_channel: wiring.plant_channel,
            power,
            digital,
            dry: dry_sentinel(wiring.calibration),
        })
    }

    /// Single-shot read on `channel`, returning the raw signed value
    /// (0..=32767 for single-ended).
    fn read_channel(&mut self, channel: u8) -> Result<i16> {
        let config = config_for_channel(channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl SensorBoard for AdcBoard {
    fn set_power(&mut self, on: bool) {
        for pin in &mut self.power {
            if on {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }

    fn read_raw(&mut self, channel: AnalogChannel) -> i32 {
        let ch = match channel {
            AnalogChannel::Tank => self.tank_channel,
            AnalogChannel::Plant => self.plant_channel,
        };
        match self.read_channel(ch) {
            Ok(counts) => to_twelve_bit(counts),
            Err(e) => {
                error!(channel = ch, "adc read failed: {e}");
                self.dry
            }
        }
    }

    fn read_digital(&mut self) -> bool {
        self.digital.as_ref().is_some_and(|pin| pin.is_high())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
