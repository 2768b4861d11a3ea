//! Pump relay on a single GPIO output. The `gpio` feature gates the real
//! rppal driver; without it, a mock keeps the state in memory and logs edges.

use anyhow::Result;
use tracing::{debug, info};

use crate::hardware::Pump;

// ---------------------------------------------------------------------------
// Real relay (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayPump {
    pin: rppal::gpio::OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl RelayPump {
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let pin = gpio.get(gpio_pin)?.into_output();
        let mut pump = Self {
            pin,
            active_low,
            on: true,
        };
        // Fail-safe: OFF at startup.
        pump.set(false);
        info!(gpio_pin, active_low, "pump relay initialised");
        Ok(pump)
    }
}

#[cfg(feature = "gpio")]
impl Pump for RelayPump {
    fn set(&mut self, on: bool) {
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if on != self.on {
            debug!(on, "pump relay written");
        }
        self.on = on;
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayPump {
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayPump {
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        info!(gpio_pin, active_low, "[mock-gpio] pump relay (not wired)");
        Ok(Self { on: false })
    }
}

#[cfg(not(feature = "gpio"))]
impl Pump for RelayPump {
    fn set(&mut self, on: bool) {
        if on != self.on {
            debug!(on, "[mock-gpio] pump relay");
        }
        self.on = on;
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================
