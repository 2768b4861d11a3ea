//! Hardware seams between the control core and the physical board.
//!
//! The sampler only talks to a [`SensorBoard`] and the controller only talks
//! to a [`Pump`]. Real drivers live in `adc` / `pump` (behind the `adc` and
//! `gpio` features); `sim` provides a development board.

use std::time::Duration;

/// The two analog inputs the sampler normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogChannel {
    /// Water reservoir level.
    Tank,
    /// Soil moisture in the pot.
    Plant,
}

pub trait SensorBoard: Send {
    /// Energize or de-energize the sensor power rails.
    fn set_power(&mut self, on: bool);

    /// One raw conversion from `channel`, in board-native units.
    fn read_raw(&mut self, channel: AnalogChannel) -> i32;

    /// Raw level of the digital "pot full" input (`true` = HIGH).
    fn read_digital(&mut self) -> bool;

    /// Block for the sensor settling time between consecutive reads.
    fn settle(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

pub trait Pump: Send {
    fn set(&mut self, on: bool);
    fn is_on(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory board for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use fake::{FakeBoard, FakePump};
