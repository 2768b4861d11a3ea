//! Watering controller: polls the sampler on its own cadence, runs the
//! idle/watering state machine, and drives the pump every tick.
//!
//! ```text
//! Idle ──[interval elapsed since last start]──▶ Watering
//!  ▲                                               │
//!  └──────────[duration elapsed since start]───────┘
//! ```
//!
//! The pump output is level-driven: each tick recomputes it from the state
//! and the latest reading, so any failing condition turns the pump off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::hardware::Pump;
use crate::sampler::{Reading, SensorSampler};
use crate::settings::SettingsStore;

/// Controller shared between the control thread and the HTTP handlers.
pub type SharedController = Arc<tokio::sync::Mutex<Controller>>;

// ---------------------------------------------------------------------------
// Pump policy
// ---------------------------------------------------------------------------

/// Which level of the digital "pot full" input means triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalPolarity {
    TriggeredHigh,
    TriggeredLow,
}

impl DigitalPolarity {
    pub fn is_triggered(self, flag: bool) -> bool {
        match self {
            DigitalPolarity::TriggeredHigh => flag,
            DigitalPolarity::TriggeredLow => !flag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpPolicy {
    /// Plant level above which the pot counts as flooded.
    pub flood_ceiling: u16,
    /// `None` when the digital sensor is not fitted.
    pub digital: Option<DigitalPolarity>,
}

impl Default for PumpPolicy {
    fn default() -> Self {
        Self {
            flood_ceiling: 400,
            digital: None,
        }
    }
}

impl PumpPolicy {
    /// The pump runs only while watering, with water in the tank, the pot
    /// not reported full, and the soil not already flooded.
    pub fn should_pump(&self, watering: bool, reading: &Reading, tank_threshold: i32) -> bool {
        if !watering {
            return false;
        }
        let tank_ok = i32::from(reading.tank_level) > tank_threshold;
        let pot_ok = match self.digital {
            Some(polarity) => !polarity.is_triggered(reading.digital),
            None => true,
        };
        let not_flooded = reading.plant_level <= self.flood_ceiling;
        tank_ok && pot_ok && not_flooded
    }
}

// ---------------------------------------------------------------------------
// Options and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Poll cadence while idle.
    pub poll_interval: Duration,
    /// Poll cadence while watering.
    pub watering_poll_interval: Duration,
    /// Minimum spacing between two history entries.
    pub history_interval: Duration,
    pub reads_per_poll: u32,
    /// Delay between consecutive reads of one poll.
    pub settle: Duration,
    pub policy: PumpPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            watering_poll_interval: Duration::from_millis(500),
            history_interval: Duration::from_secs(60),
            reads_per_poll: 5,
            settle: Duration::from_millis(5),
            policy: PumpPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WateringState {
    pub is_watering: bool,
    /// Monotonic time of the last (natural or forced) start.
    pub started: Duration,
    /// Wall-clock time of the last start; set on the first tick if unset.
    pub started_wall: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Interval,
    Duration,
    Forced,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    sampler: SensorSampler,
    pump: Box<dyn Pump>,
    clock: Arc<dyn Clock>,
    settings: Arc<SettingsStore>,
    options: ControllerOptions,
    state: WateringState,
    last_poll: Option<Duration>,
    last_history: Duration,
}

impl Controller {
    pub fn new(
        sampler: SensorSampler,
        mut pump: Box<dyn Pump>,
        clock: Arc<dyn Clock>,
        settings: Arc<SettingsStore>,
        options: ControllerOptions,
    ) -> Self {
        pump.set(false);
        let started = clock.monotonic();
        Self {
            sampler,
            pump,
            settings,
            options,
            state: WateringState {
                started,
                ..WateringState::default()
            },
            last_history: started,
            last_poll: None,
            clock,
        }
    }

    /// One control-loop iteration: poll if due, advance the state machine,
    /// then re-assert the pump output.
    pub fn handle(&mut self) {
        let now = self.clock.monotonic();

        if self.poll_due(now) {
            self.poll(now);
        }

        if self.state.started_wall.is_none() {
            self.state.started_wall = Some(self.clock.wall());
        }

        let elapsed = now.saturating_sub(self.state.started);
        let interval = Duration::from_secs(u64::from(self.settings.watering_interval()));
        let duration = Duration::from_secs(u64::from(self.settings.watering_duration()));

        if !self.state.is_watering && elapsed >= interval {
            self.start(now, Transition::Interval);
        } else if self.state.is_watering && elapsed >= duration {
            self.stop(Transition::Duration);
        }

        self.apply_pump();
    }

    /// Enter Watering now, whatever the current state, and restart both
    /// timers.
    pub fn force_start_watering(&mut self) {
        let now = self.clock.monotonic();
        self.start(now, Transition::Forced);
    }

    /// Return to Idle. The timers keep the last start so the interval
    /// countdown is unchanged.
    pub fn force_stop_watering(&mut self) {
        self.stop(Transition::Forced);
        self.apply_pump();
    }

    pub fn is_watering_active(&self) -> bool {
        self.state.is_watering
    }

    pub fn last_watering_start_time(&self) -> Option<OffsetDateTime> {
        self.state.started_wall
    }

    pub fn sensor_manager(&self) -> &SensorSampler {
        &self.sampler
    }

    /// Leave the hardware safe: pump off, sensor rails released.
    pub fn shutdown(&mut self) {
        self.state.is_watering = false;
        self.pump.set(false);
        self.sampler.deactivate();
        info!("controller shut down, pump off");
    }

    // -- internals --------------------------------------------------------

    fn poll_due(&self, now: Duration) -> bool {
        let cadence = if self.state.is_watering {
            self.options.watering_poll_interval
        } else {
            self.options.poll_interval
        };
        match self.last_poll {
            None => true,
            Some(last) => now.saturating_sub(last) >= cadence,
        }
    }

    /// One batch of reads. Only the final read may write history, and only
    /// once per history interval.
    fn poll(&mut self, now: Duration) {
        let update_history = now.saturating_sub(self.last_history) >= self.options.history_interval;
        let reads = self.options.reads_per_poll.max(1);

        self.sampler.activate();
        let mut reading = self.sampler.last_value();
        for i in 1..=reads {
            let last = i == reads;
            reading = self.sampler.read_sensors(last && update_history, last);
            if !last {
                self.sampler.settle(self.options.settle);
            }
        }
        self.sampler.deactivate();

        if update_history {
            self.last_history = now;
        }
        self.last_poll = Some(now);

        debug!(
            tank = reading.tank_level,
            plant = reading.plant_level,
            digital = reading.digital,
            history = update_history,
            history_len = self.sampler.history_len(),
            "poll"
        );
    }

    fn start(&mut self, now: Duration, why: Transition) {
        self.state.is_watering = true;
        self.state.started = now;
        self.state.started_wall = Some(self.clock.wall());
        info!(reason = ?why, "watering started");
    }

    fn stop(&mut self, why: Transition) {
        if self.state.is_watering {
            info!(reason = ?why, "watering stopped");
        }
        self.state.is_watering = false;
    }

    fn apply_pump(&mut self) {
        let reading = self.sampler.last_value();
        let on = self.options.policy.should_pump(
            self.state.is_watering,
            &reading,
            self.settings.water_tank_threshold(),
        );
        if on != self.pump.is_on() {
            info!(
                on,
                tank = reading.tank_level,
                plant = reading.plant_level,
                "pump switched"
            );
        }
        self.pump.set(on);
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

/// Drive `handle()` every `tick` until `stop` is set. Runs on a dedicated
/// OS thread; the settling delays inside a poll block it briefly.
pub fn run(shared: SharedController, tick: Duration, stop: Arc<AtomicBool>) {
    info!(tick_ms = tick.as_millis() as u64, "control loop started");
    while !stop.load(Ordering::Relaxed) {
        shared.blocking_lock().handle();
        std::thread::sleep(tick);
    }
    info!("control loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hardware::{FakeBoard, FakePump};
    use crate::sampler::{Calibration, SamplerOptions};
    use crate::settings::Settings;

    const THRESHOLD: i32 = 100;

    struct Rig {
        board: FakeBoard,
        pump: FakePump,
        clock: Arc<ManualClock>,
        settings: Arc<SettingsStore>,
        controller: Controller,
    }

    impl Rig {
        fn new(options: ControllerOptions, digital_enabled: bool) -> Self {
            let board = FakeBoard::default();
            let pump = FakePump::default();
            let clock = Arc::new(ManualClock::new());
            let settings = Arc::new(SettingsStore::in_memory(Settings {
                watering_interval: 3600,
                watering_duration: 600,
                water_tank_threshold: THRESHOLD,
                ..Settings::default()
            }));
            // 0..1000 calibration: level = 1000 - raw.
            let sampler = SensorSampler::new(
                Box::new(board.clone()),
                SamplerOptions {
                    calibration: Calibration {
                        raw_min: 0,
                        raw_max: 1000,
                    },
                    digital_enabled,
                    recent_window: 10,
                    history_window: 100,
                    ..SamplerOptions::default()
                },
            );
            let controller = Controller::new(
                sampler,
                Box::new(pump.clone()),
                clock.clone(),
                settings.clone(),
                options,
            );
            Self {
                board,
                pump,
                clock,
                settings,
                controller,
            }
        }

        fn basic() -> Self {
            Self::new(ControllerOptions::default(), false)
        }

        /// Set normalized levels on the fake board.
        fn levels(&self, tank: u16, plant: u16) {
            self.board
                .set_raw(1000 - i32::from(tank), 1000 - i32::from(plant));
        }

        fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }
    }

    fn reading(tank: u16, plant: u16, digital: bool) -> Reading {
        Reading {
            tank_level: tank,
            plant_level: plant,
            digital,
        }
    }

    // -- Pump policy ------------------------------------------------------

    #[test]
    fn idle_never_pumps() {
        let policy = PumpPolicy::default();
        for tank in [0, 101, 500, 1000] {
            for plant in [0, 400, 1000] {
                for digital in [false, true] {
                    assert!(!policy.should_pump(false, &reading(tank, plant, digital), THRESHOLD));
                }
            }
        }
    }

    #[test]
    fn watering_pumps_only_when_every_condition_holds() {
        let policy = PumpPolicy::default();
        assert!(policy.should_pump(true, &reading(101, 0, false), THRESHOLD));
        assert!(policy.should_pump(true, &reading(101, 400, false), THRESHOLD));
        // tank must be strictly above the threshold
        assert!(!policy.should_pump(true, &reading(100, 0, false), THRESHOLD));
        // flood ceiling
        assert!(!policy.should_pump(true, &reading(500, 401, false), THRESHOLD));
        // digital ignored when not fitted
        assert!(policy.should_pump(true, &reading(500, 0, true), THRESHOLD));
    }

    #[test]
    fn digital_polarity_is_configurable() {
        let high = PumpPolicy {
            digital: Some(DigitalPolarity::TriggeredHigh),
            ..PumpPolicy::default()
        };
        assert!(high.should_pump(true, &reading(500, 0, false), THRESHOLD));
        assert!(!high.should_pump(true, &reading(500, 0, true), THRESHOLD));

        let low = PumpPolicy {
            digital: Some(DigitalPolarity::TriggeredLow),
            ..PumpPolicy::default()
        };
        assert!(low.should_pump(true, &reading(500, 0, true), THRESHOLD));
        assert!(!low.should_pump(true, &reading(500, 0, false), THRESHOLD));
    }

    #[test]
    fn negative_threshold_accepts_empty_tank() {
        let policy = PumpPolicy::default();
        assert!(policy.should_pump(true, &reading(0, 0, false), -1));
    }

    // -- State machine ----------------------------------------------------

    #[test]
    fn starts_idle_with_pump_off() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.handle();
        assert!(!rig.controller.is_watering_active());
        assert!(!rig.pump.is_on());
    }

    #[test]
    fn first_tick_sets_wall_clock_baseline() {
        let mut rig = Rig::basic();
        assert_eq!(rig.controller.last_watering_start_time(), None);
        rig.controller.handle();
        assert_eq!(
            rig.controller.last_watering_start_time(),
            Some(rig.clock.base())
        );
        assert!(!rig.controller.is_watering_active());
    }

    #[test]
    fn force_start_then_tick_runs_pump() {
        let mut rig = Rig::basic();
        rig.levels(THRESHOLD as u16 + 1, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
        assert!(rig.pump.is_on());
    }

    #[test]
    fn interval_elapsed_starts_watering_and_resets_start() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.handle();

        rig.advance(Duration::from_secs(3599));
        rig.controller.handle();
        assert!(!rig.controller.is_watering_active());

        rig.advance(Duration::from_secs(1));
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
        assert_eq!(rig.controller.state.started, Duration::from_secs(3600));
        assert_eq!(
            rig.controller.last_watering_start_time(),
            Some(rig.clock.base() + Duration::from_secs(3600))
        );
        assert!(rig.pump.is_on());
    }

    #[test]
    fn duration_elapsed_stops_watering() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.pump.is_on());

        rig.advance(Duration::from_secs(599));
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());

        rig.advance(Duration::from_secs(1));
        rig.controller.handle();
        assert!(!rig.controller.is_watering_active());
        assert!(!rig.pump.is_on());
    }

    #[tokio::test]
    async fn duration_stop_does_not_restart_in_same_tick() {
        let mut rig = Rig::basic();
        rig.settings.set_watering_interval(60).await.unwrap();
        rig.settings.set_watering_duration(100).await.unwrap();
        rig.levels(900, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();

        // Both interval and duration have elapsed; only the stop fires.
        rig.advance(Duration::from_secs(100));
        rig.controller.handle();
        assert!(!rig.controller.is_watering_active());

        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
    }

    #[test]
    fn force_stop_keeps_timers() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.advance(Duration::from_secs(30));
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.pump.is_on());

        rig.advance(Duration::from_secs(10));
        rig.controller.force_stop_watering();
        assert!(!rig.controller.is_watering_active());
        assert!(!rig.pump.is_on());
        assert_eq!(rig.controller.state.started, Duration::from_secs(30));

        // Next natural start counts from the forced start.
        rig.advance(Duration::from_secs(3600 - 10 - 1));
        rig.controller.handle();
        assert!(!rig.controller.is_watering_active());
        rig.advance(Duration::from_secs(1));
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
    }

    #[test]
    fn force_start_while_watering_restarts_duration() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.force_start_watering();
        rig.advance(Duration::from_secs(500));
        rig.controller.force_start_watering();
        rig.advance(Duration::from_secs(500));
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
    }

    // -- Pump safety ------------------------------------------------------

    #[test]
    fn low_tank_keeps_pump_off_while_watering() {
        let mut rig = Rig::basic();
        rig.levels(THRESHOLD as u16, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
        assert!(!rig.pump.is_on());
    }

    #[test]
    fn flooded_plant_stops_pump_mid_session() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.pump.is_on());

        rig.levels(900, 401);
        rig.advance(Duration::from_millis(500));
        rig.controller.handle();
        assert!(rig.controller.is_watering_active());
        assert!(!rig.pump.is_on());
    }

    #[test]
    fn digital_sensor_cuts_pump() {
        let options = ControllerOptions {
            policy: PumpPolicy {
                digital: Some(DigitalPolarity::TriggeredLow),
                ..PumpPolicy::default()
            },
            ..ControllerOptions::default()
        };
        let mut rig = Rig::new(options, true);
        rig.levels(900, 0);
        rig.board.set_digital(true);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.pump.is_on());

        rig.board.set_digital(false);
        rig.advance(Duration::from_millis(500));
        rig.controller.handle();
        assert!(!rig.pump.is_on());
    }

    #[test]
    fn pump_is_reasserted_every_tick() {
        let mut rig = Rig::basic();
        let before = rig.pump.writes();
        rig.controller.handle();
        rig.controller.handle();
        rig.controller.handle();
        assert_eq!(rig.pump.writes(), before + 3);
    }

    #[test]
    fn shutdown_turns_pump_off() {
        let mut rig = Rig::basic();
        rig.levels(900, 0);
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert!(rig.pump.is_on());
        rig.controller.shutdown();
        assert!(!rig.pump.is_on());
        assert!(!rig.controller.is_watering_active());
    }

    // -- Polling cadence --------------------------------------------------

    #[test]
    fn idle_polls_on_base_interval() {
        let mut rig = Rig::basic();
        rig.controller.handle();
        assert_eq!(rig.board.reads(), 5);

        rig.advance(Duration::from_secs(9));
        rig.controller.handle();
        assert_eq!(rig.board.reads(), 5);

        rig.advance(Duration::from_secs(1));
        rig.controller.handle();
        assert_eq!(rig.board.reads(), 10);
    }

    #[test]
    fn watering_polls_fast() {
        let mut rig = Rig::basic();
        rig.controller.force_start_watering();
        rig.controller.handle();
        assert_eq!(rig.board.reads(), 5);

        rig.advance(Duration::from_millis(500));
        rig.controller.handle();
        assert_eq!(rig.board.reads(), 10);
    }

    #[test]
    fn keep_powered_false_releases_rails_after_poll() {
        let mut rig = Rig::basic();
        rig.controller.handle();
        assert!(!rig.board.powered());
    }

    #[test]
    fn history_is_rate_limited() {
        let mut rig = Rig::basic();
        rig.levels(900, 100);

        // Polls every 10 s for 59 s: no history yet.
        for _ in 0..6 {
            rig.controller.handle();
            rig.advance(Duration::from_secs(10));
        }
        assert_eq!(rig.controller.sensor_manager().history_len(), 0);

        // t = 60 s
        rig.controller.handle();
        assert_eq!(rig.controller.sensor_manager().history_len(), 1);

        rig.advance(Duration::from_secs(10));
        rig.controller.handle();
        assert_eq!(rig.controller.sensor_manager().history_len(), 1);

        rig.advance(Duration::from_secs(50));
        rig.controller.handle();
        assert_eq!(rig.controller.sensor_manager().history_len(), 2);

        let history = rig.controller.sensor_manager().history();
        assert_eq!(history[0], reading(900, 100, false));
    }

    // -- Control loop -----------------------------------------------------

    #[test]
    fn run_loop_ticks_until_stopped() {
        let rig = Rig::basic();
        let board = rig.board.clone();
        let shared: SharedController = Arc::new(tokio::sync::Mutex::new(rig.controller));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let shared = shared.clone();
            let stop = stop.clone();
            std::thread::spawn(move || run(shared, Duration::from_millis(1), stop))
        };
        std::thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        // The manual clock never moved, so only the first tick polled.
        assert_eq!(board.reads(), 5);
        assert!(!shared.blocking_lock().is_watering_active());
    }
}
