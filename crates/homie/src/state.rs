use serde::Serialize;
use std::sync::Arc;

use crate::controller::{Controller, SharedController};
use crate::settings::SettingsStore;
use crate::web::LocalNetwork;

// ---------------------------------------------------------------------------
// Application state handed to every HTTP handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub controller: SharedController,
    pub settings: Arc<SettingsStore>,
    pub network: LocalNetwork,
}

impl AppState {
    pub fn new(controller: Controller, settings: Arc<SettingsStore>, network: LocalNetwork) -> Self {
        Self {
            controller: Arc::new(tokio::sync::Mutex::new(controller)),
            settings,
            network,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON responses (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub current_plant_level: u16,
    pub current_water_level: u16,
    pub is_watering: bool,
    /// Unix seconds of the last watering start; 0 before the first tick.
    pub last_watering_time: i64,
}

/// One history entry as `[plant, tank]`.
pub type HistoryPoint = [u16; 2];

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
}

impl Controller {
    pub fn to_status(&self) -> StatusResponse {
        let last = self.sensor_manager().last_value();
        StatusResponse {
            current_plant_level: last.plant_level,
            current_water_level: last.tank_level,
            is_watering: self.is_watering_active(),
            last_watering_time: self
                .last_watering_start_time()
                .map(|t| t.unix_timestamp())
                .unwrap_or(0),
        }
    }

    /// History oldest-first, as `[plant, tank]` pairs.
    pub fn to_history(&self) -> Vec<HistoryPoint> {
        self.sensor_manager()
            .history()
            .iter()
            .map(|r| [r.plant_level, r.tank_level])
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::controller::ControllerOptions;
    use crate::hardware::{FakeBoard, FakePump};
    use crate::sampler::{Calibration, SamplerOptions, SensorSampler};
    use crate::settings::Settings;
    use std::time::Duration;

    fn controller(board: &FakeBoard, clock: Arc<ManualClock>) -> Controller {
        let sampler = SensorSampler::new(
            Box::new(board.clone()),
            SamplerOptions {
                calibration: Calibration {
                    raw_min: 0,
                    raw_max: 1000,
                },
                ..SamplerOptions::default()
            },
        );
        Controller::new(
            sampler,
            Box::new(FakePump::default()),
            clock,
            Arc::new(SettingsStore::in_memory(Settings::default())),
            ControllerOptions {
                history_interval: Duration::from_secs(1),
                poll_interval: Duration::from_secs(1),
                ..ControllerOptions::default()
            },
        )
    }

    #[test]
    fn status_before_first_tick_is_zeroed() {
        let board = FakeBoard::default();
        let c = controller(&board, Arc::new(ManualClock::new()));
        let status = c.to_status();
        assert_eq!(status.last_watering_time, 0);
        assert!(!status.is_watering);
        assert_eq!(status.current_plant_level, 0);
    }

    #[test]
    fn status_reports_last_reading_and_start_time() {
        let board = FakeBoard::default();
        let clock = Arc::new(ManualClock::new());
        let mut c = controller(&board, clock.clone());
        board.set_raw(200, 700);
        c.handle();

        let status = c.to_status();
        assert_eq!(status.current_water_level, 800);
        assert_eq!(status.current_plant_level, 300);
        assert_eq!(status.last_watering_time, clock.base().unix_timestamp());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["current_water_level"], 800);
        assert_eq!(json["is_watering"], false);
    }

    #[test]
    fn history_is_plant_then_tank() {
        let board = FakeBoard::default();
        let clock = Arc::new(ManualClock::new());
        let mut c = controller(&board, clock.clone());
        board.set_raw(100, 600);
        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            c.handle();
        }
        let history = c.to_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|p| *p == [400, 900]));
        assert_eq!(serde_json::to_string(&history[..1]).unwrap(), "[[400,900]]");
    }
}
