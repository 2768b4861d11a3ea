//! Runtime settings: the values the controller re-reads every tick and the
//! HTTP API reads and writes as JSON.
//!
//! Reads come from an in-memory cache. Writes persist the single key to the
//! database first and only then update the cache, so a failed write leaves
//! the cached value untouched.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tracing::{error, info};

use crate::db::Db;

const KEY_NAME: &str = "name";
const KEY_INTERVAL: &str = "watering_interval";
const KEY_DURATION: &str = "watering_duration";
const KEY_TANK_THRESHOLD: &str = "water_tank_threshold";
const KEY_FLOOD_BUFFER: &str = "plant_flood_buffer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub name: String,
    /// Seconds between the starts of two watering sessions.
    pub watering_interval: u32,
    /// Seconds a watering session lasts.
    pub watering_duration: u32,
    /// The pump only runs while the tank level is strictly above this.
    pub water_tank_threshold: i32,
    pub plant_flood_buffer: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: String::new(),
            watering_interval: 60 * 60,
            watering_duration: 10 * 60,
            water_tank_threshold: 100,
            plant_flood_buffer: 0,
        }
    }
}

/// Partial update accepted by `POST /config`. Absent fields stay unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub watering_interval: Option<u32>,
    pub watering_duration: Option<u32>,
    pub water_tank_threshold: Option<i32>,
    pub plant_flood_buffer: Option<i32>,
}

impl SettingsPatch {
    /// Parse a JSON object. Wrong field types fail here, before anything is
    /// applied.
    pub fn from_json(body: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(body).context("settings payload is not valid JSON")?;
        if !value.is_object() {
            bail!("settings payload must be a JSON object");
        }
        serde_json::from_value(value).context("settings payload has invalid fields")
    }
}

pub struct SettingsStore {
    cache: RwLock<Settings>,
    db: Option<Db>,
}

impl SettingsStore {
    /// Cache-only store; nothing survives a restart.
    #[cfg(test)]
    pub fn in_memory(initial: Settings) -> Self {
        Self {
            cache: RwLock::new(initial),
            db: None,
        }
    }

    /// Load persisted values over `defaults`. Keys that were never written
    /// keep their default.
    pub async fn open(db: Db, defaults: Settings) -> Result<Self> {
        let mut s = defaults;

        if let Some(v) = db.get_setting(KEY_NAME).await? {
            s.name = v;
        }
        if let Some(v) = db.get_setting(KEY_INTERVAL).await? {
            s.watering_interval = parse_stored(KEY_INTERVAL, &v)?;
        }
        if let Some(v) = db.get_setting(KEY_DURATION).await? {
            s.watering_duration = parse_stored(KEY_DURATION, &v)?;
        }
        if let Some(v) = db.get_setting(KEY_TANK_THRESHOLD).await? {
            s.water_tank_threshold = parse_stored(KEY_TANK_THRESHOLD, &v)?;
        }
        if let Some(v) = db.get_setting(KEY_FLOOD_BUFFER).await? {
            s.plant_flood_buffer = parse_stored(KEY_FLOOD_BUFFER, &v)?;
        }

        info!(
            name = %s.name,
            watering_interval = s.watering_interval,
            watering_duration = s.watering_duration,
            water_tank_threshold = s.water_tank_threshold,
            "settings loaded"
        );

        Ok(Self {
            cache: RwLock::new(s),
            db: Some(db),
        })
    }

    /// Snapshot of the cached settings.
    pub fn current(&self) -> Settings {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn name(&self) -> String {
        self.read(|s| s.name.clone())
    }

    pub fn watering_interval(&self) -> u32 {
        self.read(|s| s.watering_interval)
    }

    pub fn watering_duration(&self) -> u32 {
        self.read(|s| s.watering_duration)
    }

    pub fn water_tank_threshold(&self) -> i32 {
        self.read(|s| s.water_tank_threshold)
    }

    pub async fn set_name(&self, name: String) -> Result<()> {
        self.persist(KEY_NAME, &name).await?;
        self.write(|s| s.name = name);
        Ok(())
    }

    pub async fn set_watering_interval(&self, secs: u32) -> Result<()> {
        self.persist(KEY_INTERVAL, &secs.to_string()).await?;
        self.write(|s| s.watering_interval = secs);
        Ok(())
    }

    pub async fn set_watering_duration(&self, secs: u32) -> Result<()> {
        self.persist(KEY_DURATION, &secs.to_string()).await?;
        self.write(|s| s.watering_duration = secs);
        Ok(())
    }

    pub async fn set_water_tank_threshold(&self, threshold: i32) -> Result<()> {
        self.persist(KEY_TANK_THRESHOLD, &threshold.to_string()).await?;
        self.write(|s| s.water_tank_threshold = threshold);
        Ok(())
    }

    pub async fn set_plant_flood_buffer(&self, buffer: i32) -> Result<()> {
        self.persist(KEY_FLOOD_BUFFER, &buffer.to_string()).await?;
        self.write(|s| s.plant_flood_buffer = buffer);
        Ok(())
    }

    /// Apply a JSON settings object field by field and return the result.
    pub async fn apply_json(&self, body: &str) -> Result<Settings> {
        let patch = SettingsPatch::from_json(body)?;
        self.apply(patch).await?;
        let s = self.current();
        info!(
            name = %s.name,
            watering_interval = s.watering_interval,
            watering_duration = s.watering_duration,
            water_tank_threshold = s.water_tank_threshold,
            plant_flood_buffer = s.plant_flood_buffer,
            "settings updated"
        );
        Ok(s)
    }

    pub async fn apply(&self, patch: SettingsPatch) -> Result<()> {
        if let Some(v) = patch.name {
            self.set_name(v).await?;
        }
        if let Some(v) = patch.watering_interval {
            self.set_watering_interval(v).await?;
        }
        if let Some(v) = patch.watering_duration {
            self.set_watering_duration(v).await?;
        }
        if let Some(v) = patch.water_tank_threshold {
            self.set_water_tank_threshold(v).await?;
        }
        if let Some(v) = patch.plant_flood_buffer {
            self.set_plant_flood_buffer(v).await?;
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn read<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        f(&*guard)
    }

    fn write(&self, f: impl FnOnce(&mut Settings)) {
        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        if let Some(db) = &self.db {
            if let Err(e) = db.put_setting(key, value).await {
                error!(key, "settings: persist failed: {e:#}");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn parse_stored<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("stored setting '{key}' is not a number: {value:?}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sample() -> Settings {
        Settings {
            name: "basil".into(),
            watering_interval: 7200,
            watering_duration: 30,
            water_tank_threshold: 150,
            plant_flood_buffer: 25,
        }
    }

    // -- JSON ---------------------------------------------------------------

    #[tokio::test]
    async fn json_round_trip_reproduces_fields() {
        let store = SettingsStore::in_memory(Settings::default());
        let body = serde_json::to_string(&sample()).unwrap();
        store.apply_json(&body).await.unwrap();

        let json = serde_json::to_value(store.current()).unwrap();
        assert_eq!(json["name"], "basil");
        assert_eq!(json["watering_interval"], 7200);
        assert_eq!(json["watering_duration"], 30);
        assert_eq!(json["water_tank_threshold"], 150);
        assert_eq!(json["plant_flood_buffer"], 25);
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn partial_patch_leaves_other_fields() {
        let store = SettingsStore::in_memory(sample());
        store
            .apply_json(r#"{"watering_duration": 45}"#)
            .await
            .unwrap();
        let s = store.current();
        assert_eq!(s.watering_duration, 45);
        assert_eq!(s.name, "basil");
        assert_eq!(s.watering_interval, 7200);
    }

    #[tokio::test]
    async fn malformed_json_leaves_cache_untouched() {
        let store = SettingsStore::in_memory(sample());
        assert!(store.apply_json("{not json").await.is_err());
        assert_eq!(store.current(), sample());
    }

    #[tokio::test]
    async fn wrong_field_type_rejects_whole_patch() {
        let store = SettingsStore::in_memory(sample());
        let err = store
            .apply_json(r#"{"name": "mint", "watering_interval": "soon"}"#)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid fields"), "{err:#}");
        assert_eq!(store.current().name, "basil");
    }

    #[tokio::test]
    async fn negative_interval_rejected() {
        let store = SettingsStore::in_memory(sample());
        assert!(store
            .apply_json(r#"{"watering_interval": -5}"#)
            .await
            .is_err());
        assert_eq!(store.watering_interval(), 7200);
    }

    #[tokio::test]
    async fn non_object_payload_rejected() {
        let store = SettingsStore::in_memory(sample());
        let err = store.apply_json("[1, 2]").await.unwrap_err();
        assert!(format!("{err:#}").contains("JSON object"), "{err:#}");
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let store = SettingsStore::in_memory(sample());
        store
            .apply_json(r#"{"colour": "green", "name": "sage"}"#)
            .await
            .unwrap();
        assert_eq!(store.name(), "sage");
    }

    // -- Getters / setters --------------------------------------------------

    #[tokio::test]
    async fn setters_update_getters() {
        let store = SettingsStore::in_memory(Settings::default());
        store.set_name("thyme".into()).await.unwrap();
        store.set_watering_interval(10).await.unwrap();
        store.set_watering_duration(5).await.unwrap();
        store.set_water_tank_threshold(-1).await.unwrap();
        store.set_plant_flood_buffer(3).await.unwrap();
        assert_eq!(store.name(), "thyme");
        assert_eq!(store.watering_interval(), 10);
        assert_eq!(store.watering_duration(), 5);
        assert_eq!(store.water_tank_threshold(), -1);
        assert_eq!(store.current().plant_flood_buffer, 3);
    }

    // -- Persistence --------------------------------------------------------

    #[tokio::test]
    async fn open_without_rows_uses_defaults() {
        let store = SettingsStore::open(memory_db().await, sample()).await.unwrap();
        assert_eq!(store.current(), sample());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let db = memory_db().await;
        let store = SettingsStore::open(db.clone(), Settings::default())
            .await
            .unwrap();
        store
            .apply_json(r#"{"name": "fern", "water_tank_threshold": 300}"#)
            .await
            .unwrap();

        let reopened = SettingsStore::open(db, Settings::default()).await.unwrap();
        assert_eq!(reopened.name(), "fern");
        assert_eq!(reopened.water_tank_threshold(), 300);
        assert_eq!(
            reopened.watering_interval(),
            Settings::default().watering_interval
        );
    }

    #[tokio::test]
    async fn corrupt_stored_value_fails_open() {
        let db = memory_db().await;
        db.put_setting(KEY_DURATION, "ten minutes").await.unwrap();
        let err = SettingsStore::open(db, Settings::default())
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("watering_duration"), "{err:#}");
    }
}
