//! Rows the dashboard keeps in the hosted tables (`devices`, `sensor_data`,
//! `led_configs`) and the rules it applies to them.

use std::{ops::RangeInclusive, time::Duration};

use chrono::{DateTime, NaiveTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{req::WifiCredentials, topic};

/// GPIO pins the dashboard lets a switch be wired to.
pub const GPIO_PINS: RangeInclusive<u8> = 3..=35;

/// A device counts as online on the device list when it reported within this window.
pub const DEVICE_LIST_ONLINE_WINDOW: Duration = Duration::from_secs(10);
/// The settings page is more lenient.
pub const SETTINGS_ONLINE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("switch name must not be empty")]
    EmptyName,
    #[error("GPIO pin {0} is outside 3..=35")]
    PinOutOfRange(u8),
    #[error("GPIO pin {0} is already used on this device")]
    DuplicatePin(u8),
    #[error("a switch named {0:?} already exists on this device")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub mac_address: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn new(user_id: Uuid, name: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            mac_address: mac_address.into(),
            last_seen: None,
            wifi_ssid: None,
            wifi_password: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_seen {
            Some(seen) => (now - seen).num_milliseconds() < window.as_millis() as i64,
            None => false,
        }
    }

    /// Heartbeats and readings both count as contact; keeps whichever is newer.
    pub fn observe_reading(&mut self, reading: &SensorReading) {
        if reading.device_id != self.id {
            return;
        }
        if self.last_seen.map_or(true, |seen| reading.created_at > seen) {
            self.last_seen = Some(reading.created_at);
        }
    }

    pub fn set_credentials(&mut self, creds: &WifiCredentials) {
        self.wifi_ssid = Some(creds.ssid.clone());
        self.wifi_password = Some(creds.password.clone());
    }

    pub fn credentials(&self) -> Option<WifiCredentials> {
        let ssid = self.wifi_ssid.as_ref().filter(|s| !s.is_empty())?;
        Some(WifiCredentials::new(
            ssid.clone(),
            self.wifi_password.clone().unwrap_or_default(),
        ))
    }

    pub fn config_topic(&self) -> String {
        topic::config_topic(&self.mac_address)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SensorReading {
    pub id: Uuid,
    pub device_id: Uuid,
    pub temperature: Option<f32>,   // °C
    pub soil_humidity: Option<f32>, // percent
    pub air_humidity: Option<f32>,  // percent
    pub tds: Option<f32>,           // ppm
    pub created_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn latest_for(readings: &[SensorReading], device_id: Uuid) -> Option<&SensorReading> {
        readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .max_by_key(|r| r.created_at)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    #[default]
    Manual,
    Auto,
}

/// Only shown on the dashboard, the firmware runs every schedule daily.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SwitchConfig {
    pub id: Uuid,
    pub device_id: Uuid,
    pub name: String,
    pub pin: u8,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub mode: SwitchMode,
    #[serde(default)]
    pub schedule: ScheduleKind,
    #[serde(with = "hhmm", default = "default_active_time")]
    pub active_time: NaiveTime,
    #[serde(with = "hhmm", default = "default_inactive_time")]
    pub inactive_time: NaiveTime,
}

fn default_active_time() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default()
}

fn default_inactive_time() -> NaiveTime {
    NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default()
}

impl SwitchConfig {
    pub fn new(device_id: Uuid, name: impl Into<String>, pin: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            name: name.into(),
            pin,
            is_active: false,
            mode: SwitchMode::Manual,
            schedule: ScheduleKind::Daily,
            active_time: default_active_time(),
            inactive_time: default_inactive_time(),
        }
    }

    /// Checks this config against the switches already stored for any device.
    /// An entry with the same id is the config being edited and is skipped.
    pub fn validate(&self, existing: &[SwitchConfig]) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::EmptyName);
        }
        if !GPIO_PINS.contains(&self.pin) {
            return Err(ModelError::PinOutOfRange(self.pin));
        }

        let siblings = existing
            .iter()
            .filter(|other| other.device_id == self.device_id && other.id != self.id);
        for other in siblings {
            if other.pin == self.pin {
                return Err(ModelError::DuplicatePin(self.pin));
            }
            if other.name.trim().eq_ignore_ascii_case(self.name.trim()) {
                return Err(ModelError::DuplicateName(self.name.clone()));
            }
        }
        Ok(())
    }

    /// Whether the output should be on at `now` (local time of day).
    pub fn desired_state(&self, now: NaiveTime) -> bool {
        match self.mode {
            SwitchMode::Manual => self.is_active,
            SwitchMode::Auto => {
                let (on, off) = (self.active_time, self.inactive_time);
                if on <= off {
                    on <= now && now < off
                } else {
                    // window wraps past midnight
                    now >= on || now < off
                }
            }
        }
    }
}

/// `"HH:MM"` on the wire, seconds tolerated when reading.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
