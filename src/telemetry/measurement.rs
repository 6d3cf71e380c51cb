use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Format of the timestamp column in the telemetry log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One accepted telemetry record.
///
/// Field names double as the CSV header of the telemetry log, so renaming them
/// changes the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "Timestamp", with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "Battery Voltage (V)")]
    pub battery_voltage: f64,
    #[serde(rename = "Solar Voltage (V)")]
    pub solar_voltage: f64,
    #[serde(rename = "Ultrasonic Range")]
    pub ultrasonic_range: i64,
    #[serde(rename = "RSSI")]
    pub rssi: i64,
}

/// A decoded line as it came off the link, accepted or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFrame {
    pub received_at: NaiveDateTime,
    pub text: String,
}

impl RawFrame {
    pub fn new(text: String) -> Self {
        Self {
            received_at: capture_time(),
            text,
        }
    }
}

impl std::fmt::Display for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} :: {}",
            self.received_at.format(TIMESTAMP_FORMAT),
            self.text
        )
    }
}

/// Local wall-clock time truncated to whole seconds, the resolution the log keeps.
pub fn capture_time() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
