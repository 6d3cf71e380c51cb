use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use super::measurement::Measurement;

pub const MIN_FRAME_CHARS: usize = 10;
pub const MAX_FRAME_CHARS: usize = 40;
pub const FRAME_PREFIX: char = 'S';

// Letter followed by an optionally signed decimal integer, e.g. `V4106` or `r-58`.
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z])(-?[0-9]+)").expect("Invalid token regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    BatteryVoltage,
    SolarVoltage,
    SensorId,
    MsgCount,
    UltrasonicRange,
    Rssi,
    SignalToNoiseRatio,
}

impl Field {
    /// Maps a token letter to its field. Letters outside the protocol are
    /// ignored by the scan rather than treated as errors.
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'V' => Some(Field::BatteryVoltage),
            's' => Some(Field::SolarVoltage),
            'S' => Some(Field::SensorId),
            'C' => Some(Field::MsgCount),
            'U' => Some(Field::UltrasonicRange),
            'r' => Some(Field::Rssi),
            'n' => Some(Field::SignalToNoiseRatio),
            _ => None,
        }
    }
}

/// Values extracted from one frame. Every field is optional until
/// [`Fields::into_measurement`] checks the required ones.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fields {
    pub battery_voltage: Option<f64>,
    pub solar_voltage: Option<f64>,
    pub sensor_id: Option<i64>,
    pub msg_count: Option<i64>,
    pub ultrasonic_range: Option<i64>,
    pub rssi: Option<i64>,
    pub signal_to_noise_ratio: Option<i64>,
}

impl Fields {
    fn set(&mut self, field: Field, raw: i64) {
        match field {
            Field::BatteryVoltage => self.battery_voltage = Some(millivolts_to_volts(raw)),
            Field::SolarVoltage => self.solar_voltage = Some(millivolts_to_volts(raw)),
            Field::SensorId => self.sensor_id = Some(raw),
            Field::MsgCount => self.msg_count = Some(raw),
            Field::UltrasonicRange => self.ultrasonic_range = Some(raw),
            Field::Rssi => self.rssi = Some(raw),
            Field::SignalToNoiseRatio => self.signal_to_noise_ratio = Some(raw),
        }
    }

    pub fn into_measurement(self, timestamp: NaiveDateTime) -> Result<Measurement, Rejection> {
        Ok(Measurement {
            timestamp,
            battery_voltage: self
                .battery_voltage
                .ok_or(Rejection::MissingField(Field::BatteryVoltage))?,
            solar_voltage: self
                .solar_voltage
                .ok_or(Rejection::MissingField(Field::SolarVoltage))?,
            ultrasonic_range: self
                .ultrasonic_range
                .ok_or(Rejection::MissingField(Field::UltrasonicRange))?,
            rssi: self.rssi.ok_or(Rejection::MissingField(Field::Rssi))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("frame too short ({0} chars)")]
    TooShort(usize),
    #[error("frame too long ({0} chars)")]
    TooLong(usize),
    #[error("frame does not start with 'S'")]
    MissingPrefix,
    #[error("missing field {0}")]
    MissingField(Field),
}

/// Cheap check run before the token scan; drops truncated and foreign lines.
pub fn prefilter(text: &str) -> Result<(), Rejection> {
    let len = text.chars().count();
    if len < MIN_FRAME_CHARS {
        return Err(Rejection::TooShort(len));
    }
    if len > MAX_FRAME_CHARS {
        return Err(Rejection::TooLong(len));
    }
    if !text.starts_with(FRAME_PREFIX) {
        return Err(Rejection::MissingPrefix);
    }
    Ok(())
}

/// Scans every `<letter><integer>` token left to right. A later token for the
/// same letter overwrites an earlier one.
pub fn scan_fields(text: &str) -> Fields {
    let mut fields = Fields::default();
    for caps in TOKEN.captures_iter(text) {
        let Some(field) = caps[1].chars().next().and_then(Field::from_key) else {
            continue;
        };
        // Digit runs too wide for i64 are dropped like unknown letters.
        if let Ok(raw) = caps[2].parse::<i64>() {
            fields.set(field, raw);
        }
    }
    fields
}

pub fn parse_frame(text: &str) -> Result<Fields, Rejection> {
    prefilter(text)?;
    Ok(scan_fields(text))
}

/// Full acceptance path for one decoded frame.
pub fn parse_measurement(text: &str, timestamp: NaiveDateTime) -> Result<Measurement, Rejection> {
    parse_frame(text)?.into_measurement(timestamp)
}

fn millivolts_to_volts(mv: i64) -> f64 {
    mv as f64 / 1000.0
}
