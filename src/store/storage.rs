use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::error::StoreError;
use crate::telemetry::Measurement;

/// Schema row written once at the top of a fresh log.
pub const HEADER: [&str; 5] = [
    "Timestamp",
    "Battery Voltage (V)",
    "Solar Voltage (V)",
    "Ultrasonic Range",
    "RSSI",
];

/// Append-only CSV log of accepted measurements.
///
/// There is a single writer per file; edits made by other processes while a
/// session is appending are not detected.
pub struct TelemetryStore {
    path: PathBuf,
}

impl TelemetryStore {
    pub fn new(path: PathBuf) -> Self {
        TelemetryStore { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends rows and syncs them to disk before returning, so an abrupt exit
    /// loses at most the call in flight.
    pub fn append(&self, measurements: &[Measurement]) -> Result<(), StoreError> {
        if measurements.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let fresh = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            debug!("Writing header to new telemetry log {}", self.path.display());
            writer.write_record(HEADER)?;
        }
        for measurement in measurements {
            writer.serialize(measurement)?;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads the whole log in persisted order. A missing or empty file is an
    /// empty history; a row that does not decode fails the whole load.
    pub fn load_all(&self) -> Result<Vec<Measurement>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(file);

        let mut measurements = Vec::new();
        for (i, result) in reader.records().enumerate() {
            let record = result.map_err(|e| self.corrupt(e, i as u64 + 1))?;
            if i == 0 && record.get(0) == Some(HEADER[0]) {
                continue;
            }
            let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 1);
            let measurement = record
                .deserialize::<Measurement>(None)
                .map_err(|e| self.corrupt(e, line))?;
            measurements.push(measurement);
        }

        Ok(measurements)
    }

    /// Removes the log. Clearing a store that was never written is a no-op.
    pub fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted telemetry log {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn corrupt(&self, source: csv::Error, fallback_line: u64) -> StoreError {
        let line = source
            .position()
            .map(|p| p.line())
            .unwrap_or(fallback_line);
        StoreError::Corrupt {
            path: self.path.display().to_string(),
            line,
            source,
        }
    }
}
