//! Serial telemetry ingestion for a remote tide sensor node.
//!
//! Frames arrive as newline-terminated text such as
//! `S1,V4106,C55,U841,s6835,r-58,n12`. Accepted measurements are appended to a
//! CSV log and to a bounded live window that consumers receive as snapshots.

pub mod config;
pub mod ingest;
pub mod store;
pub mod telemetry;
pub mod window;

pub use config::Config;
pub use ingest::{IngestError, IngestionService, Outputs, SessionEvent};
pub use store::{StoreError, TelemetryStore};
pub use telemetry::{Measurement, RawFrame};
pub use window::LiveWindow;
