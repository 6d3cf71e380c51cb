mod error;
mod storage;

pub use error::StoreError;
pub use storage::{TelemetryStore, HEADER};
