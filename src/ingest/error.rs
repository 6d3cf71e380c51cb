use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion already running")]
    AlreadyRunning,
    #[error("cannot delete history while ingestion is running")]
    Busy,
    #[error("session events from an earlier run have not been read")]
    EventBacklog,
    #[error("failed to open {port} at {baud} baud: {source}")]
    Open {
        port: String,
        baud: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
