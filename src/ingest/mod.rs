mod error;
mod service;
mod source;
mod types;

pub use error::IngestError;
pub use service::IngestionService;
pub use source::{ByteStream, PortOpener, SerialPortOpener};
pub use types::{IngestMode, IngestStatus, Outputs, SessionEvent, Snapshot};
