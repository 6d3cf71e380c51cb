mod frame_reader;
mod measurement;
pub mod parser;

pub use frame_reader::{decode_lossy, FrameReader};
pub use measurement::{capture_time, Measurement, RawFrame, TIMESTAMP_FORMAT};
pub use parser::{parse_measurement, Fields, Rejection};
