use std::io::{self, Read};
use std::time::Duration;

use serialport::SerialPort;

pub type ByteStream = Box<dyn Read + Send>;

/// Opens the link a session reads from. The stream is closed when dropped.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> io::Result<ByteStream>;
}

/// Opens a real serial device.
///
/// Reads time out after `read_timeout` so the ingestion loop regularly gets a
/// chance to notice a stop request.
pub struct SerialPortOpener {
    read_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud: u32) -> io::Result<ByteStream> {
        let port = serialport::new(port, baud)
            .timeout(self.read_timeout)
            .open()?;
        Ok(Box::new(SerialStream { port }))
    }
}

struct SerialStream {
    port: Box<dyn SerialPort>,
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}
