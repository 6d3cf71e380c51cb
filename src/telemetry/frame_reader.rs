use std::io::{self, BufRead, BufReader, Read};

const FRAME_DELIMITER: u8 = b'\n';

/// Splits a byte stream into newline-terminated text frames.
///
/// A partial line survives read timeouts: bytes already pulled off the stream
/// stay in `pending` until the delimiter arrives.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            inner: BufReader::new(source),
            pending: Vec::with_capacity(128),
        }
    }

    /// Returns the next complete frame, or `Ok(None)` when the source timed out
    /// before one was available.
    ///
    /// End of stream is reported as `UnexpectedEof`: a serial device does not
    /// close its side of the link on purpose.
    pub fn next_frame(&mut self) -> io::Result<Option<String>> {
        match self.inner.read_until(FRAME_DELIMITER, &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "byte stream closed",
            )),
            Ok(_) => {
                // Without a trailing delimiter this is the tail before EOF,
                // possibly carried over from reads that timed out. Hand it
                // out and let the next call report the close.
                let frame = decode_lossy(&self.pending);
                self.pending.clear();
                Ok(Some(frame.trim().to_string()))
            }
            Err(e) if is_retryable(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Decodes UTF-8, dropping invalid byte sequences instead of substituting them.
pub fn decode_lossy(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}
