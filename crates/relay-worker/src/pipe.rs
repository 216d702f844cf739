//! In-process session pipe.
//!
//! A channel-backed byte stream pairing a `Write` half with a blocking
//! `Read` half, so tests and the in-process transport can run a harness
//! session on a thread and stream its events live. Dropping the writer
//! closes the stream (EOF); dropping the reader makes writes fail with
//! `BrokenPipe`, which is exactly how a lost transport session presents.

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};

/// Create a connected pipe pair.
pub fn session_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buffer: Vec::new(),
            offset: 0,
        },
    )
}

/// Write half of an in-process session pipe.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking read half of an in-process session pipe.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.buffer.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buffer = chunk;
                    self.offset = 0;
                }
                // All writers gone: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let available = &self.buffer[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}
