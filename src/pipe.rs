/*!
 * In-Process Channel Endpoints
 *
 * Byte-stream pipe over a crossbeam channel, used by launchers that
 * emulate the fork boundary with threads: the worker gets the write end
 * as its result channel (or rewrite ack channel) and the parent reads
 * the other side. The reader blocks until data arrives and reports EOF
 * once the writer is dropped and the buffer is drained, matching the
 * semantics the parent expects from an OS pipe.
 */

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Create a connected (writer, reader) endpoint pair
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded::<Vec<u8>>();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: VecDeque::new(),
        },
    )
}

/// Write end of an in-process pipe
#[derive(Clone)]
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read end of an in-process pipe
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Block for the next chunk only when nothing is buffered;
        // a dropped writer with an empty buffer is EOF.
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        // Drain whatever else is already queued without blocking.
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend(chunk);
        }
        let n = buf.len().min(self.pending.len());
        for b in buf.iter_mut().take(n) {
            *b = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }
}
