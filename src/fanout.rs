/*!
 * Snapshot Fan-Out Writer
 *
 * Write adapter that broadcasts one snapshot stream to every connected
 * replica socket. A failing sink is marked broken with the OS error code
 * and dropped from further writes instead of aborting the whole transfer;
 * the adapter itself only errors once every sink is broken. Per-sink
 * status codes feed the replica report, and the live count decides
 * whether the transfer had any beneficiary at all.
 */

use rand::Rng;
use std::io::{self, Write};

/// Status code recorded when the OS gives us no errno
const GENERIC_IO_STATUS: u64 = 5; // EIO

/// Length of the end-of-stream mark in bytes
pub const EOF_MARK_LEN: usize = 40;

struct Target {
    sink: Box<dyn Write + Send>,
    /// 0 while healthy, transport error code after the first failure
    status: u64,
}

/// Broadcast writer over a set of replica sinks
pub struct FanoutWriter {
    targets: Vec<Target>,
}

impl FanoutWriter {
    pub fn new(sinks: Vec<Box<dyn Write + Send>>) -> Self {
        Self {
            targets: sinks
                .into_iter()
                .map(|sink| Target { sink, status: 0 })
                .collect(),
        }
    }

    /// Total number of sinks, broken ones included
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Sinks that have not failed so far
    pub fn live(&self) -> usize {
        self.targets.iter().filter(|t| t.status == 0).count()
    }

    /// Per-sink status codes, in the order sinks were provided
    pub fn status_codes(&self) -> Vec<u64> {
        self.targets.iter().map(|t| t.status).collect()
    }

    fn broadcast(&mut self, op: impl Fn(&mut dyn Write) -> io::Result<()>) -> io::Result<()> {
        for t in self.targets.iter_mut().filter(|t| t.status == 0) {
            if let Err(e) = op(t.sink.as_mut()) {
                t.status = e.raw_os_error().map(|c| c as u64).unwrap_or(GENERIC_IO_STATUS);
                log::warn!("replica sink dropped from transfer: {e}");
            }
        }
        if self.live() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "all replica sinks are broken",
            ));
        }
        Ok(())
    }
}

impl Write for FanoutWriter {
    /// Deliver the whole buffer to every live sink
    ///
    /// Short writes never escape: each sink gets `write_all`, so a
    /// partial acceptance turns into that sink's failure, not a torn
    /// stream shared by all of them.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.broadcast(|w| w.write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.broadcast(|w| w.flush())
    }
}

/// Generate a random end-of-stream mark
///
/// Hex characters so the mark can never collide with the framing bytes
/// of the preamble, and long enough that a payload collision is not a
/// practical concern.
pub fn random_eof_mark() -> [u8; EOF_MARK_LEN] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut mark = [0u8; EOF_MARK_LEN];
    for b in mark.iter_mut() {
        *b = HEX[rng.gen_range(0..16)];
    }
    mark
}
