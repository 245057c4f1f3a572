/*!
 * Replica Report Protocol
 *
 * After a replica transfer the worker tells the parent, replica by
 * replica, who actually received the snapshot. The message is the
 * parent's only source of truth for its replication bookkeeping, so it
 * is framed rigidly: a u64 entry count followed by (replica id, status)
 * u64 pairs, all little-endian, exactly `8 + 16 * n` bytes, sent in one
 * write. A status of 0 means that replica got a complete transfer; any
 * other value is the transport's error code for it.
 */

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{Read, Write};

use crate::error::ReportError;

/// Outcome for a single replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaOutcome {
    /// Client id of the replica, assigned by the parent
    pub replica_id: u64,
    /// 0 on success, transport error code otherwise
    pub status: u64,
}

impl ReplicaOutcome {
    /// True when this replica received a complete transfer
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Ordered per-replica outcomes of one transfer operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaReport {
    entries: Vec<ReplicaOutcome>,
}

impl ReplicaReport {
    /// Build a report by zipping replica ids with their status codes
    ///
    /// An empty report is never constructed: a transfer with nothing to
    /// report is a failed transfer, decided before this point.
    pub fn new(replica_ids: &[u64], statuses: &[u64]) -> Result<ReplicaReport, ReportError> {
        if replica_ids.len() != statuses.len() {
            return Err(ReportError::LengthMismatch {
                ids: replica_ids.len(),
                statuses: statuses.len(),
            });
        }
        if replica_ids.is_empty() {
            return Err(ReportError::Empty);
        }
        Ok(ReplicaReport {
            entries: replica_ids
                .iter()
                .zip(statuses)
                .map(|(&replica_id, &status)| ReplicaOutcome { replica_id, status })
                .collect(),
        })
    }

    /// Entries in original replica order
    pub fn entries(&self) -> &[ReplicaOutcome] {
        &self.entries
    }

    /// Number of replicas that received a complete transfer
    pub fn successes(&self) -> usize {
        self.entries.iter().filter(|e| e.succeeded()).count()
    }

    /// Exact wire length of this report
    pub fn wire_len(&self) -> usize {
        8 + 16 * self.entries.len()
    }

    /// Encode the report into its wire image
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u64_le(self.entries.len() as u64);
        for e in &self.entries {
            buf.put_u64_le(e.replica_id);
            buf.put_u64_le(e.status);
        }
        buf.freeze()
    }

    /// Decode a complete wire image
    ///
    /// The buffer must hold exactly one report: a count that disagrees
    /// with the byte length, or a zero count, is malformed.
    pub fn decode(buf: &[u8]) -> Result<ReplicaReport, ReportError> {
        if buf.len() < 8 {
            return Err(ReportError::Malformed("missing count field".into()));
        }
        let mut buf = buf;
        let n = buf.get_u64_le();
        if n == 0 {
            return Err(ReportError::Empty);
        }
        let expected = (n as usize).checked_mul(16);
        if expected != Some(buf.remaining()) {
            return Err(ReportError::Malformed(format!(
                "count {} does not match {} payload bytes",
                n,
                buf.remaining()
            )));
        }
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            entries.push(ReplicaOutcome {
                replica_id: buf.get_u64_le(),
                status: buf.get_u64_le(),
            });
        }
        Ok(ReplicaReport { entries })
    }

    /// Emit the report over the result channel in a single write
    ///
    /// No retry on a short write: the parent reads the message as one
    /// frame, and half a report is worse than none.
    pub fn write_to(&self, channel: &mut dyn Write) -> Result<(), ReportError> {
        let wire = self.encode();
        let written = channel.write(&wire)?;
        if written != wire.len() {
            return Err(ReportError::ShortWrite {
                written,
                expected: wire.len(),
            });
        }
        channel.flush()?;
        Ok(())
    }

    /// Parent side: read exactly one report off the result channel
    pub fn read_from(channel: &mut dyn Read) -> Result<ReplicaReport, ReportError> {
        let mut head = [0u8; 8];
        channel.read_exact(&mut head)?;
        let n = u64::from_le_bytes(head);
        if n == 0 {
            return Err(ReportError::Empty);
        }
        let body_len = (n as usize)
            .checked_mul(16)
            .ok_or_else(|| ReportError::Malformed("count overflows".into()))?;
        let mut body = vec![0u8; body_len];
        channel.read_exact(&mut body)?;
        let mut wire = Vec::with_capacity(8 + body_len);
        wire.extend_from_slice(&head);
        wire.extend_from_slice(&body);
        ReplicaReport::decode(&wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        for n in 1..8usize {
            let ids: Vec<u64> = (0..n as u64).map(|i| 100 + i).collect();
            let statuses: Vec<u64> = (0..n as u64).map(|i| i % 3).collect();
            let report = ReplicaReport::new(&ids, &statuses).unwrap();
            let wire = report.encode();
            assert_eq!(wire.len(), 8 + 16 * n);
            assert_eq!(ReplicaReport::decode(&wire).unwrap(), report);
        }
    }

    #[test]
    fn empty_report_is_never_constructed() {
        assert!(matches!(ReplicaReport::new(&[], &[]), Err(ReportError::Empty)));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(matches!(
            ReplicaReport::new(&[1, 2], &[0]),
            Err(ReportError::LengthMismatch { ids: 2, statuses: 1 })
        ));
    }

    #[test]
    fn zero_count_on_the_wire_is_malformed() {
        assert!(matches!(
            ReplicaReport::decode(&0u64.to_le_bytes()),
            Err(ReportError::Empty)
        ));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let report = ReplicaReport::new(&[1, 2], &[0, 0]).unwrap();
        let wire = report.encode();
        assert!(ReplicaReport::decode(&wire[..wire.len() - 4]).is_err());
    }

    #[test]
    fn short_write_is_a_transmission_failure() {
        /// Sink that accepts at most 10 bytes per write
        struct Narrow(Vec<u8>);
        impl Write for Narrow {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                let n = buf.len().min(10);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let report = ReplicaReport::new(&[1, 2, 3], &[0, 0, 0]).unwrap();
        let err = report.write_to(&mut Narrow(Vec::new())).unwrap_err();
        assert!(matches!(err, ReportError::ShortWrite { written: 10, .. }));
    }

    #[test]
    fn read_from_recovers_exact_sequence() {
        let report = ReplicaReport::new(&[7, 8, 9], &[0, 5, 0]).unwrap();
        let wire = report.encode().to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        let got = ReplicaReport::read_from(&mut cursor).unwrap();
        assert_eq!(got, report);
        assert_eq!(got.successes(), 2);
    }
}
