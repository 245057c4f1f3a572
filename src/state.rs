/*!
 * Shared Server State Transplant
 *
 * The parent serializes the slice of its runtime state that a persistence
 * worker needs into a fixed binary image; the worker decodes it at startup
 * and owns the copy outright from then on. No field is re-validated and no
 * later parent mutation is ever visible — the image is the copy-on-write
 * boundary. A torn image (wrong length, trailing bytes) is fatal: the
 * worker must never run with partial state.
 */

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::error::StartupError;
use crate::registry::CommandRegistry;

/// Magic prefix of a state image
const STATE_IMAGE_MAGIC: &[u8; 4] = b"CSI1";

/// Length of the keyspace hash seed in bytes
pub const HASH_SEED_LEN: usize = 16;

/// Opaque seed for the keyspace hashing subsystem
///
/// Carried alongside the state image so the worker's dictionary iterates
/// in the same hash order the parent's did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSeed(pub [u8; HASH_SEED_LEN]);

impl HashSeed {
    /// Fold the 16-byte seed down to the u64 the hasher builder accepts
    pub fn fold(&self) -> u64 {
        let lo = u64::from_le_bytes(self.0[..8].try_into().unwrap());
        let hi = u64::from_le_bytes(self.0[8..].try_into().unwrap());
        lo ^ hi.rotate_left(1)
    }
}

/// Handle to a parent-provided channel endpoint
///
/// Endpoints are opaque to this subsystem; they are stored in the state so
/// the external save/rewrite routines can find them. `UNSET` marks a role
/// the current operation does not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint(pub i64);

impl Endpoint {
    /// The "no endpoint wired" sentinel
    pub const UNSET: Endpoint = Endpoint(-1);

    /// True when an endpoint is wired for this role
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0 >= 0
    }
}

/// The transplantable slice of server runtime state
///
/// Mirrors what the parent has at hand-off time: configuration source,
/// keyspace/replication bookkeeping, active-worker pids, and the
/// log-rewrite channel endpoints. Field meanings follow the parent's; the
/// worker overwrites only the fields its single operation owns.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    /// Configuration file the parent was started with, if any
    pub config_file: Option<String>,
    /// Count of keyspace changes since the last save
    pub dirty: u64,
    /// Replication offset to embed in snapshot metadata
    pub master_repl_offset: u64,
    /// Number of connected replicas at hand-off
    pub replica_count: u32,
    /// Role flag: true when the parent is itself a replica
    pub is_replica: bool,
    /// Pid of the active snapshot worker (set by snapshot/transfer ops)
    pub snapshot_child_pid: Option<u32>,
    /// Pid of the active log-rewrite worker (set by the rewrite op)
    pub rewrite_child_pid: Option<u32>,
    /// Rewrite: ack channel, read side, parent -> child
    pub rewrite_ack_from_parent: Endpoint,
    /// Rewrite: incremental data channel, read side, parent -> child
    pub rewrite_data_from_parent: Endpoint,
    /// Rewrite: ack channel, write side, child -> parent
    pub rewrite_ack_to_parent: Endpoint,
    /// Server-side ack read endpoint; unused inside a worker
    pub rewrite_ack_from_child: Endpoint,
    /// Server-side ack write endpoint; unused inside a worker
    pub rewrite_ack_to_child: Endpoint,
    /// Server-side data write endpoint; unused inside a worker
    pub rewrite_data_to_child: Endpoint,
    /// Result channel the transfer op reports through
    pub transfer_result_endpoint: Endpoint,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            config_file: None,
            dirty: 0,
            master_repl_offset: 0,
            replica_count: 0,
            is_replica: false,
            snapshot_child_pid: None,
            rewrite_child_pid: None,
            rewrite_ack_from_parent: Endpoint::UNSET,
            rewrite_data_from_parent: Endpoint::UNSET,
            rewrite_ack_to_parent: Endpoint::UNSET,
            rewrite_ack_from_child: Endpoint::UNSET,
            rewrite_ack_to_child: Endpoint::UNSET,
            rewrite_data_to_child: Endpoint::UNSET,
            transfer_result_endpoint: Endpoint::UNSET,
        }
    }
}

/// Snapshot metadata computed from the state at save time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveInfo {
    /// Replication offset the snapshot corresponds to
    pub repl_offset: u64,
    /// Dirty counter captured with the snapshot
    pub dirty: u64,
}

impl ServerState {
    /// Compute the metadata the serializer embeds in a snapshot
    pub fn save_info(&self) -> SaveInfo {
        SaveInfo {
            repl_offset: self.master_repl_offset,
            dirty: self.dirty,
        }
    }

    /// Exact byte length of this state's image
    pub fn image_len(&self) -> usize {
        // magic + total + path flag/len/bytes + 2 u64 + u32 + u8
        // + 2 pids + 7 endpoints, all i64
        let path = self.config_file.as_ref().map(|p| p.len()).unwrap_or(0);
        4 + 4 + 1 + 2 + path + 8 + 8 + 4 + 1 + 8 * 2 + 8 * 7
    }

    /// Serialize the state into its hand-off image
    pub fn to_blob(&self) -> Bytes {
        let total = self.image_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(STATE_IMAGE_MAGIC);
        buf.put_u32_le(total as u32);
        match &self.config_file {
            Some(p) => {
                buf.put_u8(1);
                buf.put_u16_le(p.len() as u16);
                buf.put_slice(p.as_bytes());
            }
            None => {
                buf.put_u8(0);
                buf.put_u16_le(0);
            }
        }
        buf.put_u64_le(self.dirty);
        buf.put_u64_le(self.master_repl_offset);
        buf.put_u32_le(self.replica_count);
        buf.put_u8(self.is_replica as u8);
        put_pid(&mut buf, self.snapshot_child_pid);
        put_pid(&mut buf, self.rewrite_child_pid);
        for ep in [
            self.rewrite_ack_from_parent,
            self.rewrite_data_from_parent,
            self.rewrite_ack_to_parent,
            self.rewrite_ack_from_child,
            self.rewrite_ack_to_child,
            self.rewrite_data_to_child,
            self.transfer_result_endpoint,
        ] {
            buf.put_i64_le(ep.0);
        }
        debug_assert_eq!(buf.len(), total);
        buf.freeze()
    }

    /// Decode a hand-off image, rejecting anything but an exact fit
    pub fn from_blob(blob: &[u8]) -> Result<ServerState, StartupError> {
        if blob.len() < 8 || &blob[..4] != STATE_IMAGE_MAGIC {
            return Err(StartupError::BadMagic);
        }
        let mut buf = &blob[4..];
        let total = buf.get_u32_le() as usize;
        if total != blob.len() {
            return Err(StartupError::BlobSizeMismatch {
                expected: total,
                actual: blob.len(),
            });
        }

        let mismatch = || StartupError::BlobSizeMismatch {
            expected: total,
            actual: blob.len(),
        };

        // Fixed tail after the variable path field. Check once up front so
        // the Buf getters below cannot underflow.
        if buf.remaining() < 3 {
            return Err(mismatch());
        }
        let has_path = buf.get_u8() == 1;
        let path_len = buf.get_u16_le() as usize;
        const FIXED_TAIL: usize = 8 + 8 + 4 + 1 + 8 * 2 + 8 * 7;
        if buf.remaining() != path_len + FIXED_TAIL {
            return Err(mismatch());
        }
        let config_file = if has_path {
            let raw = buf.copy_to_bytes(path_len);
            Some(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| StartupError::MalformedImage("config path is not utf-8"))?,
            )
        } else {
            buf.advance(path_len);
            None
        };

        let dirty = buf.get_u64_le();
        let master_repl_offset = buf.get_u64_le();
        let replica_count = buf.get_u32_le();
        let is_replica = buf.get_u8() != 0;
        let snapshot_child_pid = get_pid(&mut buf);
        let rewrite_child_pid = get_pid(&mut buf);
        let mut eps = [Endpoint::UNSET; 7];
        for ep in eps.iter_mut() {
            *ep = Endpoint(buf.get_i64_le());
        }

        Ok(ServerState {
            config_file,
            dirty,
            master_repl_offset,
            replica_count,
            is_replica,
            snapshot_child_pid,
            rewrite_child_pid,
            rewrite_ack_from_parent: eps[0],
            rewrite_data_from_parent: eps[1],
            rewrite_ack_to_parent: eps[2],
            rewrite_ack_from_child: eps[3],
            rewrite_ack_to_child: eps[4],
            rewrite_data_to_child: eps[5],
            transfer_result_endpoint: eps[6],
        })
    }
}

fn put_pid(buf: &mut BytesMut, pid: Option<u32>) {
    buf.put_i64_le(pid.map(|p| p as i64).unwrap_or(-1));
}

fn get_pid(buf: &mut &[u8]) -> Option<u32> {
    let raw = buf.get_i64_le();
    (raw >= 0).then(|| raw as u32)
}

/// Everything the launcher hands a freshly created worker
///
/// The blob and seed are copied values; the registry reference is only
/// consulted when the state carries no configuration file, and is treated
/// as read-only for the worker's whole lifetime.
pub struct StateHandoff {
    /// Serialized state image, exactly `ServerState::image_len()` bytes
    pub blob: Bytes,
    /// Keyspace hash seed captured from the parent
    pub seed: HashSeed,
    /// Pre-built command registry for the no-config-file path
    pub registry: Arc<CommandRegistry>,
}

impl StateHandoff {
    /// Capture a hand-off from the parent's live state
    pub fn capture(state: &ServerState, seed: HashSeed, registry: Arc<CommandRegistry>) -> Self {
        Self {
            blob: state.to_blob(),
            seed,
            registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> ServerState {
        ServerState {
            config_file: Some("/etc/cinder/cinder.conf".into()),
            dirty: 421,
            master_repl_offset: 99_017,
            replica_count: 3,
            is_replica: false,
            snapshot_child_pid: None,
            rewrite_child_pid: None,
            rewrite_ack_from_parent: Endpoint(10),
            rewrite_data_from_parent: Endpoint(11),
            rewrite_ack_to_parent: Endpoint(12),
            rewrite_ack_from_child: Endpoint(13),
            rewrite_ack_to_child: Endpoint(14),
            rewrite_data_to_child: Endpoint(15),
            transfer_result_endpoint: Endpoint::UNSET,
        }
    }

    #[test]
    fn blob_round_trip_preserves_every_field() {
        let state = populated();
        let blob = state.to_blob();
        assert_eq!(blob.len(), state.image_len());
        assert_eq!(ServerState::from_blob(&blob).unwrap(), state);
    }

    #[test]
    fn round_trip_without_config_file() {
        let state = ServerState::default();
        assert_eq!(ServerState::from_blob(&state.to_blob()).unwrap(), state);
    }

    #[test]
    fn truncated_blob_is_fatal() {
        let blob = populated().to_blob();
        let err = ServerState::from_blob(&blob[..blob.len() - 1]).unwrap_err();
        assert!(matches!(err, StartupError::BlobSizeMismatch { .. }));
    }

    #[test]
    fn oversized_blob_is_fatal() {
        let mut raw = populated().to_blob().to_vec();
        raw.push(0);
        let err = ServerState::from_blob(&raw).unwrap_err();
        assert!(matches!(err, StartupError::BlobSizeMismatch { .. }));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            ServerState::from_blob(b"not a state image"),
            Err(StartupError::BadMagic)
        ));
    }

    #[test]
    fn seed_fold_depends_on_both_halves() {
        let mut a = [0u8; HASH_SEED_LEN];
        let mut b = a;
        a[0] = 1;
        b[15] = 1;
        assert_ne!(HashSeed(a).fold(), HashSeed(b).fold());
        assert_ne!(HashSeed(a).fold(), HashSeed([0; HASH_SEED_LEN]).fold());
    }
}
