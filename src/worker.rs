/*!
 * Quasi-Fork Worker
 *
 * A worker is the stand-in for a forked child process: it receives a
 * frozen copy of the parent's state, performs exactly one persistence
 * operation, and terminates. Three operation bodies exist — full snapshot
 * save, append-log rewrite, and live replica transfer — and each one
 * stamps its own pid into the transplanted state so the parent can track
 * it, then delegates the heavy lifting to an external collaborator.
 *
 * Nothing in here waits on the parent except through the explicitly wired
 * channels, and nothing retries: a failed operation is the worker's
 * terminal status and re-attempting is the parent's call.
 */

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{StartupError, WorkerError, WorkerResult};
use crate::fanout::{random_eof_mark, FanoutWriter};
use crate::keyspace::Keyspace;
use crate::registry::{CommandRegistry, ExtensionHost, ExtensionLoader};
use crate::report::ReplicaReport;
use crate::state::{Endpoint, SaveInfo, ServerState, StateHandoff};

/// External snapshot serializer
///
/// Owns the on-wire snapshot format; the worker only decides where the
/// bytes go and what metadata is embedded.
pub trait Snapshotter {
    fn save(&mut self, keys: &Keyspace, info: &SaveInfo, out: &mut dyn Write) -> io::Result<()>;
}

/// External append-log rewrite routine
///
/// Streams acknowledgements and incremental data through the channel
/// endpoints it finds wired into the state.
pub trait LogRewriter {
    fn rewrite(&mut self, state: &ServerState, keys: &Keyspace, target: &Path) -> io::Result<()>;
}

/// A sink connected to one replica
pub type ReplicaSink = Box<dyn Write + Send>;

/// The single operation a worker is created to perform
pub enum SaveRequest {
    /// Write a full snapshot to a file
    Snapshot { target: PathBuf },
    /// Rewrite the append log, exchanging acks/data with the parent
    LogRewrite {
        target: PathBuf,
        ack_read: Endpoint,
        data_read: Endpoint,
        ack_write: Endpoint,
    },
    /// Stream a snapshot to connected replicas and report per-replica
    /// outcomes back through the result channel
    ReplicaTransfer {
        sockets: Vec<ReplicaSink>,
        replica_ids: Vec<u64>,
        result_endpoint: Endpoint,
        result_channel: Box<dyn Write + Send>,
    },
}

/// External collaborators a worker delegates to
pub struct WorkerDeps<'a> {
    pub snapshotter: &'a mut dyn Snapshotter,
    pub rewriter: &'a mut dyn LogRewriter,
}

/// Worker lifecycle phase
///
/// `ExtensionsReady` only appears when the parent had a config file,
/// and `ReportEmitted` only on the replica-transfer path, between
/// report delivery and termination. Every operation ends in
/// `Terminated`, and a terminated worker refuses further operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    StateInstalled,
    ExtensionsReady,
    OperationRunning,
    ReportEmitted,
    Terminated,
}

/// Extension state a worker runs with
pub enum WorkerExtensions {
    /// Rebuilt from the parent's config file
    Rebuilt(ExtensionHost),
    /// Parent's pre-built registry, adopted read-only (no config file)
    Inherited(std::sync::Arc<CommandRegistry>),
}

impl WorkerExtensions {
    /// The command registry in effect for this worker
    pub fn registry(&self) -> &CommandRegistry {
        match self {
            WorkerExtensions::Rebuilt(host) => &host.registry,
            WorkerExtensions::Inherited(reg) => reg,
        }
    }
}

/// An isolated persistence worker
pub struct Worker {
    pid: u32,
    state: ServerState,
    keys: Keyspace,
    extensions: WorkerExtensions,
    phase: Phase,
}

impl Worker {
    /// Install the hand-off into a fresh worker
    ///
    /// Decodes the state image, seeds the keyspace hasher, and — when the
    /// state says a config file was in use — rebuilds the extension
    /// subsystem before anything else may run. Without a config file the
    /// hand-off's registry reference is adopted as-is.
    pub fn install(
        handoff: &StateHandoff,
        loader: &mut dyn ExtensionLoader,
    ) -> Result<Worker, StartupError> {
        let state = ServerState::from_blob(&handoff.blob)?;
        let keys = Keyspace::with_seed(&handoff.seed);
        let pid = std::process::id();

        let (extensions, phase) = match &state.config_file {
            Some(cfg) => {
                let host = ExtensionHost::reinit(Path::new(cfg), loader)?;
                (WorkerExtensions::Rebuilt(host), Phase::ExtensionsReady)
            }
            None => (
                WorkerExtensions::Inherited(handoff.registry.clone()),
                Phase::StateInstalled,
            ),
        };

        log::info!("worker {pid} installed parent state");
        Ok(Worker {
            pid,
            state,
            keys,
            extensions,
            phase,
        })
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The worker's own copy of the server state
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Command registry in effect for this worker
    pub fn registry(&self) -> &CommandRegistry {
        self.extensions.registry()
    }

    /// Worker-local keyspace, populated by the launcher from the hand-off
    /// mapping before the operation runs
    pub fn keyspace_mut(&mut self) -> &mut Keyspace {
        &mut self.keys
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    /// Run the single operation this worker was created for
    pub fn run(&mut self, request: SaveRequest, deps: &mut WorkerDeps<'_>) -> WorkerResult<()> {
        match request {
            SaveRequest::Snapshot { target } => self.save_snapshot(&target, deps.snapshotter),
            SaveRequest::LogRewrite {
                target,
                ack_read,
                data_read,
                ack_write,
            } => self.rewrite_log(&target, ack_read, data_read, ack_write, deps.rewriter),
            SaveRequest::ReplicaTransfer {
                sockets,
                replica_ids,
                result_endpoint,
                mut result_channel,
            } => self.transfer_to_replicas(
                sockets,
                &replica_ids,
                result_endpoint,
                &mut *result_channel,
                deps.snapshotter,
            ),
        }
    }

    /// Full snapshot save to a file
    pub fn save_snapshot(
        &mut self,
        target: &Path,
        snapshotter: &mut dyn Snapshotter,
    ) -> WorkerResult<()> {
        self.begin_operation()?;
        self.state.snapshot_child_pid = Some(self.pid);
        let info = self.state.save_info();

        let res = write_snapshot_file(snapshotter, &self.keys, &info, target);
        self.advance_phase(Phase::Terminated);
        res.map_err(|e| {
            log::warn!("snapshot save failed in worker {}: {e}", self.pid);
            WorkerError::SaveFailed(e)
        })
    }

    /// Append-log rewrite
    ///
    /// Wires the three parent-provided channel endpoints into the state
    /// for the external rewrite routine, and unsets the server-side
    /// endpoints the worker has no business touching.
    pub fn rewrite_log(
        &mut self,
        target: &Path,
        ack_read: Endpoint,
        data_read: Endpoint,
        ack_write: Endpoint,
        rewriter: &mut dyn LogRewriter,
    ) -> WorkerResult<()> {
        self.begin_operation()?;
        self.state.rewrite_child_pid = Some(self.pid);
        self.state.rewrite_ack_from_parent = ack_read;
        self.state.rewrite_data_from_parent = data_read;
        self.state.rewrite_ack_to_parent = ack_write;
        self.state.rewrite_ack_from_child = Endpoint::UNSET;
        self.state.rewrite_ack_to_child = Endpoint::UNSET;
        self.state.rewrite_data_to_child = Endpoint::UNSET;

        let res = rewriter.rewrite(&self.state, &self.keys, target);
        self.advance_phase(Phase::Terminated);
        res.map_err(|e| {
            log::warn!("log rewrite failed in worker {}: {e}", self.pid);
            WorkerError::RewriteFailed(e)
        })
    }

    /// Stream a snapshot to connected replicas and report the outcome
    ///
    /// Success needs both a clean write-and-flush sequence and at least
    /// one replica that received the complete stream. The per-replica
    /// report is then written to the result channel; if that report
    /// cannot be delivered the whole operation counts as failed, because
    /// an unreported success is useless to the parent.
    pub fn transfer_to_replicas(
        &mut self,
        sockets: Vec<ReplicaSink>,
        replica_ids: &[u64],
        result_endpoint: Endpoint,
        result_channel: &mut dyn Write,
        snapshotter: &mut dyn Snapshotter,
    ) -> WorkerResult<()> {
        self.begin_operation()?;
        self.state.snapshot_child_pid = Some(self.pid);
        self.state.transfer_result_endpoint = result_endpoint;

        if sockets.is_empty() {
            return self.transfer_failed("no replica sockets provided".into());
        }
        if sockets.len() != replica_ids.len() {
            return self.transfer_failed(format!(
                "{} sockets but {} replica ids",
                sockets.len(),
                replica_ids.len()
            ));
        }

        let mut fan = FanoutWriter::new(sockets);
        let info = self.state.save_info();
        let streamed = stream_with_eof_mark(snapshotter, &self.keys, &info, &mut fan);

        if let Err(e) = streamed {
            return self.transfer_failed(format!("snapshot stream: {e}"));
        }
        if fan.live() == 0 {
            // A transfer nobody received is not a transfer.
            return self.transfer_failed("no replica received the snapshot".into());
        }

        let dirty = private_dirty_bytes();
        if dirty > 0 {
            log::info!(
                "transfer: {} MB of memory duplicated by copy-on-write",
                dirty / (1024 * 1024)
            );
        }

        let statuses = fan.status_codes();
        let emitted = ReplicaReport::new(replica_ids, &statuses)
            .and_then(|report| report.write_to(result_channel));
        match emitted {
            Ok(()) => {
                self.advance_phase(Phase::ReportEmitted);
                self.advance_phase(Phase::Terminated);
                Ok(())
            }
            Err(e) => self.transfer_failed(format!("outcome could not be reported: {e}")),
        }
    }

    fn transfer_failed(&mut self, msg: String) -> WorkerResult<()> {
        self.advance_phase(Phase::Terminated);
        log::warn!("replica transfer failed in worker {}: {msg}", self.pid);
        Err(WorkerError::TransferFailed(msg))
    }

    fn advance_phase(&mut self, next: Phase) {
        log::debug!("worker {}: {:?} -> {:?}", self.pid, self.phase, next);
        self.phase = next;
    }

    fn begin_operation(&mut self) -> WorkerResult<()> {
        match self.phase {
            Phase::StateInstalled | Phase::ExtensionsReady => {
                self.advance_phase(Phase::OperationRunning);
                Ok(())
            }
            Phase::Created => Err(WorkerError::NotReady("state not installed")),
            Phase::OperationRunning => Err(WorkerError::NotReady("operation already running")),
            Phase::ReportEmitted | Phase::Terminated => {
                Err(WorkerError::NotReady("worker already performed its operation"))
            }
        }
    }
}

/// Map an operation result to the process exit status for the launcher
pub fn exit_code(result: &WorkerResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    }
}

fn write_snapshot_file(
    snapshotter: &mut dyn Snapshotter,
    keys: &Keyspace,
    info: &SaveInfo,
    target: &Path,
) -> io::Result<()> {
    // Serialize into a sibling temp file and rename it into place only
    // after a clean flush + sync; a failed save must leave the previous
    // snapshot untouched.
    let dir = target.parent().filter(|p| !p.as_os_str().is_empty());
    let tmp = dir
        .unwrap_or(Path::new("."))
        .join(format!("temp-{}.cdb", std::process::id()));

    let res = (|| {
        let file = File::create(&tmp)?;
        let mut out = BufWriter::new(file);
        snapshotter.save(keys, info, &mut out)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        fs::rename(&tmp, target)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

/// Frame a snapshot stream so receivers can detect completion
///
/// Preamble `$EOF:<mark>\r\n`, the snapshot payload, then the bare mark:
/// the receiver scans for the 40 bytes it was promised up front.
fn stream_with_eof_mark(
    snapshotter: &mut dyn Snapshotter,
    keys: &Keyspace,
    info: &SaveInfo,
    out: &mut FanoutWriter,
) -> io::Result<()> {
    let mark = random_eof_mark();
    out.write_all(b"$EOF:")?;
    out.write_all(&mark)?;
    out.write_all(b"\r\n")?;
    snapshotter.save(keys, info, out)?;
    out.write_all(&mark)?;
    out.flush()
}

/// Bytes of this process's pages privately dirtied since creation
///
/// Observability only: on Linux this reads `Private_Dirty` from
/// smaps_rollup, elsewhere it reports 0.
#[cfg(target_os = "linux")]
pub fn private_dirty_bytes() -> u64 {
    let Ok(text) = std::fs::read_to_string("/proc/self/smaps_rollup") else {
        return 0;
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Private_Dirty:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
pub fn private_dirty_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CommandEntry, CommandSource, ExtensionError};
    use crate::state::HashSeed;
    use bytes::Bytes;
    use smol_str::SmolStr;
    use std::sync::Arc;

    /// Serializer that writes `key=value` lines
    struct FlatSnapshotter;
    impl Snapshotter for FlatSnapshotter {
        fn save(
            &mut self,
            keys: &Keyspace,
            info: &SaveInfo,
            out: &mut dyn Write,
        ) -> io::Result<()> {
            writeln!(out, "offset {}", info.repl_offset)?;
            for (k, v) in keys.iter() {
                writeln!(out, "{:?}={:?}", k, v)?;
            }
            Ok(())
        }
    }

    struct NoopRewriter;
    impl LogRewriter for NoopRewriter {
        fn rewrite(&mut self, _: &ServerState, _: &Keyspace, _: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    struct NoopLoader;
    impl ExtensionLoader for NoopLoader {
        fn load(
            &mut self,
            _: &Path,
            _: &[String],
            registry: &mut CommandRegistry,
        ) -> Result<(), ExtensionError> {
            registry.register(CommandEntry {
                name: SmolStr::new("EXT.NOOP"),
                arity: 1,
                source: CommandSource::Extension(SmolStr::new("noop")),
            });
            Ok(())
        }
    }

    fn handoff(state: &ServerState) -> StateHandoff {
        StateHandoff::capture(
            state,
            HashSeed([9; 16]),
            Arc::new(CommandRegistry::bootstrap()),
        )
    }

    #[test]
    fn no_config_file_inherits_the_registry() {
        let worker = Worker::install(&handoff(&ServerState::default()), &mut NoopLoader).unwrap();
        assert_eq!(worker.phase(), Phase::StateInstalled);
        assert!(matches!(worker.extensions, WorkerExtensions::Inherited(_)));
        assert!(worker.registry().lookup("GET").is_some());
    }

    #[test]
    fn config_file_forces_extension_rebuild() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = dir.path().join("cinder.conf");
        std::fs::write(&conf, "loadmodule mod.so\n").unwrap();
        let state = ServerState {
            config_file: Some(conf.to_string_lossy().into_owned()),
            ..ServerState::default()
        };
        let worker = Worker::install(&handoff(&state), &mut NoopLoader).unwrap();
        assert_eq!(worker.phase(), Phase::ExtensionsReady);
        assert!(worker.registry().lookup("EXT.NOOP").is_some());
    }

    #[test]
    fn config_parse_error_blocks_every_operation() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = dir.path().join("bad.conf");
        std::fs::write(&conf, "loadmodule \"broken\n").unwrap();
        let state = ServerState {
            config_file: Some(conf.to_string_lossy().into_owned()),
            ..ServerState::default()
        };
        assert!(Worker::install(&handoff(&state), &mut NoopLoader).is_err());
    }

    #[test]
    fn snapshot_records_own_pid_and_leaves_the_rest_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = ServerState {
            dirty: 17,
            master_repl_offset: 4242,
            replica_count: 2,
            ..ServerState::default()
        };
        let mut worker = Worker::install(&handoff(&source), &mut NoopLoader).unwrap();
        worker
            .keyspace_mut()
            .set(Bytes::from_static(b"k"), crate::keyspace::Value::Int(1));
        worker
            .save_snapshot(&dir.path().join("dump.db"), &mut FlatSnapshotter)
            .unwrap();

        assert_eq!(worker.phase(), Phase::Terminated);
        assert_eq!(worker.state().snapshot_child_pid, Some(std::process::id()));
        // Everything the operation does not own still matches the source.
        let mut expected = source;
        expected.snapshot_child_pid = worker.state().snapshot_child_pid;
        assert_eq!(worker.state(), &expected);
    }

    #[test]
    fn rewrite_wires_parent_endpoints_and_unsets_child_side() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = ServerState {
            // Parent-side values that must be cleared in the worker
            rewrite_ack_from_child: Endpoint(31),
            rewrite_ack_to_child: Endpoint(32),
            rewrite_data_to_child: Endpoint(33),
            ..ServerState::default()
        };
        let mut worker = Worker::install(&handoff(&source), &mut NoopLoader).unwrap();
        worker
            .rewrite_log(
                &dir.path().join("log.rewrite"),
                Endpoint(3),
                Endpoint(4),
                Endpoint(5),
                &mut NoopRewriter,
            )
            .unwrap();

        let s = worker.state();
        assert_eq!(s.rewrite_child_pid, Some(std::process::id()));
        assert_eq!(s.rewrite_ack_from_parent, Endpoint(3));
        assert_eq!(s.rewrite_data_from_parent, Endpoint(4));
        assert_eq!(s.rewrite_ack_to_parent, Endpoint(5));
        assert_eq!(s.rewrite_ack_from_child, Endpoint::UNSET);
        assert_eq!(s.rewrite_ack_to_child, Endpoint::UNSET);
        assert_eq!(s.rewrite_data_to_child, Endpoint::UNSET);
    }

    #[test]
    fn a_worker_performs_exactly_one_operation() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut worker = Worker::install(&handoff(&ServerState::default()), &mut NoopLoader).unwrap();
        worker
            .save_snapshot(&dir.path().join("a.db"), &mut FlatSnapshotter)
            .unwrap();
        let again = worker.save_snapshot(&dir.path().join("b.db"), &mut FlatSnapshotter);
        assert!(matches!(again, Err(WorkerError::NotReady(_))));
    }

    #[test]
    fn zero_sockets_fail_without_a_report() {
        let mut worker = Worker::install(&handoff(&ServerState::default()), &mut NoopLoader).unwrap();
        let mut sink = Vec::new();
        let res = worker.transfer_to_replicas(
            Vec::new(),
            &[],
            Endpoint(1),
            &mut sink,
            &mut FlatSnapshotter,
        );
        assert!(matches!(res, Err(WorkerError::TransferFailed(_))));
        assert!(sink.is_empty(), "no report bytes may be written");
    }

    #[test]
    fn exit_codes_match_terminal_status() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(
            exit_code(&Err(WorkerError::TransferFailed("x".into()))),
            WorkerError::TransferFailed("x".into()).exit_code()
        );
    }
}
