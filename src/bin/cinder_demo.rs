/*!
 * Cinder Worker Demo
 *
 * Walks one quasi-fork cycle in-process: a "parent" captures its state
 * into a hand-off blob, a worker installs it on another thread, streams
 * a snapshot to two in-memory replicas, and the parent reads the replica
 * report back over the result channel.
 */

use anyhow::Result;
use bytes::Bytes;
use cinder::*;
use std::io::Write;
use std::sync::Arc;

/// Toy serializer: one `key value` line per entry
struct LineSnapshotter;

impl Snapshotter for LineSnapshotter {
    fn save(
        &mut self,
        keys: &Keyspace,
        info: &SaveInfo,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        writeln!(out, "# repl-offset {}", info.repl_offset)?;
        for (k, v) in keys.iter() {
            writeln!(out, "{} {:?}", String::from_utf8_lossy(k), v)?;
        }
        Ok(())
    }
}

struct NoLoader;

impl ExtensionLoader for NoLoader {
    fn load(
        &mut self,
        module: &std::path::Path,
        _args: &[String],
        _registry: &mut CommandRegistry,
    ) -> std::result::Result<(), ExtensionError> {
        Err(ExtensionError {
            module: module.to_path_buf(),
            reason: "demo has no module loader".into(),
            fatal: false,
        })
    }
}

fn main() -> Result<()> {
    // Initialize logging - respects RUST_LOG environment variable
    env_logger::init();

    // Parent side: live state and a pre-built registry
    let parent_state = ServerState {
        dirty: 3,
        master_repl_offset: 1024,
        replica_count: 2,
        ..ServerState::default()
    };
    let registry = Arc::new(CommandRegistry::bootstrap());
    let handoff = StateHandoff::capture(&parent_state, HashSeed([42; 16]), registry);

    // Result channel the worker reports through
    let (result_tx, mut result_rx) = pipe();

    // "Fork": the worker owns its copy from here on
    let worker_thread = std::thread::spawn(move || -> WorkerResult<()> {
        let mut result_tx = result_tx;
        let mut worker =
            Worker::install(&handoff, &mut NoLoader).expect("hand-off blob is well-formed");
        for i in 0..4u32 {
            worker
                .keyspace_mut()
                .set(Bytes::from(format!("key:{i}")), Value::Int(i as i64));
        }

        let sockets: Vec<ReplicaSink> = vec![Box::new(Vec::new()), Box::new(Vec::new())];
        let res = worker.transfer_to_replicas(
            sockets,
            &[101, 102],
            Endpoint(7),
            &mut result_tx,
            &mut LineSnapshotter,
        );
        println!("worker exit status: {}", exit_code(&res));
        res
    });

    // Parent side: consume exactly one report
    let report = ReplicaReport::read_from(&mut result_rx)?;
    for outcome in report.entries() {
        println!(
            "replica {}: {}",
            outcome.replica_id,
            if outcome.succeeded() { "ok" } else { "failed" }
        );
    }

    worker_thread
        .join()
        .expect("worker thread panicked")
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
