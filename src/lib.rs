// Core modules for Cinder quasi-fork persistence workers
pub mod config; // directive parser + filtered re-read for workers
pub mod error; // startup/operation/report failure taxonomy
pub mod fanout; // broadcast writer over replica sockets + EOF mark
pub mod keyspace; // seeded dictionary the worker serializes from
pub mod pipe; // in-process channel endpoints for launchers
pub mod registry; // command tables + extension reinitialization
pub mod report; // binary replica report protocol
pub mod state; // transplantable server state + hand-off blob
pub mod worker; // the three persistence operation bodies

// Re-export all public items from modules for easier access
pub use config::*;
pub use error::*;
pub use fanout::*;
pub use keyspace::*;
pub use pipe::*;
pub use registry::*;
pub use report::*;
pub use state::*;
pub use worker::*;

// Default snapshot target, relative to the server working directory
pub const DEFAULT_SNAPSHOT_FILE: &str = "dump.cdb";
