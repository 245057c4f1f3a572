/*!
 * Command Registry and Extension Reinitialization
 *
 * A worker never inherits the parent's live command tables: they contain
 * extension-registered entries bound to parent-side resources, and the
 * mutexes the extension subsystem leans on do not survive the isolation
 * boundary (worker threads are not inherited). Everything here is rebuilt
 * from empty at worker start — fresh sync primitives, builtin command
 * table, then a filtered re-read of the parent's config file to find the
 * extensions that must participate in the save.
 */

use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};

use crate::config::{load_directives, modules_only};
use crate::error::{ConfigError, StartupError};

// Same table hasher the parent's dictionaries use
type AHash = BuildHasherDefault<ahash::AHasher>;

/// Where a command entry came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// Part of the built-in table
    Builtin,
    /// Registered by the named extension module
    Extension(SmolStr),
}

/// One entry in the command table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    /// Command name, uppercase
    pub name: SmolStr,
    /// Redis-style arity: exact when positive, minimum when negative
    pub arity: i8,
    /// Builtin or extension-registered
    pub source: CommandSource,
}

/// Built-in command set seeded into every fresh registry
const BUILTINS: &[(&str, i8)] = &[
    ("PING", 1),
    ("GET", 2),
    ("SET", 3),
    ("DEL", 2),
    ("RENAME", 3),
    ("EXISTS", 2),
    ("INCR", 2),
    ("MGET", -2),
    ("MSET", -3),
];

/// Active and original command tables
///
/// `commands` is the live dispatch table; `orig_commands` preserves the
/// pre-rename view, mirroring the parent's pair of dictionaries.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<SmolStr, CommandEntry, AHash>,
    orig_commands: HashMap<SmolStr, CommandEntry, AHash>,
}

impl CommandRegistry {
    /// Build a registry holding exactly the built-in command set
    pub fn bootstrap() -> Self {
        let mut reg = Self::default();
        for &(name, arity) in BUILTINS {
            reg.register(CommandEntry {
                name: SmolStr::new(name),
                arity,
                source: CommandSource::Builtin,
            });
        }
        reg
    }

    /// Insert an entry into both tables, replacing any previous one
    pub fn register(&mut self, entry: CommandEntry) {
        self.orig_commands.insert(entry.name.clone(), entry.clone());
        self.commands.insert(entry.name.clone(), entry);
    }

    /// Look up a command by name (case-insensitive)
    pub fn lookup(&self, name: &str) -> Option<&CommandEntry> {
        self.commands.get(name.to_ascii_uppercase().as_str())
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when no commands are registered
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sorted command names, extension entries included
    pub fn names(&self) -> Vec<SmolStr> {
        let mut names: Vec<SmolStr> = self.commands.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// Synchronization primitives the extension subsystem depends on
///
/// Constructed fresh in every worker; a transplanted mutex could be held
/// by a parent thread that does not exist on this side of the boundary.
#[derive(Debug, Default)]
pub struct ExtensionSync {
    /// Global lock extensions take around registry mutation
    pub gil: Mutex<()>,
    /// Count of objects queued for deferred reclamation
    pub lazyfree_objects: Mutex<u64>,
    /// Clients unblocked by extensions, drained by the event loop
    pub unblocked_clients: Mutex<Vec<SmolStr>>,
}

/// Failure while loading one extension module
///
/// The loader decides the policy: a `fatal` failure aborts worker startup,
/// a non-fatal one is logged and the module is skipped.
#[derive(Debug)]
pub struct ExtensionError {
    pub module: PathBuf,
    pub reason: String,
    pub fatal: bool,
}

impl fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module.display(), self.reason)
    }
}

impl std::error::Error for ExtensionError {}

/// External extension-loading capability
///
/// Implementations open the module and register its commands into the
/// fresh registry. The worker only sequences calls and applies the
/// fatality policy the loader reports.
pub trait ExtensionLoader {
    fn load(
        &mut self,
        module: &Path,
        args: &[String],
        registry: &mut CommandRegistry,
    ) -> Result<(), ExtensionError>;
}

/// Per-worker extension subsystem, rebuilt from scratch
#[derive(Debug)]
pub struct ExtensionHost {
    /// Fresh synchronization primitives
    pub sync: ExtensionSync,
    /// Rebuilt command tables: builtins plus loaded extensions
    pub registry: CommandRegistry,
    /// Modules loaded from the config re-read, in directive order
    pub loaded: Vec<PathBuf>,
}

impl ExtensionHost {
    /// Rebuild extension state inside a worker from the parent's config
    ///
    /// Runs the startup sequence the parent itself would: fresh sync
    /// primitives, empty command tables repopulated with builtins, a
    /// config re-read narrowed to `include`/`loadmodule`, then deferred
    /// loading of every collected module. Config parse errors abort
    /// worker startup; per-module failures follow the loader's policy.
    pub fn reinit(
        config_file: &Path,
        loader: &mut dyn ExtensionLoader,
    ) -> Result<ExtensionHost, StartupError> {
        let sync = ExtensionSync::default();
        let mut registry = CommandRegistry::bootstrap();

        let directives = load_directives(config_file, &modules_only)?;

        // Collect first, load after: module loading may be expensive and
        // must observe the complete directive set.
        let mut queue = Vec::new();
        for d in &directives {
            debug_assert_eq!(d.name, "loadmodule");
            let Some((module, args)) = d.args.split_first() else {
                return Err(StartupError::Config(ConfigError {
                    file: d.file.clone(),
                    line: d.line,
                    reason: "loadmodule expects a module path".into(),
                }));
            };
            queue.push((PathBuf::from(module), args.to_vec()));
        }

        let mut loaded = Vec::with_capacity(queue.len());
        for (module, args) in queue {
            match loader.load(&module, &args, &mut registry) {
                Ok(()) => {
                    log::info!("extension loaded: {}", module.display());
                    loaded.push(module);
                }
                Err(e) if e.fatal => {
                    log::warn!("extension load aborted worker: {e}");
                    return Err(StartupError::Extension(e.to_string()));
                }
                Err(e) => {
                    log::warn!("extension load failed, skipping: {e}");
                }
            }
        }

        Ok(ExtensionHost {
            sync,
            registry,
            loaded,
        })
    }
}
