/*!
 * Configuration Directive Re-Read
 *
 * Line-based parser for the server's configuration grammar, used by
 * workers to re-read the parent's config file through a narrowing filter.
 * The filter is a plain predicate over the directive name so the same
 * parser serves both a full pass and the restricted extensions-only pass.
 * Parse errors are fatal here exactly as they are during parent startup.
 */

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// One parsed configuration directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Directive name, lowercased
    pub name: String,
    /// Remaining tokens on the line
    pub args: Vec<String>,
    /// File the directive came from (includes resolve to their own file)
    pub file: PathBuf,
    /// 1-based source line, for parent-style diagnostics
    pub line: usize,
}

/// Admit only the directives a worker needs to re-load extensions
pub fn modules_only(name: &str) -> bool {
    name.eq_ignore_ascii_case("include") || name.eq_ignore_ascii_case("loadmodule")
}

/// Read a configuration file, keeping only directives the filter admits
///
/// `include` directives recurse (when admitted) with the same filter,
/// resolving relative paths against the including file's directory.
/// Directives the filter rejects are silently inert; tokenization errors
/// and unreadable includes are fatal.
pub fn load_directives(
    path: &Path,
    filter: &dyn Fn(&str) -> bool,
) -> Result<Vec<Directive>, ConfigError> {
    let mut out = Vec::new();
    read_file(path, filter, &mut out, 0)?;
    Ok(out)
}

/// Guard against include cycles; the original tolerates none either
const MAX_INCLUDE_DEPTH: usize = 16;

fn read_file(
    path: &Path,
    filter: &dyn Fn(&str) -> bool,
    out: &mut Vec<Directive>,
    depth: usize,
) -> Result<(), ConfigError> {
    let err = |line: usize, reason: String| ConfigError {
        file: path.to_path_buf(),
        line,
        reason,
    };

    if depth > MAX_INCLUDE_DEPTH {
        return Err(err(0, "include nesting too deep".into()));
    }

    let text = fs::read_to_string(path).map_err(|e| err(0, format!("cannot read: {e}")))?;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens = split_args(line).map_err(|reason| err(lineno, reason.into()))?;
        let Some((name, args)) = tokens.split_first() else {
            continue;
        };
        let name = name.to_ascii_lowercase();

        if !filter(&name) {
            continue;
        }

        if name == "include" {
            if args.len() != 1 {
                return Err(err(lineno, "include expects exactly one path".into()));
            }
            let target = resolve_include(path, &args[0]);
            read_file(&target, filter, out, depth + 1)?;
            continue;
        }

        out.push(Directive {
            name,
            args: args.to_vec(),
            file: path.to_path_buf(),
            line: lineno,
        });
    }

    Ok(())
}

/// Relative includes resolve against the including file's directory
fn resolve_include(from: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        from.parent().unwrap_or(Path::new(".")).join(target)
    }
}

/// Split a directive line into tokens, honoring double quotes
fn split_args(line: &str) -> Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut tok = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                tok.push(c);
            }
            if !closed {
                return Err("unbalanced quotes in config line");
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                tok.push(c);
                chars.next();
            }
        }
        tokens.push(tok);
    }

    Ok(tokens)
}
