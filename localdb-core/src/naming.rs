//! Instance identifier derivation
//!
//! One identifier names the LocalDB instance, the database inside it, and the
//! stem of both backing files. It is derived from a naming [`Scope`] applied to a
//! [`ProcessIdentity`] captured once at startup, then sanitized to a regular
//! T-SQL identifier.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{LocalDbError, Result};

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").expect("valid identifier regex"));

/// Strategy for deriving the raw name of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Full path of the running executable
    BinaryLocation,
    /// File stem of the running executable
    BinaryName,
    /// Current process id
    ProcessId,
    /// Fresh random identifier per run
    Random,
}

impl Scope {
    /// Scope used when nothing overrides it
    pub const DEFAULT: Scope = Scope::BinaryName;

    pub const ALL: [Scope; 4] = [
        Scope::BinaryLocation,
        Scope::BinaryName,
        Scope::ProcessId,
        Scope::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::BinaryLocation => "binary-location",
            Scope::BinaryName => "binary-name",
            Scope::ProcessId => "process-id",
            Scope::Random => "random",
        }
    }

    /// Unsanitized name for this scope. Pure given the identity.
    pub fn raw_name(&self, identity: &ProcessIdentity) -> String {
        match self {
            Scope::BinaryLocation => identity.exe_path.display().to_string(),
            Scope::BinaryName => identity.exe_name.clone(),
            Scope::ProcessId => identity.pid.to_string(),
            Scope::Random => identity.nonce.simple().to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = LocalDbError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s.trim())
            .ok_or_else(|| {
                LocalDbError::config(format!(
                    "unknown naming scope '{}' (expected one of: binary-location, binary-name, process-id, random)",
                    s
                ))
            })
    }
}

/// Process metadata the naming scopes draw from
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pub exe_path: PathBuf,
    pub exe_name: String,
    pub pid: u32,
    pub nonce: Uuid,
}

impl ProcessIdentity {
    /// Capture the identity of the running process
    pub fn current() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|e| LocalDbError::config(format!("cannot resolve executable path: {}", e)))?;
        let exe_name = exe_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| {
                LocalDbError::config(format!("executable path {:?} has no file name", exe_path))
            })?;

        Ok(Self {
            exe_path,
            exe_name,
            pid: std::process::id(),
            nonce: Uuid::new_v4(),
        })
    }
}

/// Sanitized name shared by the instance, database and backing files
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Derive the identifier for `scope`
    pub fn from_scope(scope: Scope, identity: &ProcessIdentity) -> Result<Self> {
        sanitize(&scope.raw_name(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replace everything outside `[A-Za-z0-9]` with `_`.
///
/// A leading digit gets an extra `_` in front so the result is a valid
/// regular identifier (first character a letter or underscore).
pub fn sanitize(raw: &str) -> Result<Identifier> {
    if raw.is_empty() {
        return Err(LocalDbError::config("cannot derive an identifier from an empty name"));
    }

    let replaced = NON_ALPHANUMERIC.replace_all(raw, "_");
    let name = if replaced.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", replaced)
    } else {
        replaced.into_owned()
    };

    Ok(Identifier(name))
}
