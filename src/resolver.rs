//! Locating the worker runtime executable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::BridgeError;
use crate::process::WorkerCommand;

pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, program: &str) -> Result<PathBuf, BridgeError>;
}

/// Resolves bare program names against `PATH`. On Windows every `PATHEXT`
/// extension is tried as well.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    search_path: Option<OsString>,
    extensions: Vec<String>,
}

impl PathResolver {
    pub fn from_env() -> Self {
        let extensions = if cfg!(windows) {
            std::env::var("PATHEXT")
                .unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string())
                .split(';')
                .map(str::trim)
                .filter(|ext| !ext.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        } else {
            Vec::new()
        };
        Self {
            search_path: std::env::var_os("PATH"),
            extensions,
        }
    }

    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
            extensions: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn candidates(&self, dir: &Path, program: &str) -> Vec<PathBuf> {
        let mut out = vec![dir.join(program)];
        let has_extension = Path::new(program).extension().is_some();
        if !has_extension {
            out.extend(
                self.extensions
                    .iter()
                    .map(|ext| dir.join(format!("{program}{ext}"))),
            );
        }
        out
    }
}

impl ExecutableResolver for PathResolver {
    fn resolve(&self, program: &str) -> Result<PathBuf, BridgeError> {
        if program.contains('/') || program.contains('\\') {
            let path = PathBuf::from(program);
            return if is_executable(&path) {
                Ok(path)
            } else {
                Err(BridgeError::ExecutableNotFound(program.to_string()))
            };
        }

        let search_path = self.search_path.clone().unwrap_or_default();
        std::env::split_paths(&search_path)
            .flat_map(|dir| self.candidates(&dir, program))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| BridgeError::ExecutableNotFound(program.to_string()))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Split a shell-style worker command line into program and arguments.
pub fn parse_worker_command(raw: &str) -> Result<(String, Vec<String>), BridgeError> {
    let mut parts = shlex::split(raw)
        .ok_or_else(|| BridgeError::InvalidCommand(format!("unbalanced quoting in '{raw}'")))?;
    if parts.is_empty() {
        return Err(BridgeError::InvalidCommand("worker command is empty".into()));
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Parse `raw` and resolve its program, producing a launchable command.
pub fn resolve_worker_command(
    resolver: &dyn ExecutableResolver,
    raw: &str,
    env: Vec<(String, String)>,
) -> Result<WorkerCommand, BridgeError> {
    let (program, args) = parse_worker_command(raw)?;
    let program = resolver.resolve(&program)?;
    Ok(WorkerCommand { program, args, env })
}
