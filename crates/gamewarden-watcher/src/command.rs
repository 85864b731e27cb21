//! Process specification and executable resolution.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Launch error.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Working directory does not exist: {0}")]
    WorkingDir(PathBuf),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Process is already running")]
    AlreadyRunning,
    #[error("No process is running")]
    NotRunning,
    #[error("Spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What to launch: executable, working directory and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub exec: String,
    /// Working directory. Defaults to the executable's directory.
    pub dir: Option<PathBuf>,
    pub params: Vec<String>,
}

impl ProcessSpec {
    /// Create a spec with no parameters.
    #[must_use]
    pub fn new<S: Into<String>>(exec: S) -> Self {
        Self {
            exec: exec.into(),
            dir: None,
            params: Vec::new(),
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Append parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Append parameters given as a single shell-quoted line.
    ///
    /// # Errors
    /// Returns error if the line has unbalanced quotes.
    pub fn param_line(self, line: &str) -> Result<Self, LaunchError> {
        let parts = shlex::split(line).ok_or_else(|| LaunchError::InvalidParams(line.to_string()))?;
        Ok(self.params(parts))
    }

    /// Resolve the executable and working directory.
    ///
    /// Done on every launch, so a binary removed between restarts is
    /// reported instead of retried.
    ///
    /// # Errors
    /// Returns error if the executable or the working directory is missing.
    pub async fn resolve(&self) -> Result<ResolvedCommand, LaunchError> {
        let program = resolve_executable_path(&self.exec)
            .await
            .ok_or_else(|| LaunchError::ExecutableNotFound(self.exec.clone()))?;

        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => program
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        if !dir.is_dir() {
            return Err(LaunchError::WorkingDir(dir));
        }

        Ok(ResolvedCommand {
            program,
            dir,
            args: self.params.clone(),
        })
    }
}

/// A spec with its executable and directory resolved.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub dir: PathBuf,
    pub args: Vec<String>,
}

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) must point at a
/// file; bare names are looked up on `PATH` via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
