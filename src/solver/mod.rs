//! External solver invocation.
//!
//! Each job gets a fresh working directory. The solver executable is copied
//! into it and run there with `-r 1 -c 1`; stdout and stderr go to
//! `solver.log` beside the inputs.

pub mod inputs;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::models::is_plain_file_name;

pub use inputs::write_inputs;

/// Directory the solver writes per-timestep surface maps into.
pub const SURFACE_MAPS_DIR: &str = "R1C1_SurfaceMaps";
/// Maximum depth table, inside [`SURFACE_MAPS_DIR`].
pub const MAX_DEPTH_FILE: &str = "R1_C1_max_depth.csv";
pub const LOG_FILE: &str = "solver.log";

// ETXTBSY: a freshly copied executable can still be open in a forked child.
const TEXT_FILE_BUSY: i32 = 26;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver executable not found: {0}")]
    NotFound(String),
    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// `code` is `None` when the process was killed by a signal.
    #[error("solver exited with code {code:?}")]
    Exited { code: Option<i32> },
    #[error("solver timed out after {0:?}")]
    TimedOut(Duration),
    #[error("solver produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Raw artifacts of a finished solver run.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub run_dir: PathBuf,
    pub surface_maps: PathBuf,
    pub max_depth: PathBuf,
}

impl SolverOutput {
    fn in_dir(run_dir: &Path) -> Self {
        let surface_maps = run_dir.join(SURFACE_MAPS_DIR);
        Self {
            run_dir: run_dir.to_path_buf(),
            max_depth: surface_maps.join(MAX_DEPTH_FILE),
            surface_maps,
        }
    }
}

/// Create an empty working directory `{run_path}/{slug}`, discarding any
/// leftovers from an earlier attempt.
///
/// `slug` must be a single ordinary path component; anything else would
/// point the cleanup at `run_path` itself or above it.
pub async fn prepare_run_dir(run_path: &Path, slug: &str) -> std::io::Result<PathBuf> {
    if !is_plain_file_name(slug) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing working directory name {:?}", slug),
        ));
    }
    let dir = run_path.join(slug);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => debug!("Removed stale working directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Runs the external solver in a working directory.
#[derive(Debug, Clone, Default)]
pub struct SolverInvoker {
    executable: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl SolverInvoker {
    pub fn new(executable: Option<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            executable,
            timeout,
        }
    }

    /// Whether a solver is configured at all.
    pub fn is_configured(&self) -> bool {
        self.executable.is_some()
    }

    /// Resolve the configured executable, searching `PATH` for bare names.
    pub fn resolve_executable(&self) -> Result<PathBuf, SolverError> {
        let configured = self
            .executable
            .as_ref()
            .ok_or_else(|| SolverError::NotFound("no solver configured".to_string()))?;

        if configured.components().count() > 1 || configured.is_absolute() {
            if configured.is_file() {
                return Ok(configured.clone());
            }
            return Err(SolverError::NotFound(configured.display().to_string()));
        }
        which::which(configured)
            .map_err(|_| SolverError::NotFound(configured.display().to_string()))
    }

    /// Run the solver in `run_dir` and locate its outputs.
    ///
    /// Nonzero exit, timeout and a missing output directory are all errors.
    pub async fn invoke(&self, job_id: &str, run_dir: &Path) -> Result<SolverOutput, SolverError> {
        let source = self.resolve_executable()?;
        let name = source
            .file_name()
            .ok_or_else(|| SolverError::NotFound(source.display().to_string()))?;
        let local = run_dir.join(name);
        tokio::fs::copy(&source, &local).await?;

        let log = std::fs::File::create(run_dir.join(LOG_FILE))?;
        let log_err = log.try_clone()?;

        info!(job_id, stage = "solve", executable = %source.display(), "Starting solver");
        let mut child = self.spawn(&local, run_dir, log, log_err).await?;

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(job_id, "Solver exceeded {:?}, killing", limit);
                    if let Err(e) = child.kill().await {
                        warn!(job_id, "Failed to kill solver: {}", e);
                    }
                    return Err(SolverError::TimedOut(limit));
                }
            },
            None => child.wait().await?,
        };

        if !status.success() {
            return Err(SolverError::Exited {
                code: status.code(),
            });
        }

        let output = SolverOutput::in_dir(run_dir);
        if !output.surface_maps.is_dir() {
            return Err(SolverError::MissingOutput(output.surface_maps));
        }
        info!(job_id, stage = "solve", "Solver finished");
        Ok(output)
    }

    async fn spawn(
        &self,
        program: &Path,
        run_dir: &Path,
        stdout: std::fs::File,
        stderr: std::fs::File,
    ) -> Result<tokio::process::Child, SolverError> {
        let (stdout, stderr) = (Stdio::from(stdout), Stdio::from(stderr));
        let mut command = Command::new(program);
        command
            .args(["-r", "1", "-c", "1"])
            .current_dir(run_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let mut attempts = 0;
        loop {
            match command.spawn() {
                Ok(child) => return Ok(child),
                Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
