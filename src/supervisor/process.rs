//! Worker process abstraction.
//!
//! The supervisor never touches OS process handles directly.  It asks a
//! [`WorkerLauncher`] for a [`WorkerHandle`] (stdio halves plus a
//! [`WorkerProcess`]) and later kills / waits through the trait.  Tests plug
//! in a launcher backed by `tokio::io::duplex`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;

use super::SupervisorError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkerProcess: Send {
    /// OS pid, if there is one.
    fn id(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    async fn kill(&mut self) -> std::io::Result<()>;

    /// Wait for exit; returns the exit code when the platform reports one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;
}

/// A started worker: its stdin (host → worker frames), its stdout
/// (worker → host frames) and the process itself.
pub struct WorkerHandle {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub process: Box<dyn WorkerProcess>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerHandle, SupervisorError>;
}

// ---------------------------------------------------------------------------
// CommandLauncher
// ---------------------------------------------------------------------------

/// Spawns the configured worker binary with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    config: WorkerConfig,
}

impl CommandLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self) -> Result<WorkerHandle, SupervisorError> {
        let program = &self.config.program;
        log::info!("supervisor: spawning {program} {:?}", self.config.args);

        let mut child = Command::new(program)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::info!(target: "worker", "{line}");
                }
            });
        }

        Ok(WorkerHandle {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.0.wait().await.map(|status| status.code())
    }
}
