//! `bw` CLI implementation of [`CliRunner`]
//!
//! This wraps the Bitwarden command-line tool, handling subprocess
//! execution, timeouts and the long-lived `bw serve` child.
//!
//! SECURITY NOTE: tokio::process::Command executes the binary directly
//! without shell interpolation. Secrets never appear in log lines: argument
//! vectors are logged through `Invocation::display_args`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{BackendError, CliRunner, CommandOutput, HelperChild, Invocation};
use crate::config::CliConfig;
use crate::session::SessionKey;

/// Runner that shells out to the real `bw` binary
pub struct BwCli {
    /// Path or name of the binary
    binary: PathBuf,
}

impl BwCli {
    pub fn new(config: &CliConfig) -> Self {
        Self {
            binary: config.binary.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CliRunner for BwCli {
    fn process_name(&self) -> String {
        self.binary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bw".to_string())
    }

    fn locate(&self) -> Option<PathBuf> {
        resolve_binary(&self.binary)
    }

    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, BackendError> {
        let mut cmd = self.command();
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value.expose_secret());
        }

        tracing::debug!(
            binary = %self.binary.display(),
            args = ?invocation.display_args(),
            "executing bw command"
        );

        let child = cmd.spawn()?;

        // On timeout the child is dropped and killed via kill_on_drop.
        match timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: invocation.scrub(String::from_utf8_lossy(&output.stderr).trim()),
            }),
            Ok(Err(e)) => Err(BackendError::Io(e)),
            Err(_) => Err(BackendError::Timeout {
                timeout_secs: invocation.timeout.as_secs(),
            }),
        }
    }

    async fn spawn_serve(
        &self,
        session_key: &SessionKey,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn HelperChild>, BackendError> {
        let port_arg = port.to_string();
        let mut cmd = self.command();
        cmd.args(["serve", "--hostname", host, "--port", &port_arg, "--session"])
            .arg(session_key.expose());

        tracing::info!(
            binary = %self.binary.display(),
            host = host,
            port = port,
            "starting bw serve"
        );

        let mut child = cmd.spawn()?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain_lines(stderr, "stderr"));
        }

        Ok(Box::new(ServeChild { child, readers }))
    }
}

/// Forward a helper output stream to the log, line by line.
fn drain_lines<R>(stream: R, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(stream = name, line = %line, "bw serve output"),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "bw serve output closed");
                    break;
                }
            }
        }
    })
}

/// The running `bw serve` process
struct ServeChild {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl ServeChild {
    fn stop_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

#[async_trait]
impl HelperChild for ServeChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), BackendError> {
        if !self.is_alive() {
            self.stop_readers();
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: plain signal delivery to a pid we spawned and still own.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc == 0 {
                    if let Ok(status) = timeout(grace, self.child.wait()).await {
                        tracing::debug!(status = ?status, "bw serve exited");
                        self.stop_readers();
                        return Ok(());
                    }
                    tracing::warn!(grace_secs = grace.as_secs(), "bw serve ignored SIGTERM, killing");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.kill().await
    }

    async fn kill(&mut self) -> Result<(), BackendError> {
        let result = self.child.kill().await;
        self.stop_readers();
        match result {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}

impl Drop for ServeChild {
    fn drop(&mut self) {
        self.stop_readers();
    }
}

/// Resolve `binary` against `PATH` the way the shell would.
pub(crate) fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates(&dir, binary))
        .find(|candidate| candidate.is_file())
}

fn candidates(dir: &Path, binary: &Path) -> Vec<PathBuf> {
    let plain = dir.join(binary);
    if cfg!(windows) && binary.extension().is_none() {
        vec![plain.with_extension("exe"), plain.with_extension("cmd"), plain]
    } else {
        vec![plain]
    }
}
