//! Handoff to the tunnel server process once the host is prepared.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use shared_utils::config::HandoffMode;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed to wait for the tunnel server: {0}")]
    Wait(io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(io::Error),
}

/// Command line of the tunnel server.
#[derive(Debug, Clone)]
pub struct TunnelServer {
    program: PathBuf,
    workdir: PathBuf,
    args: Vec<OsString>,
}

impl TunnelServer {
    /// `<program> --cd <data_dir> --config <config_file>`
    pub fn openvpn(program: impl Into<PathBuf>, data_dir: &Path, config_file: &str) -> Self {
        Self {
            program: program.into(),
            workdir: data_dir.to_path_buf(),
            args: vec![
                "--cd".into(),
                data_dir.as_os_str().to_os_string(),
                "--config".into(),
                config_file.into(),
            ],
        }
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Hand control to the tunnel server. Returns the exit code to propagate.
    ///
    /// In exec mode this only returns on failure.
    pub async fn launch(&self, mode: HandoffMode) -> Result<i32, HandoffError> {
        match mode {
            HandoffMode::Supervise => self.supervise().await,
            HandoffMode::Exec => Err(self.exec()),
        }
    }

    fn exec(&self) -> HandoffError {
        info!(program = %self.program.display(), "replacing process with tunnel server");
        let source = std::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .exec();
        HandoffError::Spawn {
            program: self.program_name(),
            source,
        }
    }

    async fn supervise(&self) -> Result<i32, HandoffError> {
        let mut terminate = signal(SignalKind::terminate()).map_err(HandoffError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(HandoffError::Signal)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(HandoffError::Signal)?;

        let mut child = TokioCommand::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .spawn()
            .map_err(|source| HandoffError::Spawn {
                program: self.program_name(),
                source,
            })?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        info!(program = %self.program.display(), pid = ?pid, "started tunnel server");

        let status = loop {
            let forward = tokio::select! {
                status = child.wait() => break status.map_err(HandoffError::Wait)?,
                _ = terminate.recv() => Signal::SIGTERM,
                _ = interrupt.recv() => Signal::SIGINT,
                _ = hangup.recv() => Signal::SIGHUP,
            };
            debug!(signal = forward.as_str(), "forwarding signal to tunnel server");
            if let Some(pid) = pid {
                if let Err(err) = kill(pid, forward) {
                    warn!(signal = forward.as_str(), "failed to forward signal: {err}");
                }
            }
        };

        let code = exit_code(status);
        info!(code, "tunnel server exited");
        Ok(code)
    }
}

/// Shell convention: the exit code, or 128 plus the terminating signal.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}
