//! One SSH child with a dynamic SOCKS forward on a local port.
//!
//! The tunnel is considered up iff its local forward port accepts TCP
//! connections; state follows `idle → starting → up → down → starting`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::pty::PtyChild;
use crate::{EgressError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Remote endpoint, `user@host`.
    pub host: String,
    /// Local port for the dynamic forward.
    pub local_port: u16,
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
}

enum SpawnedChild {
    Plain(Child),
    Pty(PtyChild),
}

impl SpawnedChild {
    fn inner_mut(&mut self) -> &mut Child {
        match self {
            SpawnedChild::Plain(child) => child,
            SpawnedChild::Pty(pty) => pty.child_mut(),
        }
    }
}

pub struct SshTunnel {
    config: TunnelConfig,
    child: Option<SpawnedChild>,
    state: TunnelState,
    command: String,
}

impl SshTunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            child: None,
            state: TunnelState::Idle,
            command: String::new(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// The local SOCKS endpoint served by this tunnel.
    pub fn endpoint(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.config.local_port)
    }

    /// Launch the SSH child, terminating any previous one first. With
    /// `wait`, blocks until the forward port is listening or the timeout
    /// elapses.
    pub async fn start(&mut self, wait: bool, timeout: Duration) -> Result<()> {
        self.stop().await;
        info!(
            host = %self.config.host,
            port = self.config.local_port,
            "opening ssh connection"
        );
        self.spawn_child()?;
        if wait {
            self.wait_until_up(timeout).await?;
        }
        Ok(())
    }

    fn spawn_child(&mut self) -> Result<()> {
        let args = command_args(&self.config);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.command = format!("ssh {}", args.join(" "));
        debug!(command = %self.command, "spawning ssh");

        let spawned = if let Some(passphrase) = self.config.passphrase.clone() {
            let pty = PtyChild::spawn("ssh", &arg_refs)?;
            let io = pty.io();
            let label = self.endpoint();
            tokio::spawn(async move {
                // Exactly one passphrase write per child lifetime.
                match io.read_until(is_passphrase_prompt).await {
                    Ok(_) => {
                        if let Err(e) = io.write_line(&passphrase) {
                            warn!(error = %e, "failed to enter ssh key passphrase");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "ssh exited before prompting for a passphrase");
                    }
                }
                // Keep draining so the child never blocks on a full pty buffer.
                io.log_output(label).await;
            });
            SpawnedChild::Pty(pty)
        } else {
            let mut cmd = Command::new("ssh");
            cmd.args(&arg_refs)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            let mut child = cmd.spawn()?;
            stream_child_output(&mut child, self.endpoint());
            SpawnedChild::Plain(child)
        };

        self.child = Some(spawned);
        self.state = TunnelState::Starting;
        Ok(())
    }

    async fn wait_until_up(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_up().await {
                return Ok(());
            }
            if self.has_exited() {
                return Err(EgressError::SshProxy(format!(
                    "ssh exited before {} came up: {}",
                    self.endpoint(),
                    self.command
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EgressError::SshProxy(format!(
                    "timed out waiting for {}: {}",
                    self.endpoint(),
                    self.command
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Probe the forward port and update the tunnel state.
    pub async fn is_up(&mut self) -> bool {
        if self.child.is_none() {
            self.state = TunnelState::Idle;
            return false;
        }
        let up = probe_port(self.config.local_port).await;
        self.state = match (up, self.state) {
            (true, _) => TunnelState::Up,
            (false, TunnelState::Up | TunnelState::Down) => TunnelState::Down,
            (false, state) => state,
        };
        up
    }

    /// Whether the child has already terminated.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.inner_mut().try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Display form of the last spawned ssh command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Terminate the child (SIGTERM, then SIGKILL after a grace period).
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut spawned) = self.child.take() else {
            self.state = TunnelState::Idle;
            return;
        };
        let endpoint = self.endpoint();
        let child = spawned.inner_mut();
        send_sigterm(child);
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(endpoint = %endpoint, code = status.code(), "ssh stopped");
            }
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "ssh wait failed");
            }
            Err(_) => {
                warn!(endpoint = %endpoint, "ssh did not exit in time, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
        self.state = TunnelState::Idle;
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(endpoint = %self.endpoint(), "tunnel dropped without stop(), killing child");
        }
    }
}

/// TCP connect probe against the local forward port.
async fn probe_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn command_args(config: &TunnelConfig) -> Vec<String> {
    let mut args = vec![
        "-D".to_string(),
        config.local_port.to_string(),
        "-o".to_string(),
        "StrictHostKeychecking=no".to_string(),
    ];
    if let Some(key) = &config.key {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args.push(config.host.clone());
    args
}

/// The transcript looks like an ssh key passphrase prompt: it mentions
/// `pass` and ends with `": "`.
fn is_passphrase_prompt(transcript: &str) -> bool {
    transcript.contains("pass") && transcript.ends_with(": ")
}

fn stream_child_output(child: &mut Child, label: String) {
    if let Some(stdout) = child.stdout.take() {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(target: "ssh", tunnel = %label, "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(target: "ssh", tunnel = %label, "stderr: {line}");
                }
            }
        });
    }
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}
