//! Minimal pseudoterminal plumbing for driving interactive children.
//!
//! `ssh` insists on reading key passphrases from its controlling terminal,
//! so the child is given a pty slave as stdio and made a session leader; a
//! session leader acquires the first tty it opens as its controlling
//! terminal, which avoids any raw ioctl.

use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::process::Stdio;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use tokio::process::{Child, Command};
use tracing::debug;

/// A child process attached to a fresh pty.
pub struct PtyChild {
    child: Child,
    io: PtyIo,
}

/// Cloneable handle to the pty master side.
#[derive(Clone)]
pub struct PtyIo {
    master: Arc<File>,
}

impl PtyChild {
    /// Spawn `program` with the slave side of a new pty as stdin, stdout and
    /// stderr, and with the pty as its controlling terminal.
    pub fn spawn(program: &str, args: &[&str]) -> io::Result<PtyChild> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(io::Error::from)?;
        grantpt(&master).map_err(io::Error::from)?;
        unlockpt(&master).map_err(io::Error::from)?;
        let slave_path = ptsname_r(&master).map_err(io::Error::from)?;

        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&slave_path)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);
        let child_tty = slave_path.clone();
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(io::Error::from)?;
                // First tty opened by a session leader becomes its
                // controlling terminal.
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&child_tty)?;
                Ok(())
            });
        }
        let child = cmd.spawn()?;

        // SAFETY: the raw fd is owned by `master` and transferred exactly once.
        let master_file = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        Ok(PtyChild {
            child,
            io: PtyIo {
                master: Arc::new(master_file),
            },
        })
    }

    pub fn io(&self) -> PtyIo {
        self.io.clone()
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

impl PtyIo {
    /// Accumulate child output until `matched` returns true for the
    /// transcript so far. Errors with `UnexpectedEof` if the pty closes
    /// first. Callers bound the wait with a timeout.
    pub async fn read_until<F>(&self, matched: F) -> io::Result<String>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let master = Arc::clone(&self.master);
        tokio::task::spawn_blocking(move || {
            let mut transcript = String::new();
            let mut buf = [0u8; 256];
            loop {
                let n = (&*master).read(&mut buf)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pty closed before match",
                    ));
                }
                transcript.push_str(&String::from_utf8_lossy(buf.get(..n).unwrap_or_default()));
                if matched(&transcript) {
                    return Ok(transcript);
                }
            }
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Write `line` followed by a newline to the child's terminal.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut master = &*self.master;
        master.write_all(line.as_bytes())?;
        master.write_all(b"\n")?;
        master.flush()
    }

    /// Stream the remaining pty output into the log, one line per record,
    /// until the pty closes.
    pub async fn log_output(&self, label: String) {
        let master = Arc::clone(&self.master);
        let _ = tokio::task::spawn_blocking(move || {
            let reader = io::BufReader::new(&*master);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        let line = line.trim_end_matches('\r');
                        if !line.is_empty() {
                            debug!(target: "ssh", tunnel = %label, "{line}");
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pty_round_trip() {
        let mut child = PtyChild::spawn("cat", &[]).unwrap();
        let io = child.io();
        io.write_line("hello-pty").unwrap();
        let transcript = tokio::time::timeout(
            Duration::from_secs(5),
            io.read_until(|s| s.contains("hello-pty")),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(transcript.contains("hello-pty"));
        child.child_mut().start_kill().unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn read_until_reports_eof_on_child_exit() {
        let mut child = PtyChild::spawn("true", &[]).unwrap();
        let io = child.io();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            io.read_until(|s| s.contains("never-printed")),
        )
        .await
        .unwrap();
        assert!(result.is_err());
        let _ = child.wait().await;
    }
}
