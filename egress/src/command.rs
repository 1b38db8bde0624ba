use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl CommandError {
    /// Whether the failure looks like a privilege problem rather than a bad
    /// invocation (kernel returned EPERM/EACCES through the tool's stderr).
    pub fn is_permission_denied(&self) -> bool {
        let detail = self.detail.to_ascii_lowercase();
        detail.contains("permission denied") || detail.contains("operation not permitted")
    }
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    /// Prefix with `sudo` unless the effective uid is already root.
    Elevated,
    /// Run as the current user.
    User,
}

/// Whether the current process runs with euid 0.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Resolve the argv to actually execute, inserting `sudo` when needed.
fn build_argv<'a>(program: &'a str, args: &[&'a str], privilege: Privilege) -> Vec<&'a str> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Elevated) && !is_root() {
        argv.push("sudo");
    }
    argv.push(program);
    argv.extend_from_slice(args);
    argv
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let argv = build_argv(program, args, privilege);
    let cmd_display = argv.join(" ");
    trace!(command = %cmd_display, "exec");

    let Some((head, tail)) = argv.split_first() else {
        return Err(CommandError {
            command: cmd_display,
            detail: "empty command".to_string(),
        });
    };
    let output = Command::new(head)
        .args(tail)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    if let Err(e) = exec(program, args, privilege).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

/// Synchronous best-effort execution for drop guards, where no runtime is
/// guaranteed to be available. Errors are discarded.
pub(crate) fn exec_blocking_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    let argv = build_argv(program, args, privilege);
    if let Some((head, tail)) = argv.split_first() {
        let _ = std::process::Command::new(head)
            .args(tail)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
}
