use std::fmt;
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

use spray::socks::Credentials;
use spray::{ServeOptions, ssh, subnet};

/// Timestamps log lines with time elapsed since startup.
struct Uptime(Instant);

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let elapsed = self.0.elapsed();
        write!(
            w,
            "[{:02}:{:02}.{:03}]",
            elapsed.as_secs() / 60,
            elapsed.as_secs() % 60,
            elapsed.subsec_millis()
        )
    }
}

#[derive(Parser)]
#[command(
    name = "spray",
    version,
    about = "Round-robin outbound connections across subnet addresses or SSH tunnels behind one SOCKS5 endpoint"
)]
struct Cli {
    /// Port for the SOCKS server to listen on
    #[arg(short, long, default_value_t = 1080)]
    port: u16,
    /// Listen address for the SOCKS server
    #[arg(short, long, default_value = "127.0.0.1")]
    listen_address: IpAddr,
    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
    /// Username clients must present (RFC 1929)
    #[arg(long, requires = "password")]
    username: Option<String>,
    /// Password clients must present (RFC 1929)
    #[arg(long, requires = "username")]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send each session from a different address within a subnet
    Subnet(subnet::SubnetArgs),
    /// Round-robin sessions across SSH tunnels
    Ssh(ssh::SshArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::WARN
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(Uptime(Instant::now()))
        .init();

    // Both empty means no-auth only.
    let credentials = match (cli.username, cli.password) {
        (Some(username), Some(password)) if !username.is_empty() || !password.is_empty() => {
            Some(Credentials { username, password })
        }
        _ => None,
    };
    let options = ServeOptions {
        listen_address: cli.listen_address,
        port: cli.port,
        credentials,
    };

    let result = match cli.command {
        Command::Subnet(args) => subnet::run_subnet(options, args).await,
        Command::Ssh(args) => ssh::run_ssh(options, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            ExitCode::FAILURE
        }
    }
}
