//! Command line definition for `vpngate`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

/// Bootstrap an OpenVPN gateway and manage its clients.
///
/// Configuration comes from `VPNGATE_*` environment variables, optionally
/// layered over the TOML file named by `VPNGATE_CONFIG`.
#[derive(Parser, Debug)]
#[command(author, version, about, after_help = "Examples:\n  vpngate\n  vpngate issue-client alice --output alice.ovpn\n  vpngate get-client alice > alice.ovpn\n  vpngate list-clients --json\n  vpngate status")]
pub struct Cli {
    /// Log level (overrides VPNGATE_LOG_LEVEL)
    #[arg(short, long, value_enum, global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Data directory (overrides VPNGATE_DATA_DIR)
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Defaults to `run`
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bootstrap the host, then start the tunnel server
    Run,
    /// Issue a certificate for a new client and print its profile
    IssueClient {
        /// Client name: letters, digits, '.', '_' and '-'
        name: String,

        /// Re-issue an existing client; the old certificate is retired
        #[arg(long)]
        force: bool,

        /// Write the profile to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print the profile of an already issued client
    GetClient {
        name: String,

        /// Write the profile to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List active clients
    ListClients {
        #[arg(long)]
        json: bool,
    },
    /// Show bootstrap and PKI state
    Status {
        #[arg(long)]
        json: bool,
    },
}
