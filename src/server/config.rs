//! Configuration types and constants for the drift server.

use std::path::PathBuf;

use clap::Parser;

/// Maximum accepted upload size for `POST /api/upload`.
pub(crate) const MAX_MEDIA_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB

/// A paired room with no traffic for this long is closed by the sweeper.
pub(crate) const IDLE_ROOM_SECS: u64 = 30 * 60;

/// How often the idle sweeper looks for stale rooms.
pub(crate) const IDLE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Interval of the hourly stats rollup.
pub(crate) const ROLLUP_INTERVAL_SECS: u64 = 3_600;

/// Anonymous pairwise chat server.
///
/// Clients connect over WebSocket at /ws, join a matchmaking queue, and are
/// paired for ephemeral one-on-one chats.  Admin endpoints expose live
/// counters, bans, and appeals.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "drift-server", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: DRIFT_BIND] [default: 127.0.0.1:4080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the database and uploaded media [env: DRIFT_DATA_DIR] [default: ~/.drift]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("DRIFT_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".drift"))
                    .unwrap_or_else(|_| PathBuf::from(".drift"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("DRIFT_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:4080".to_string());

        Self {
            bind_addr,
            data_dir,
        }
    }
}
