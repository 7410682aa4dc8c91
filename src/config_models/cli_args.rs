use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::RangedI64ValueParser;
use clap::Parser;

use crate::codec::DEFAULT_MAX_FRAME_LENGTH_IN_BYTES;

/// Declarative specification of command-line arguments
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// The data directory that contains the peer directory.
    ///
    /// Defaults to the platform's data directory, e.g.
    /// `~/.local/share/circle-rendezvous` on Linux.
    #[clap(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// IP on which to listen for peer connections.
    #[clap(short, long, default_value = "127.0.0.1")]
    pub listen_addr: IpAddr,

    /// Port on which to listen for peer connections.
    #[clap(long, default_value = "9898")]
    pub port: u16,

    /// Maximum number of connections served concurrently. Further
    /// connections wait in the listen backlog until a slot frees up.
    #[clap(long, default_value = "10", value_parser(RangedI64ValueParser::<usize>::new().range(1..=1024)))]
    pub max_connections: usize,

    /// Seconds a connection may stay silent before it is closed.
    #[clap(long, default_value = "300")]
    pub idle_timeout: u64,

    /// Largest accepted message frame, in bytes.
    #[clap(long, default_value_t = DEFAULT_MAX_FRAME_LENGTH_IN_BYTES)]
    pub max_frame_length: usize,

    /// Do not send confirmations to peers whose announcement was accepted.
    #[clap(long)]
    pub no_confirmations: bool,
}

impl Args {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}
