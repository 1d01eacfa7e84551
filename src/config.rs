use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use codec::PeerId;
use serde::Deserialize;

/// A statically configured neighbour.
///
/// Peer discovery and identity exchange are a separate concern; the node
/// talks to the peers it is given.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Peer {
    ///
    /// The peer's 512-bit identity hash, hex encoded.
    ///
    pub id: PeerId,
    ///
    /// Where the peer's datagram transport listens.
    ///
    pub address: SocketAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// The address and port the peer-to-peer datagram socket binds to.
    ///
    #[serde(default = "Network::listen")]
    pub listen: SocketAddr,
    ///
    /// Maximum datagram payload. Spare room below this is filled with
    /// pending queries and migrating content.
    ///
    #[serde(default = "Network::mtu")]
    pub mtu: usize,
    ///
    /// Number of receive threads.
    ///
    #[serde(default = "Network::max_threads")]
    pub max_threads: usize,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Network {
    fn listen() -> SocketAddr {
        "0.0.0.0:2086".parse().unwrap()
    }

    fn mtu() -> usize {
        1472
    }

    fn max_threads() -> usize {
        num_cpus::get().min(4)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            mtu: Self::mtu(),
            max_threads: Self::max_threads(),
            peers: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Client {
    ///
    /// Where local clients connect. Loopback only; the client protocol
    /// carries no authentication.
    ///
    #[serde(default = "Client::listen")]
    pub listen: SocketAddr,
}

impl Client {
    fn listen() -> SocketAddr {
        "127.0.0.1:2087".parse().unwrap()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Routing {
    ///
    /// Indirection table size; must be a power of two, minimum 1024.
    /// Larger tables improve both anonymity and download speed at the
    /// cost of memory.
    ///
    #[serde(default = "Routing::table_size")]
    pub table_size: usize,
    ///
    /// On a repeated outbound query, keep the transmit bitmap with
    /// probability 1/N instead of re-broadcasting. Historical values
    /// ranged from 64 down to 4.
    ///
    #[serde(default = "Routing::bitmap_keep_chance")]
    pub bitmap_keep_chance: u32,
    ///
    /// Hard CPU limit in percent; queries are dropped silently above it.
    /// Zero disables the check.
    ///
    #[serde(default)]
    pub hard_cpu_limit: u32,
    ///
    /// Hard upload limit in percent; same drop behaviour.
    ///
    #[serde(default)]
    pub hard_upload_limit: u32,
}

impl Routing {
    fn table_size() -> usize {
        1024
    }

    fn bitmap_keep_chance() -> u32 {
        4
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            table_size: Self::table_size(),
            bitmap_keep_chance: Self::bitmap_keep_chance(),
            hard_cpu_limit: 0,
            hard_upload_limit: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// This node's 512-bit identity hash, hex encoded. A random identity
    /// is generated when omitted.
    ///
    #[serde(default)]
    pub identity: Option<PeerId>,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub client: Client,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: gap-server --config /etc/gap/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is
    /// read from the configuration file, otherwise the default
    /// configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
