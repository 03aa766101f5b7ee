//! Configuration for transport-bench.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::stress::StressConfig;
use crate::transport::{TransportKind, TransportOptions};
use clap::Parser;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default bytes per read/write.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "transport-bench")]
#[command(version)]
#[command(about = "QUIC/TCP benchmark tool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen for connections on both transports and echo them
    #[arg(short = 's', long)]
    pub server: bool,

    /// Run the concurrent delivery stress harness against a local listener
    #[arg(long, conflicts_with = "server")]
    pub stress: bool,

    /// Use the reliable-datagram (QUIC) transport
    #[arg(long, conflicts_with = "tcp")]
    pub udt: bool,

    /// Use the stream (TCP) transport (default)
    #[arg(long)]
    pub tcp: bool,

    /// Transport by name: tcp, udt/quic
    #[arg(long, conflicts_with_all = ["udt", "tcp"])]
    pub transport: Option<String>,

    /// Verbose debugging to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Block size to send and receive
    #[arg(short = 'b', long = "bs")]
    pub block_size: Option<usize>,

    /// Stress: concurrent connections
    #[arg(long)]
    pub conns: Option<usize>,

    /// Stress: chunks written per connection
    #[arg(long)]
    pub loops: Option<usize>,

    /// Stress: bytes per chunk
    #[arg(long)]
    pub chunk: Option<usize>,

    /// Stress: size of the seeded source buffer
    #[arg(long)]
    pub source_len: Option<usize>,

    /// Stress: seed for the source buffer
    #[arg(long)]
    pub seed: Option<u64>,

    /// Dial timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error) when not verbose
    #[arg(long)]
    pub log_level: Option<String>,

    /// server: <udt address> <tcp address>; client: <remote address>;
    /// stress: <listen address>
    pub addresses: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub stress: StressFileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Transport name for client and stress mode
    pub transport: Option<String>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            transport: None,
        }
    }
}

/// Provider knobs; unset values use `TransportOptions::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct TransportConfig {
    pub connect_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub keep_alive_ms: Option<u64>,
    pub linger_ms: Option<u64>,
    pub nodelay: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StressFileConfig {
    pub connections: Option<usize>,
    pub iterations: Option<usize>,
    pub chunk_size: Option<usize>,
    pub source_len: Option<usize>,
    pub seed: Option<u64>,
    pub stall_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// What the process does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Echo on both transports.
    Listen { udt_addr: String, tcp_addr: String },
    /// Flood one connection.
    Dial { remote_addr: String },
    /// Stress harness listening on `listen_addr`.
    Stress { listen_addr: String },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Transport name as given, resolved by `transport_kind`.
    pub transport_name: Option<String>,
    pub block_size: NonZeroUsize,
    pub verbose: bool,
    pub log_level: String,
    pub transport: TransportOptions,
    pub stress: StressConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let mode = if cli.server {
            match cli.addresses.as_slice() {
                [udt_addr, tcp_addr, ..] => Mode::Listen {
                    udt_addr: udt_addr.clone(),
                    tcp_addr: tcp_addr.clone(),
                },
                _ => return Err(ConfigError::MissingAddress("<udt address> <tcp address>")),
            }
        } else if cli.stress {
            match cli.addresses.first() {
                Some(addr) => Mode::Stress {
                    listen_addr: addr.clone(),
                },
                None => return Err(ConfigError::MissingAddress("<listen address>")),
            }
        } else {
            match cli.addresses.first() {
                Some(addr) => Mode::Dial {
                    remote_addr: addr.clone(),
                },
                None => return Err(ConfigError::MissingAddress("<remote address>")),
            }
        };

        let transport_name = if cli.udt {
            Some("udt".to_string())
        } else if cli.tcp {
            Some("tcp".to_string())
        } else {
            cli.transport.or(toml_config.benchmark.transport)
        };

        let block_size = NonZeroUsize::new(cli.block_size.unwrap_or(toml_config.benchmark.block_size))
            .ok_or(ConfigError::InvalidBlockSize)?;

        let defaults = TransportOptions::default();
        let file = &toml_config.transport;
        let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);
        let transport = TransportOptions {
            connect_timeout: ms(
                cli.connect_timeout_ms.or(file.connect_timeout_ms),
                defaults.connect_timeout,
            ),
            idle_timeout: ms(file.idle_timeout_ms, defaults.idle_timeout),
            keep_alive: ms(file.keep_alive_ms, defaults.keep_alive),
            linger: ms(file.linger_ms, defaults.linger),
            nodelay: file.nodelay.unwrap_or(defaults.nodelay),
        };

        let stress_defaults = StressConfig::default();
        let file = &toml_config.stress;
        let stress = StressConfig {
            kind: TransportKind::default(),
            address: match &mode {
                Mode::Stress { listen_addr } => listen_addr.clone(),
                _ => stress_defaults.address.clone(),
            },
            connections: cli
                .conns
                .or(file.connections)
                .unwrap_or(stress_defaults.connections),
            iterations: cli
                .loops
                .or(file.iterations)
                .unwrap_or(stress_defaults.iterations),
            chunk_size: cli
                .chunk
                .or(file.chunk_size)
                .unwrap_or(stress_defaults.chunk_size),
            source_len: cli
                .source_len
                .or(file.source_len)
                .unwrap_or(stress_defaults.source_len),
            seed: cli.seed.or(file.seed).unwrap_or(stress_defaults.seed),
            stall_timeout: ms(file.stall_timeout_ms, stress_defaults.stall_timeout),
        };
        if matches!(mode, Mode::Stress { .. }) {
            stress
                .validate()
                .map_err(|e| ConfigError::InvalidStress(e.to_string()))?;
        }

        Ok(Config {
            mode,
            transport_name,
            block_size,
            verbose: cli.verbose,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            transport,
            stress,
        })
    }

    /// Transport for client and stress mode.
    ///
    /// No name means the default; an unrecognized name also resolves to the
    /// default, with a warning.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport_name
            .as_deref()
            .map(TransportKind::from_name)
            .unwrap_or_default()
    }

    /// Stress parameters with the selected transport filled in.
    pub fn stress_config(&self) -> StressConfig {
        StressConfig {
            kind: self.transport_kind(),
            ..self.stress.clone()
        }
    }

    /// Tracing filter directive implied by the verbosity settings.
    pub fn log_filter(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Short usage text printed when required addresses are missing.
pub fn usage(program: &str) -> String {
    format!(
        "transport-bench - QUIC/TCP benchmark tool

Usage:

  server:       {program} -s <udt address> <tcp address>
  benchmarker:  {program} [--udt | --tcp] <remote address>
  stress:       {program} --stress [--udt | --tcp] <listen address>

Address format is [host]:port
Run with --help for all options.
"
    )
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("block size must be greater than zero")]
    InvalidBlockSize,

    #[error("missing required argument(s): {0}")]
    MissingAddress(&'static str),

    #[error("{0}")]
    InvalidStress(String),
}
