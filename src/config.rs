//! Configuration module for lossy-pingpong.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::policy::{ImpairmentPolicy, ProbeSchedule};
use crate::registry::ClientIdPolicy;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "lossy-pingpong")]
#[command(author = "lossy-pingpong authors")]
#[command(version = "0.1.0")]
#[command(about = "Ping/pong over TCP with simulated loss and keepalives", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for server.log and client_<id>.log
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Accept clients, answer probes and broadcast keepalives
    Server {
        /// Address to bind to (e.g., 127.0.0.1:8888)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Probability of silently ignoring a request
        #[arg(long)]
        drop_probability: Option<f64>,

        /// Seed for drop and delay decisions
        #[arg(long)]
        seed: Option<u64>,

        /// How client ids are assigned
        #[arg(long, value_enum)]
        client_ids: Option<ClientIdPolicy>,
    },
    /// Connect to the server and send probes
    Client {
        /// Numeric client id, used for the journal file name
        #[arg(default_value_t = 1)]
        client_id: u64,

        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Seed for probe pacing
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Start one server and several clients, run for a while, stop them
    Launch {
        /// Number of client processes
        #[arg(short = 'n', long)]
        clients: Option<u64>,

        /// Run time in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Keepalive broadcast period in milliseconds
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// How long a keepalive may wait on one slow client
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub client_ids: ClientIdPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            client_ids: ClientIdPolicy::default(),
        }
    }
}

/// Drop and delay simulation
#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_drop_probability")]
    pub drop_probability: f64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            drop_probability: default_drop_probability(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            seed: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to
    #[serde(default = "default_listen")]
    pub server: String,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    pub seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            seed: None,
        }
    }
}

/// Launcher configuration
#[derive(Debug, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_clients")]
    pub clients: u64,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            duration_secs: default_duration_secs(),
            startup_delay_ms: default_startup_delay_ms(),
            stagger_ms: default_stagger_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Journal directory
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_keepalive_interval_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_drop_probability() -> f64 {
    0.10
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_min_interval_ms() -> u64 {
    300
}

fn default_max_interval_ms() -> u64 {
    3000
}

fn default_clients() -> u64 {
    2
}

fn default_duration_secs() -> u64 {
    300 // 5 minutes
}

fn default_startup_delay_ms() -> u64 {
    1000
}

fn default_stagger_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Which role this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client { client_id: u64 },
    Launch,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub max_connections: usize,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    pub client_ids: ClientIdPolicy,
    pub impairment: ImpairmentPolicy,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server: String,
    pub schedule: ProbeSchedule,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub clients: u64,
    pub duration: Duration,
    pub startup_delay: Duration,
    pub stagger: Duration,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub config_path: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub launch: LaunchSettings,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let TomlConfig {
            server,
            simulation,
            client,
            launch,
            logging,
        } = toml_config;

        let mut config = Config {
            mode: Mode::Server,
            config_path: cli.config,
            log_dir: cli.log_dir.unwrap_or(logging.dir),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
            server: ServerSettings {
                listen: server.listen,
                max_connections: server.max_connections,
                keepalive_interval: Duration::from_millis(server.keepalive_interval_ms),
                write_timeout: Duration::from_millis(server.write_timeout_ms),
                client_ids: server.client_ids,
                impairment: ImpairmentPolicy {
                    drop_probability: simulation.drop_probability,
                    delay_min: Duration::from_millis(simulation.min_delay_ms),
                    delay_max: Duration::from_millis(simulation.max_delay_ms),
                },
                seed: simulation.seed,
            },
            client: ClientSettings {
                server: client.server,
                schedule: ProbeSchedule {
                    min: Duration::from_millis(client.min_interval_ms),
                    max: Duration::from_millis(client.max_interval_ms),
                },
                seed: client.seed,
            },
            launch: LaunchSettings {
                clients: launch.clients,
                duration: Duration::from_secs(launch.duration_secs),
                startup_delay: Duration::from_millis(launch.startup_delay_ms),
                stagger: Duration::from_millis(launch.stagger_ms),
            },
        };

        // Merge the subcommand's flags
        match cli.mode {
            ModeArgs::Server {
                listen,
                drop_probability,
                seed,
                client_ids,
            } => {
                let settings = &mut config.server;
                if let Some(listen) = listen {
                    settings.listen = listen;
                }
                if let Some(p) = drop_probability {
                    settings.impairment.drop_probability = p;
                }
                settings.seed = seed.or(settings.seed);
                if let Some(policy) = client_ids {
                    settings.client_ids = policy;
                }
            }
            ModeArgs::Client {
                client_id,
                server,
                seed,
            } => {
                config.mode = Mode::Client { client_id };
                if let Some(server) = server {
                    config.client.server = server;
                }
                config.client.seed = seed.or(config.client.seed);
            }
            ModeArgs::Launch { clients, duration } => {
                config.mode = Mode::Launch;
                if let Some(clients) = clients {
                    config.launch.clients = clients;
                }
                if let Some(secs) = duration {
                    config.launch.duration = Duration::from_secs(secs);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let p = self.server.impairment.drop_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::Invalid(format!(
                "drop probability {p} is outside [0, 1]"
            )));
        }
        if self.server.impairment.delay_min > self.server.impairment.delay_max {
            return Err(ConfigError::Invalid(
                "min_delay_ms is greater than max_delay_ms".to_string(),
            ));
        }
        if self.client.schedule.min > self.client.schedule.max {
            return Err(ConfigError::Invalid(
                "min_interval_ms is greater than max_interval_ms".to_string(),
            ));
        }
        if self.server.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.server.write_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "write_timeout_ms must be positive".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
