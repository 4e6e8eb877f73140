//! Command-line interface for the lanes server.
//!
//! Every option overrides the matching value of the configuration file.

use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the network kind
    pub network: Option<String>,
    /// Optional override for the listen address
    pub listen: Option<String>,
    /// Optional override for the shard count
    pub cores: Option<usize>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Whether to force production mode
    pub prod: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(command().get_matches())
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("lanes.toml")),
            network: matches.get_one::<String>("network").cloned(),
            listen: matches.get_one::<String>("listen").cloned(),
            cores: matches.get_one::<usize>("cores").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            prod: matches.get_flag("prod"),
        }
    }
}

fn command() -> Command {
    Command::new("lanes")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sharded dispatch server for multiplayer game backends")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .value_parser(value_parser!(PathBuf))
                .default_value("lanes.toml"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("KIND")
                .help("Network kind (tcp, tcp4, tcp6, unix, udp, udp4, udp6, quic, websocket, http)"),
        )
        .arg(
            Arg::new("listen")
                .short('b')
                .long("listen")
                .value_name("ADDRESS")
                .help("Listen address (e.g. :9000, 127.0.0.1:9000, :9000/ws)"),
        )
        .arg(
            Arg::new("cores")
                .long("cores")
                .value_name("N")
                .help("Number of dispatch shards")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("prod")
                .long("prod")
                .help("Production mode: no banner, no per-connection logs")
                .action(ArgAction::SetTrue),
        )
}
