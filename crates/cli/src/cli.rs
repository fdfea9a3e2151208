//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// scconv - radar scan conversion with network distribution
#[derive(Parser, Debug)]
#[command(
    name = "scconv",
    author,
    version,
    about = "Radar scan converter with network distribution",
    long_about = "Converts polar radar returns into raster windows and distributes them.\n\n\
                  Runs as a server feeding remote displays over TCP/UDP, as a display \n\
                  client, as a standalone simulation, or as a multicast sender."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SCCONV_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SCCONV_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve scan-converted windows to remote displays
    Serve(ServeArgs),

    /// Connect to a server (or multicast group) and render into a local bitmap
    Display(DisplayArgs),

    /// Run the simulated radar through a local converter
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),

    /// Listen for server heartbeats
    Heartbeats(HeartbeatsArgs),
}

/// Options shared by the long running commands
#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "scconv.toml", env = "SCCONV_CONFIG")]
    pub config: PathBuf,

    /// Stop after this many seconds (0 = run until Ctrl+C)
    #[arg(long, default_value = "0", env = "SCCONV_DURATION")]
    pub duration: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "SCCONV_METRICS_PORT")]
    pub metrics_port: u16,

    /// Seconds between progress reports (0 = none)
    #[arg(long, default_value = "5")]
    pub report_every: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub run: RunOptions,

    /// Override the address the command port binds to
    #[arg(long, env = "SCCONV_HOST")]
    pub host: Option<String>,

    /// Override the command port
    #[arg(long, env = "SCCONV_PORT")]
    pub port: Option<u16>,

    /// Also send the window to the configured multicast group
    #[arg(long)]
    pub mcast: bool,

    /// Do not start the simulated radar
    #[arg(long)]
    pub no_feed: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct DisplayArgs {
    #[command(flatten)]
    pub run: RunOptions,

    /// Server command endpoint, overrides the configuration
    #[arg(long, env = "SCCONV_SERVER")]
    pub server: Option<SocketAddr>,

    /// Window id requested from the server
    #[arg(long, default_value = "1")]
    pub window: u16,

    /// Receive from the configured multicast group instead of a server
    #[arg(long)]
    pub mcast: bool,

    /// Write a PNG of the bitmap on exit
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub run: RunOptions,

    /// Seed for the simulated noise
    #[arg(long, default_value = "24301")]
    pub seed: u64,

    /// Override the antenna rotation rate
    #[arg(long)]
    pub rpm: Option<f32>,

    /// Write a PNG of the bitmap on exit
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "scconv.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "scconv.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show scan conversion details (SSC, trails, zones)
    #[arg(long)]
    pub scan: bool,

    /// Show sink configuration
    #[arg(long)]
    pub sinks: bool,
}

#[derive(Parser, Debug)]
pub struct HeartbeatsArgs {
    /// Configuration supplying the heartbeat group and port
    #[arg(short, long, default_value = "scconv.toml")]
    pub config: PathBuf,

    /// Listen here instead of the configured group
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Stop after this many seconds (0 = run until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Seconds between peer table prints
    #[arg(long, default_value = "2")]
    pub every: u64,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::parse_from([
            "scconv", "-v", "serve", "--config", "radar.toml", "--port", "5000", "--mcast",
            "--duration", "10",
        ]);
        assert_eq!(cli.verbose, 1);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.run.config, PathBuf::from("radar.toml"));
        assert_eq!(args.port, Some(5000));
        assert_eq!(args.run.duration, 10);
        assert!(args.mcast);
        assert!(!args.no_feed);
    }

    #[test]
    fn display_server_address() {
        let cli = Cli::parse_from(["scconv", "display", "--server", "127.0.0.1:4377", "--window", "4"]);
        let Commands::Display(args) = cli.command else {
            panic!("expected display");
        };
        assert_eq!(args.server, Some("127.0.0.1:4377".parse().unwrap()));
        assert_eq!(args.window, 4);
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["scconv", "-q", "-v", "info"]).is_err());
    }
}
