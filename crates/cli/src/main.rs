//! # scconv
//!
//! 命令行接口入口点。
//!
//! 提供：
//! - 配置加载与验证
//! - 扫描变换服务器、显示客户端与本地模拟
//! - 心跳监听与优雅关闭

mod cli;
mod commands;
mod error;
mod session;

use anyhow::Result;
use clap::Parser;
use observability::ObservabilityConfig;
use tracing::info;

use cli::{Cli, Commands};
use commands::{run_display, run_heartbeats, run_info, run_serve, run_simulate, run_validate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging based on CLI options
    init_logging(&cli)?;

    info!(version = env!("CARGO_PKG_VERSION"), "scconv starting");

    // Execute command
    let result = match &cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Display(args) => run_display(args).await,
        Commands::Simulate(args) => run_simulate(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Info(args) => run_info(args),
        Commands::Heartbeats(args) => run_heartbeats(args).await,
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}

/// Initialize logging based on CLI options
fn init_logging(cli: &Cli) -> Result<()> {
    let default_log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let log_format = match cli.log_format {
        cli::LogFormat::Json => observability::LogFormat::Json,
        cli::LogFormat::Pretty => observability::LogFormat::Pretty,
        cli::LogFormat::Compact => observability::LogFormat::Compact,
    };

    // metrics exporters are started per command
    observability::init_with_config(ObservabilityConfig {
        log_format,
        metrics_port: None,
        default_log_level: default_log_level.to_string(),
    })
}
