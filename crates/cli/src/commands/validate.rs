//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{FadeType, ScBlueprint};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    window: String,
    command_port: u16,
    multicast: bool,
    target_count: usize,
    sink_count: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            let win = blueprint.scan.window;
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    window: format!("{}x{}+{}+{}", win.w, win.h, win.x, win.y),
                    command_port: blueprint.net.command_port,
                    multicast: blueprint.mcast.is_some(),
                    target_count: blueprint.feed.targets.len(),
                    sink_count: blueprint.sinks.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Non-fatal issues
fn collect_warnings(blueprint: &ScBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();
    let scan = &blueprint.scan;

    if blueprint.feed.targets.is_empty() && blueprint.feed.noise_level == 0 {
        warnings.push("Simulated feed has no targets and no noise - windows stay blank".to_string());
    }

    if scan.pim_azimuths < blueprint.feed.azimuths_per_rev {
        warnings.push(format!(
            "scan.pim_azimuths ({}) is below the feed's {} azimuths per revolution - returns will be merged",
            scan.pim_azimuths, blueprint.feed.azimuths_per_rev
        ));
    }

    if scan.fade.fade_type == FadeType::Sweep && blueprint.feed.rpm <= 0.0 {
        warnings.push("Sweep fade needs a rotating feed to measure the revolution period".to_string());
    }

    if scan.true_trails.dimension > 0 && scan.true_trails.ranges.is_empty() {
        warnings.push("scan.true_trails.dimension is set but no trail ranges are configured".to_string());
    }

    if scan.ssc.enabled && scan.ssc.window_threshold == 0 {
        warnings.push("scan.ssc.window_threshold is 0 - every sample passes correlation".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Window: {}", summary.window);
            println!("  Command port: {}", summary.command_port);
            println!("  Multicast: {}", if summary.multicast { "yes" } else { "no" });
            println!("  Targets: {}", summary.target_count);
            println!("  Sinks: {}", summary.sink_count);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
