use crate::cli::error::CliResult;
use colored::*;
use sdlora::ServingConfig;
use std::path::Path;

/// Effective configuration: defaults, optional file, `SDLORA_*` environment
pub fn load_config(path: Option<&Path>) -> CliResult<ServingConfig> {
    Ok(ServingConfig::load(path)?)
}

pub fn show_config(config: &ServingConfig, json: bool) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("{}", "Serving configuration".bold());
    let value = serde_json::to_value(config)?;
    if let serde_json::Value::Object(fields) = value {
        for (key, value) in fields {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            println!("  {:<24} {}", key.cyan(), rendered);
        }
    }

    let limits = config.limits();
    println!(
        "  {:<24} steps [{}, {}], height [{}, {}], width [{}, {}], count [{}, {}]",
        "request limits".cyan(),
        limits.steps.min,
        limits.steps.max,
        limits.height.min,
        limits.height.max,
        limits.width.min,
        limits.width.max,
        limits.count.min,
        limits.count.max
    );
    println!("  {:<24} {}", "default output".cyan(), config.default_output_uri());
    Ok(())
}
