use crate::cli::error::{CliError, CliResult};
use crate::cli::logging;
use crate::fetch::ArtifactFetcher;
use anyhow::Context;
use clap::Args;
use sdlora::model::{load_scheduler_config, save_scheduler_config, save_weights};
use sdlora::{fuse, load_weights, read_adapter, FusionOptions, FusionReport, ServingConfig};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::info;

#[derive(Args, Debug)]
pub struct FuseCommand {
    /// Base model identifier (directory, archive or URL)
    #[arg(short = 'b', long = "base-model", help = "Base model; defaults to the configured model_name")]
    pub base_model: Option<String>,

    /// LoRA adapter to fuse
    #[arg(short = 'a', long = "adapter", help = "LoRA adapter; defaults to the configured lora_model")]
    pub adapter: Option<String>,

    /// Output directory for the fused model
    #[arg(short = 'o', long = "output", help = "Directory the fused model is written to")]
    pub output: PathBuf,

    /// Blend strength of the adapter
    #[arg(short = 'm', long = "multiplier", help = "Adapter multiplier; defaults to lora_multiplier")]
    pub multiplier: Option<f64>,

    /// Force overwrite existing output directory
    #[arg(long = "force", help = "Overwrite an existing output directory")]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FusionMetadata {
    pub base_model: String,
    pub adapter: String,
    pub multiplier: f64,
    pub report: FusionReportSummary,
    pub fusion_time_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub sdlora_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FusionReportSummary {
    pub groups: usize,
    pub parameters_touched: usize,
    pub ignored_keys: Vec<String>,
}

impl From<&FusionReport> for FusionReportSummary {
    fn from(report: &FusionReport) -> Self {
        Self {
            groups: report.groups,
            parameters_touched: report.parameters_touched,
            ignored_keys: report.ignored_keys.clone(),
        }
    }
}

pub fn execute(cmd: FuseCommand, config: ServingConfig) -> CliResult<()> {
    info!("Fusing LoRA adapter into base model");

    let base_model = cmd.base_model.clone().unwrap_or_else(|| config.model_name.clone());
    let adapter_id = cmd
        .adapter
        .clone()
        .or_else(|| config.lora_model.clone())
        .ok_or_else(|| {
            CliError::InvalidArgument(
                "no adapter given; pass --adapter or set lora_model".to_string(),
            )
        })?;
    let multiplier = cmd.multiplier.unwrap_or(config.lora_multiplier);
    validate_command(&cmd, multiplier)?;

    let start_time = std::time::Instant::now();
    let fetcher = ArtifactFetcher::new(&config.cache_dir);
    let model_dir = fetcher.fetch(&base_model)?;
    let adapter_path = fetcher.fetch_adapter(&adapter_id)?;

    let device = config.device.device()?;
    let mut weights = load_weights(&model_dir, &device, config.precision.dtype())?;
    let adapter = read_adapter(&adapter_path, &device)?;

    let options = FusionOptions::with_multiplier(multiplier);
    let report = fuse(&mut weights, &adapter, &options)?;

    if cmd.output.exists() && cmd.force {
        fs::remove_dir_all(&cmd.output)
            .with_context(|| format!("Failed to clear {}", cmd.output.display()))?;
    }
    let written = save_weights(&weights, &cmd.output)?;
    save_scheduler_config(&load_scheduler_config(&model_dir)?, &cmd.output)?;

    let metadata = FusionMetadata {
        base_model,
        adapter: adapter_id,
        multiplier,
        report: FusionReportSummary::from(&report),
        fusion_time_ms: start_time.elapsed().as_millis() as u64,
        timestamp: chrono::Utc::now(),
        sdlora_version: crate::VERSION.to_string(),
    };
    let metadata_path = cmd.output.join("fusion.json");
    fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)
        .context("Failed to write fusion metadata")?;

    for ignored in &report.ignored_keys {
        logging::warning(&format!("Ignored adapter tensor {}", ignored));
    }
    logging::success(&format!(
        "Fused {} layers ({} weights updated) into {} files under {}",
        report.groups,
        report.parameters_touched,
        written.len(),
        cmd.output.display()
    ));
    Ok(())
}

fn validate_command(cmd: &FuseCommand, multiplier: f64) -> CliResult<()> {
    if cmd.output.exists() && !cmd.force {
        return Err(CliError::FileExists(cmd.output.clone()));
    }

    if !multiplier.is_finite() {
        return Err(CliError::InvalidArgument(format!(
            "Multiplier must be finite, got: {}",
            multiplier
        )));
    }

    Ok(())
}
