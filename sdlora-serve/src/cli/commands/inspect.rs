use crate::cli::error::CliResult;
use crate::fetch::ArtifactFetcher;
use clap::Args;
use colored::*;
use sdlora::lora::FusionPlan;
use sdlora::{load_weights, read_adapter, ServingConfig};
use serde::Serialize;
use tracing::info;

#[derive(Args, Debug)]
pub struct InspectCommand {
    /// LoRA adapter to inspect
    #[arg(short = 'a', long = "adapter", help = "LoRA adapter; defaults to the configured lora_model")]
    pub adapter: Option<String>,

    /// Base model the adapter is resolved against
    #[arg(short = 'b', long = "base-model", help = "Base model; defaults to the configured model_name")]
    pub base_model: Option<String>,
}

/// One planned update, as printed
#[derive(Debug, Serialize)]
pub struct PlanEntry {
    pub layer: String,
    pub component: String,
    pub module_path: String,
    pub rank: usize,
    pub alpha: Option<f64>,
    pub scale: f64,
    pub up_shape: Vec<usize>,
    pub down_shape: Vec<usize>,
}

pub fn execute(cmd: InspectCommand, config: ServingConfig, json: bool) -> CliResult<()> {
    let base_model = cmd.base_model.unwrap_or_else(|| config.model_name.clone());
    let adapter_id = cmd.adapter.or_else(|| config.lora_model.clone()).ok_or_else(|| {
        crate::cli::error::CliError::InvalidArgument(
            "no adapter given; pass --adapter or set lora_model".to_string(),
        )
    })?;

    let fetcher = ArtifactFetcher::new(&config.cache_dir);
    let model_dir = fetcher.fetch(&base_model)?;
    let adapter_path = fetcher.fetch_adapter(&adapter_id)?;
    info!("Resolving {} against {}", adapter_path.display(), model_dir.display());

    let device = config.device.device()?;
    let weights = load_weights(&model_dir, &device, config.precision.dtype())?;
    let adapter = read_adapter(&adapter_path, &device)?;
    let plan = FusionPlan::build(&weights, &adapter, config.lora_multiplier)?;

    let entries: Vec<PlanEntry> = plan
        .updates()
        .iter()
        .map(|update| PlanEntry {
            layer: update.layer.clone(),
            component: update.target.component.to_string(),
            module_path: update.target.module_path.clone(),
            rank: update.rank(),
            alpha: update.alpha,
            scale: update.scale(),
            up_shape: update.up.dims().to_vec(),
            down_shape: update.down.dims().to_vec(),
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "adapter": adapter_id,
                "layers": entries,
                "ignored": plan.ignored(),
            }))?
        );
        return Ok(());
    }

    println!(
        "{} {} layers, {} ignored tensors",
        "Adapter".bold(),
        entries.len(),
        plan.ignored().len()
    );
    for entry in &entries {
        println!(
            "  {} -> {}:{}  rank {} scale {:.4} up {:?} down {:?}",
            entry.layer.cyan(),
            entry.component,
            entry.module_path.green(),
            entry.rank,
            entry.scale,
            entry.up_shape,
            entry.down_shape
        );
    }
    for ignored in plan.ignored() {
        println!("  {} {}", "ignored".yellow(), ignored);
    }
    Ok(())
}
