use crate::cli::error::{CliError, CliResult};
use clap::Args;
use sdlora::{GenerationRequest, RawRequest, ServingConfig};
use std::io::Read;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct NormalizeCommand {
    /// Request body; `-` reads standard input
    #[arg(default_value = "-", help = "JSON request file, or - for stdin")]
    pub input: PathBuf,
}

pub fn execute(cmd: NormalizeCommand, config: ServingConfig) -> CliResult<()> {
    let body = if cmd.input.as_os_str() == "-" {
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body)?;
        body
    } else {
        if !cmd.input.exists() {
            return Err(CliError::FileNotFound(cmd.input.display().to_string()));
        }
        std::fs::read_to_string(&cmd.input)?
    };

    println!("{}", serde_json::to_string_pretty(&normalize(&body, &config)?)?);
    Ok(())
}

pub fn normalize(body: &str, config: &ServingConfig) -> CliResult<GenerationRequest> {
    let raw: RawRequest = serde_json::from_str(body)?;
    Ok(GenerationRequest::normalize(raw, &config.limits()))
}
