use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Generator, Shell};
use sdlora_serve::cli::{self, commands::*, CliResult};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sdlora",
    version,
    about = "Fuse LoRA adapters into diffusion models and inspect serving behavior",
    long_about = "sdlora loads a diffusers-layout diffusion model, fuses kohya-style LoRA adapters \
                  into its weights, and normalizes generation requests the way the server does."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON output format
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SDLORA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuse a LoRA adapter and write the fused model
    Fuse(FuseCommand),

    /// Show how every adapter layer resolves against a model
    Inspect(InspectCommand),

    /// Print the normalized form of a request body
    Normalize(NormalizeCommand),

    /// Manage sdlora configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Show the effective configuration
    Show,
}

fn print_completions<G: Generator>(gen: G, cmd: &mut clap::Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

fn run(cli: Cli) -> CliResult<()> {
    cli::logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        print_completions(*shell, &mut cmd);
        return Ok(());
    }

    let config = cli::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fuse(cmd) => cli::commands::fuse::execute(cmd, config),
        Commands::Inspect(cmd) => cli::commands::inspect::execute(cmd, config, cli.json),
        Commands::Normalize(cmd) => cli::commands::normalize::execute(cmd, config),
        Commands::Config {
            subcommand: ConfigSubcommand::Show,
        } => cli::config::show_config(&config, cli.json),
        Commands::Completions { .. } => Ok(()),
    }
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        err.print_error();
        std::process::exit(1);
    }
}
