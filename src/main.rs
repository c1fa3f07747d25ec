use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = cli::Cli::parse();
    let config_path = args.config.as_deref();

    // Tracing is initialized by each command once its configuration is loaded
    match args.get_command() {
        cli::Commands::Start => {
            commands::start::execute(config_path).await?;
        }
        cli::Commands::Replay { input, output } => {
            commands::replay::execute(config_path, &input, output.as_deref())?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(config_path)?,
            cli::ConfigCommands::Validate => commands::config::validate(config_path)?,
        },
        cli::Commands::Version => {
            println!("dbintel pipeline v{}", env!("CARGO_PKG_VERSION"));
            println!("Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
    }

    Ok(())
}
