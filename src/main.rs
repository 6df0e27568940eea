mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use harvester::config::Config;
use harvester::{harvest, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    observability::init_tracing(&config.telemetry);

    match cli.command {
        Commands::Run(args) => {
            let jobs = harvest::load_jobs(&args.jobs)?;
            let summary = harvest::run(&config, jobs).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Fetch(args) => {
            let outcome = harvest::fetch(&config, &args.url, args.check).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}
