use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Media harvester: bounded retrieval of remote resources", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to HARVESTER_CONFIG or config/harvester.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest every job of a jobs file and exit when all are finished
    Run(RunArgs),
    /// Retrieve a single URL with the default limits and print the outcome
    Fetch(FetchArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// JSON file with `jobs` and `resources`
    #[arg(long)]
    pub jobs: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    pub url: String,

    /// Only check that the link resolves, without transferring the body
    #[arg(long)]
    pub check: bool,
}
