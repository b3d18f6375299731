use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Harvest, scan and route PDFs for every identifier in the input.
    Run(RunArgs),
    /// Search one local PDF for target strings and print the outcome as JSON.
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// YAML configuration file.
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// PDF file to search.
    #[arg(long)]
    pub pdf: PathBuf,

    /// Target string (repeatable, case-sensitive).
    #[arg(long = "needle", required = true)]
    pub needles: Vec<String>,
}
