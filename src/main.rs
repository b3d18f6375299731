use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = pdfharvest::cli::Cli::parse();

    match cli.command {
        pdfharvest::cli::Command::Run(args) => {
            pdfharvest::pipeline::run(args).await.context("run")?;
        }
        pdfharvest::cli::Command::Scan(args) => {
            pdfharvest::logging::init_stderr().context("init logging")?;
            tracing::debug!(?args, "parsed scan args");
            pdfharvest::scan::run(args).context("scan")?;
        }
    }

    Ok(())
}
