use anyhow::Result;
use clap::Parser;
use log::info;

use sd_finetune::TrainArgs;

fn main() -> Result<()> {
    // Initialize logging
    sd_finetune::logging::init_logger();

    let args = TrainArgs::parse();
    let report = sd_finetune::run(&args)?;

    info!("Training completed successfully, outputs in {}", report.run_dir.display());
    Ok(())
}
