use self::parsing::{create_scenario, mkdir, Cli};
use clap::Parser;
use jamsim_lib::experiment::{write_results_csv, write_results_json};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod parsing;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level("jamsim_lib", cli.log_level)
        .with_module_level("jamsim_cli", cli.log_level)
        .init()
        .unwrap();

    let mut scenario = create_scenario(&cli)?;
    let results = scenario.run(&cli.upfront_base_coeffs, &cli.upfront_rate_coeffs)?;

    let results_dir = mkdir(cli.data_dir.join("results"))?;
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let json_path = results_dir.join(format!("{timestamp}-results.json"));
    write_results_json(&results, &json_path)?;
    write_results_csv(
        &results,
        results_dir.clone(),
        format!("{timestamp}-results.csv"),
        cli.print_batch_size,
    )?;
    log::info!("Results written to {}", results_dir.display());

    Ok(())
}
