use anyhow::anyhow;
use clap::Parser;
use jamsim_lib::experiment::Scenario;
use jamsim_lib::network::{NetworkModel, Snapshot};
use jamsim_lib::{Amount, NodeId, SimulationCfg};
use log::LevelFilter;
use std::fs;
use std::path::PathBuf;

/// The default directory where simulation results will be written to.
pub const DEFAULT_DATA_DIR: &str = ".";

/// Default number of result rows to batch before flushing to the CSV file.
pub const DEFAULT_PRINT_BATCH_SIZE: u32 = 500;

/// Default simulated duration of one run, in seconds.
pub const DEFAULT_DURATION: f64 = 60.0;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to a directory where simulation results will be stored
    #[clap(long, short, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// Path to the topology snapshot file (CLN listchannels scheme)
    #[clap(long, short)]
    pub snapshot_file: PathBuf,
    /// The node whose adjacent channel directions the attacker jams
    #[clap(long, short)]
    pub target_node: String,
    /// Total simulated time of one run, in seconds
    #[clap(long, default_value_t = DEFAULT_DURATION)]
    pub duration: f64,
    /// Number of runs to average per coefficient pair
    #[clap(long, default_value_t = 1)]
    pub num_runs: usize,
    /// Seed to run the random activity generator deterministically
    #[clap(long, default_value_t = 0)]
    pub seed: u64,
    /// Upfront base fee coefficients to sweep, as multiples of the
    /// success-case base fee
    #[clap(long, value_delimiter = ',', default_value = "0,1,2,5,10")]
    pub upfront_base_coeffs: Vec<f64>,
    /// Upfront rate coefficients to sweep, as multiples of the success-case
    /// fee rate
    #[clap(long, value_delimiter = ',', default_value = "0,1,2,5,10")]
    pub upfront_rate_coeffs: Vec<f64>,
    /// Do not fail honest payments probabilistically for balance reasons
    #[clap(long, default_value_t = false)]
    pub no_balance_failures: bool,
    /// Honest payment amount range in satoshis, as min,max
    #[clap(long, value_delimiter = ',', default_value = "10000,100000")]
    pub amount_range: Vec<u64>,
    /// Delay between jamming batches, in seconds
    #[clap(long, default_value_t = jamsim_lib::DEFAULT_JAM_DELAY)]
    pub jam_delay: f64,
    /// Maximum number of target hops a single jamming route may thread
    #[clap(long, default_value_t = 5)]
    pub max_target_pairs_per_route: usize,
    /// Number of slots per channel direction
    #[clap(long, default_value_t = jamsim_lib::DEFAULT_NUM_SLOTS)]
    pub num_slots: usize,
    /// Number of result rows to batch together before flushing to the csv file [min: 1]
    #[clap(long, default_value_t = DEFAULT_PRINT_BATCH_SIZE, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..u32::MAX as u64))]
    pub print_batch_size: u32,
    /// Level of verbosity of the messages displayed by the simulator.
    /// Possible values: [off, error, warn, info, debug, trace]
    #[clap(long, short, verbatim_doc_comment, default_value = "info")]
    pub log_level: LevelFilter,
}

impl TryFrom<&Cli> for SimulationCfg {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        if cli.duration <= 0.0 {
            return Err(anyhow!("duration must be positive, got {}", cli.duration));
        }
        let &[amount_min, amount_max] = &cli.amount_range[..] else {
            return Err(anyhow!(
                "amount_range must be two values min,max, got {:?}",
                cli.amount_range
            ));
        };
        if amount_min >= amount_max {
            return Err(anyhow!(
                "amount_range must satisfy min < max, got {amount_min},{amount_max}"
            ));
        }
        if cli.num_runs == 0 {
            return Err(anyhow!("num_runs must be at least 1"));
        }

        Ok(SimulationCfg {
            default_num_slots: cli.num_slots,
            duration: cli.duration,
            jam_delay: cli.jam_delay,
            max_target_pairs_per_route: cli.max_target_pairs_per_route,
            no_balance_failures: cli.no_balance_failures,
            honest_amount: Amount::Range(amount_min, amount_max),
            num_runs: cli.num_runs,
            seed: cli.seed,
            ..SimulationCfg::default()
        })
    }
}

/// Parses the cli options provided and creates the scenario to be run:
/// reads and validates the topology snapshot, builds the network model, and
/// assembles the attack around the chosen target node.
pub fn create_scenario(cli: &Cli) -> Result<Scenario, anyhow::Error> {
    let cfg = SimulationCfg::try_from(cli)?;

    let raw = fs::read_to_string(&cli.snapshot_file).map_err(|e| {
        anyhow!(
            "Could not read snapshot file {}: {e}",
            cli.snapshot_file.display()
        )
    })?;
    let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|e| {
        anyhow!(
            "Could not deserialize snapshot file (line {}, col {}, err: {e})",
            e.line(),
            e.column(),
        )
    })?;
    log::info!(
        "Parsed snapshot with {} channel entries",
        snapshot.channels.len()
    );

    let model = NetworkModel::from_snapshot(&snapshot, cfg.default_num_slots)?;
    let target_node = NodeId::new(cli.target_node.clone());
    Ok(Scenario::for_target_node(model, cfg, &target_node)?)
}

pub fn mkdir(dir: PathBuf) -> Result<PathBuf, std::io::Error> {
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cli() -> Cli {
        Cli::parse_from([
            "jamsim-cli",
            "--snapshot-file",
            "snapshot.json",
            "--target-node",
            "Hub",
        ])
    }

    #[test]
    fn cfg_is_built_from_cli_defaults() {
        let cli = test_cli();
        let cfg = SimulationCfg::try_from(&cli).unwrap();
        assert_eq!(cfg.duration, DEFAULT_DURATION);
        assert_eq!(cfg.default_num_slots, jamsim_lib::DEFAULT_NUM_SLOTS);
        assert_eq!(cfg.num_runs, 1);
    }

    #[test]
    fn invalid_amount_range_is_rejected() {
        let mut cli = test_cli();
        cli.amount_range = vec![100];
        assert!(SimulationCfg::try_from(&cli).is_err());

        cli.amount_range = vec![200, 100];
        assert!(SimulationCfg::try_from(&cli).is_err());
    }
}
