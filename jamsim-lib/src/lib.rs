#![deny(rustdoc::broken_intra_doc_links)]

//! A discrete-event simulator for channel jamming attacks on payment channel
//! networks, and for evaluating unconditional (upfront) fees as a
//! countermeasure. The simulator executes an honest payment workload and a
//! jamming workload against the same topology and reports per-node revenues
//! and aggregate payment counts across a grid of upfront fee coefficients.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub mod batched_writer;
pub mod experiment;
pub mod network;
pub mod payment;
pub mod router;
pub mod schedule;
pub mod simulator;

/// The default maximum number of in-flight HTLCs per channel direction. The
/// protocol limits max_accepted_htlcs to 483 so that a commitment transaction
/// stays within the maximum message size even if both sides max out.
pub const DEFAULT_NUM_SLOTS: usize = 483;

/// The default dust limit in satoshis. HTLCs below this amount are trimmed
/// from the commitment transaction, which makes it the smallest (and thus
/// cheapest) viable jam amount.
pub const DEFAULT_DUST_LIMIT: u64 = 354;

/// Default success-case base fee in satoshis, comparable to the defaults
/// shipped by major node implementations.
pub const DEFAULT_SUCCESS_BASE_FEE: f64 = 1.0;

/// Default success-case proportional fee (5 per million).
pub const DEFAULT_SUCCESS_FEE_RATE: f64 = 5.0 / 1_000_000.0;

/// Default minimum HTLC processing delay in seconds.
pub const DEFAULT_MIN_PROCESSING_DELAY: f64 = 1.0;

/// Default mean of the additional exponentially distributed processing delay.
pub const DEFAULT_EXPECTED_EXTRA_PROCESSING_DELAY: f64 = 3.0;

/// Default delay between jamming batches. A jam must outlive the slowest
/// honest payment it competes with, so this is the minimum delay plus twice
/// the expected extra delay.
pub const DEFAULT_JAM_DELAY: f64 =
    DEFAULT_MIN_PROCESSING_DELAY + 2.0 * DEFAULT_EXPECTED_EXTRA_PROCESSING_DELAY;

/// Default rate of honest payment arrivals (one payment every ten seconds).
pub const DEFAULT_HONEST_PAYMENTS_PER_SECOND: f64 = 0.1;

/// Default cap on route length, expressed in hops.
pub const DEFAULT_MAX_ROUTE_LENGTH: usize = 20;

/// Represents a node in the network, identified by an opaque string. The
/// ordering on identifiers defines channel direction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a short channel id, kept as the string form used by snapshot
/// files (e.g. "557932x1434x0"). Only used as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        ChannelId(id.into())
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        ChannelId(value.to_string())
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents fatal errors that end a simulation. Per-payment failures are
/// tracked separately in [`network::ForwardingError`] and recovered locally
/// by the engine.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The topology snapshot could not be interpreted.
    #[error("Snapshot error: {0}")]
    SnapshotError(String),
    /// Scenario or configuration validation failed.
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Error that occurred while writing CSV data.
    #[error("CSV error: {0:?}")]
    CsvError(#[from] csv::Error),
    /// Error that occurred while encoding or decoding JSON.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// Error that occurred during file operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Either a value or a range. Ranges are sampled uniformly at random with the
/// caller's RNG so that seeded simulations stay reproducible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueOrRange<T> {
    /// A single fixed value.
    Value(T),
    /// A range [min, max) from which values are randomly sampled.
    Range(T, T),
}

impl<T> ValueOrRange<T>
where
    T: std::cmp::PartialOrd + rand_distr::uniform::SampleUniform + Copy,
{
    /// Get the enclosed value. If the value is defined as a range, sample
    /// from it uniformly at random.
    pub fn value(&self, rng: &mut impl rand::Rng) -> T {
        match self {
            ValueOrRange::Value(x) => *x,
            ValueOrRange::Range(x, y) => rng.gen_range(*x..*y),
        }
    }
}

impl<T> Display for ValueOrRange<T>
where
    T: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueOrRange::Value(x) => write!(f, "{x}"),
            ValueOrRange::Range(x, y) => write!(f, "({x}-{y})"),
        }
    }
}

/// The payment amount in satoshis. Either a value or a range.
pub type Amount = ValueOrRange<u64>;

/// Contains the configuration options for the simulation core.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationCfg {
    /// Number of slots assigned to each channel direction unless the
    /// snapshot or scenario overrides it.
    pub default_num_slots: usize,
    /// The smallest viable payment amount; jams are sent at exactly this
    /// amount.
    pub dust_limit: u64,
    /// Rate of honest payment arrivals per second of simulated time.
    pub honest_payments_per_second: f64,
    /// The fixed floor of every HTLC's processing delay.
    pub min_processing_delay: f64,
    /// Mean of the exponentially distributed delay added on top of the
    /// minimum processing delay.
    pub expected_extra_processing_delay: f64,
    /// Time between jamming batches; also the processing delay carried by
    /// every jam.
    pub jam_delay: f64,
    /// Attempts per route before an honest payment gives up on the route.
    pub max_num_attempts_per_route_honest: usize,
    /// Attempts per route in a jamming batch.
    pub max_num_attempts_per_route_jamming: usize,
    /// Distinct routes an honest payment may try before failing the event.
    pub max_num_routes_honest: usize,
    /// Upper bound on how many target pairs a single jamming route threads.
    pub max_target_pairs_per_route: usize,
    /// Upper bound on route length, in hops.
    pub max_route_length: usize,
    /// End of simulated time; events past this point never execute.
    pub duration: f64,
    /// If true, hops never fail payments for (unmodelled) balance reasons.
    pub no_balance_failures: bool,
    /// Amount drawn for each honest payment.
    pub honest_amount: Amount,
    /// If true, overwrite all snapshot success fees with the defaults below.
    pub set_default_success_fee: bool,
    /// Success-case base fee applied when overwriting snapshot fees.
    pub success_base_fee: f64,
    /// Success-case proportional fee applied when overwriting snapshot fees.
    pub success_fee_rate: f64,
    /// Number of runs to average per parameter combination.
    pub num_runs: usize,
    /// Seed for deterministic randomness; run `i` uses `seed + i`.
    pub seed: u64,
}

impl Default for SimulationCfg {
    fn default() -> Self {
        SimulationCfg {
            default_num_slots: DEFAULT_NUM_SLOTS,
            dust_limit: DEFAULT_DUST_LIMIT,
            honest_payments_per_second: DEFAULT_HONEST_PAYMENTS_PER_SECOND,
            min_processing_delay: DEFAULT_MIN_PROCESSING_DELAY,
            expected_extra_processing_delay: DEFAULT_EXPECTED_EXTRA_PROCESSING_DELAY,
            jam_delay: DEFAULT_JAM_DELAY,
            max_num_attempts_per_route_honest: 1,
            max_num_attempts_per_route_jamming: 493,
            max_num_routes_honest: 10,
            max_target_pairs_per_route: 5,
            max_route_length: DEFAULT_MAX_ROUTE_LENGTH,
            duration: 60.0,
            no_balance_failures: false,
            honest_amount: ValueOrRange::Range(10_000, 100_000),
            set_default_success_fee: true,
            success_base_fee: DEFAULT_SUCCESS_BASE_FEE,
            success_fee_rate: DEFAULT_SUCCESS_FEE_RATE,
            num_runs: 1,
            seed: 0,
        }
    }
}
