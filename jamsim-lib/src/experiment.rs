use crate::batched_writer::BatchedWriter;
use crate::network::NetworkModel;
use crate::schedule::Schedule;
use crate::simulator::Simulator;
use crate::{NodeId, SimulationCfg, SimulationError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Per-run statistics averaged over the runs of one simulation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AvgStats {
    pub num_sent: f64,
    pub num_failed: f64,
    pub num_reached_receiver: f64,
}

/// The outcome of one simulation: one point of the upfront fee coefficient
/// grid, with stats and per-node revenues averaged over the configured
/// number of runs.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub upfront_base_coeff: f64,
    pub upfront_rate_coeff: f64,
    pub stats: AvgStats,
    pub revenues: BTreeMap<NodeId, f64>,
}

/// Results of both workloads over the full coefficient grid, along with the
/// parameters that produced them.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub params: SimulationCfg,
    pub simulations: Simulations,
}

#[derive(Debug, Clone, Serialize)]
pub struct Simulations {
    pub honest: Vec<SimulationResult>,
    pub jamming: Vec<SimulationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    Honest,
    Jamming,
}

/// A fully assembled experiment: the network under attack, the honest
/// traffic endpoints, the attacker's targets, and the attacker's own edges
/// already added to the model.
pub struct Scenario {
    pub cfg: SimulationCfg,
    pub model: NetworkModel,
    pub honest_senders: Vec<NodeId>,
    pub honest_receivers: Vec<NodeId>,
    pub honest_must_route_via: Vec<NodeId>,
    pub target_pairs: Vec<(NodeId, NodeId)>,
    pub jammer_sender: NodeId,
    pub jammer_receiver: NodeId,
}

impl Scenario {
    /// Builds a scenario around a single victim node: the attacker targets
    /// every channel direction adjacent to it, and honest traffic flows from
    /// the victim's upstream peers to its downstream peers.
    pub fn for_target_node(
        model: NetworkModel,
        cfg: SimulationCfg,
        target_node: &NodeId,
    ) -> Result<Scenario, SimulationError> {
        let in_edges = model.in_edges(target_node);
        let out_edges = model.out_edges(target_node);
        if in_edges.is_empty() {
            return Err(SimulationError::ValidationError(format!(
                "target node {target_node} has no incoming edges"
            )));
        }
        if out_edges.is_empty() {
            return Err(SimulationError::ValidationError(format!(
                "target node {target_node} has no outgoing edges"
            )));
        }

        let honest_senders: Vec<NodeId> = in_edges
            .iter()
            .map(|(upstream, _)| upstream.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let honest_receivers: Vec<NodeId> = out_edges
            .iter()
            .map(|(_, downstream)| downstream.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        log::info!(
            "Targeting {target_node}: {} honest senders, {} honest receivers",
            honest_senders.len(),
            honest_receivers.len()
        );

        let mut target_pairs = in_edges;
        target_pairs.extend(out_edges);
        Scenario::with_targets(model, cfg, honest_senders, honest_receivers, target_pairs)
    }

    /// Builds a scenario from explicit target hops and honest endpoints. The
    /// attacker's channels are opened towards every target and get a widened
    /// slot count so that the attack is not bottlenecked on its own edges.
    pub fn with_targets(
        mut model: NetworkModel,
        cfg: SimulationCfg,
        honest_senders: Vec<NodeId>,
        honest_receivers: Vec<NodeId>,
        target_pairs: Vec<(NodeId, NodeId)>,
    ) -> Result<Scenario, SimulationError> {
        if honest_senders.is_empty() || honest_receivers.is_empty() {
            return Err(SimulationError::ValidationError(
                "honest senders and receivers must not be empty".to_string(),
            ));
        }
        if target_pairs.is_empty() {
            return Err(SimulationError::ValidationError(
                "at least one target hop is required".to_string(),
            ));
        }
        log::info!("Set {} target hops", target_pairs.len());

        let jammer_sender = NodeId::from("JammerSender");
        let jammer_receiver = NodeId::from("JammerReceiver");
        let jammer_num_slots = target_pairs.len() * (cfg.default_num_slots + 1);
        let send_to: Vec<NodeId> = target_pairs.iter().map(|(u, _)| u.clone()).collect();
        let receive_from: Vec<NodeId> = target_pairs.iter().map(|(_, d)| d.clone()).collect();
        model.add_jammer_edges(
            &jammer_sender,
            &jammer_receiver,
            &send_to,
            &receive_from,
            jammer_num_slots,
        );

        if cfg.set_default_success_fee {
            model.set_success_fee_for_all(cfg.success_base_fee, cfg.success_fee_rate);
        }

        Ok(Scenario {
            cfg,
            model,
            honest_senders,
            honest_receivers,
            honest_must_route_via: vec![],
            target_pairs,
            jammer_sender,
            jammer_receiver,
        })
    }

    /// Runs the jamming and honest workloads over the whole coefficient
    /// grid.
    pub fn run(
        &mut self,
        upfront_base_coeffs: &[f64],
        upfront_rate_coeffs: &[f64],
    ) -> Result<ExperimentResults, SimulationError> {
        log::info!("Starting jamming simulations");
        let jamming =
            self.run_series(upfront_base_coeffs, upfront_rate_coeffs, Workload::Jamming)?;
        log::info!("Starting honest simulations");
        let honest = self.run_series(upfront_base_coeffs, upfront_rate_coeffs, Workload::Honest)?;

        Ok(ExperimentResults {
            params: self.cfg.clone(),
            simulations: Simulations { honest, jamming },
        })
    }

    fn run_series(
        &mut self,
        upfront_base_coeffs: &[f64],
        upfront_rate_coeffs: &[f64],
        workload: Workload,
    ) -> Result<Vec<SimulationResult>, SimulationError> {
        let mut results = vec![];
        for &base_coeff in upfront_base_coeffs {
            for &rate_coeff in upfront_rate_coeffs {
                log::info!(
                    "Starting simulation with upfront fee coefficients: base {base_coeff}, rate {rate_coeff}"
                );
                self.model.apply_upfront_coefficients(base_coeff, rate_coeff);
                let (stats, revenues) = self.run_simulation(workload)?;
                results.push(SimulationResult {
                    upfront_base_coeff: base_coeff,
                    upfront_rate_coeff: rate_coeff,
                    stats,
                    revenues,
                });
            }
        }
        Ok(results)
    }

    /// One simulation: `num_runs` seeded runs of one workload against the
    /// current fee coefficients, with the model reset between runs and the
    /// outcomes averaged.
    fn run_simulation(
        &mut self,
        workload: Workload,
    ) -> Result<(AvgStats, BTreeMap<NodeId, f64>), SimulationError> {
        let mut stat_sums = AvgStats::default();
        let mut revenue_sums: BTreeMap<NodeId, f64> =
            self.model.nodes().map(|node| (node.clone(), 0.0)).collect();

        for run in 0..self.cfg.num_runs {
            log::debug!("Run {} of {}", run + 1, self.cfg.num_runs);
            let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.seed.wrapping_add(run as u64));

            // Schedules cannot be reused: executing one consumes it.
            let mut schedule = match workload {
                Workload::Honest => Schedule::honest(
                    &self.cfg,
                    &self.honest_senders,
                    &self.honest_receivers,
                    &self.honest_must_route_via,
                    &mut rng,
                )?,
                Workload::Jamming => {
                    Schedule::jamming(&self.cfg, &self.jammer_sender, &self.jammer_receiver)
                },
            };
            let targets = match workload {
                Workload::Honest => vec![],
                Workload::Jamming => self.target_pairs.clone(),
            };

            let mut simulator = Simulator::new(&self.cfg, targets, rng);
            let stats = simulator.execute_schedule(&mut schedule, &mut self.model);

            stat_sums.num_sent += stats.num_sent as f64;
            stat_sums.num_failed += stats.num_failed as f64;
            stat_sums.num_reached_receiver += stats.num_reached_receiver as f64;
            for (node, revenue) in self.model.revenues() {
                *revenue_sums.entry(node.clone()).or_insert(0.0) += revenue;
            }

            self.model.reset();
        }

        let runs = self.cfg.num_runs as f64;
        let stats = AvgStats {
            num_sent: stat_sums.num_sent / runs,
            num_failed: stat_sums.num_failed / runs,
            num_reached_receiver: stat_sums.num_reached_receiver / runs,
        };
        let revenues = revenue_sums
            .into_iter()
            .map(|(node, sum)| (node, sum / runs))
            .collect();
        Ok((stats, revenues))
    }
}

/// Dumps the results into a JSON file.
pub fn write_results_json(
    results: &ExperimentResults,
    path: &Path,
) -> Result<(), SimulationError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

/// Dumps the results into a CSV file: one row per grid cell, one column per
/// node, with a leading column marking the workload.
pub fn write_results_csv(
    results: &ExperimentResults,
    directory: PathBuf,
    file_name: String,
    batch_size: u32,
) -> Result<(), SimulationError> {
    let Some(first) = results
        .simulations
        .honest
        .first()
        .or(results.simulations.jamming.first())
    else {
        return Ok(());
    };
    let nodes: Vec<&NodeId> = first.revenues.keys().collect();

    let mut writer = BatchedWriter::new(directory, file_name, batch_size)?;

    let mut header = vec![
        "simulation".to_string(),
        "upfront_base_coeff".to_string(),
        "upfront_rate_coeff".to_string(),
        "sent".to_string(),
        "failed".to_string(),
        "reached_receiver".to_string(),
    ];
    header.extend(nodes.iter().map(|node| node.to_string()));
    writer.queue(&header)?;

    for (label, series) in [
        ("honest", &results.simulations.honest),
        ("jamming", &results.simulations.jamming),
    ] {
        for result in series {
            let mut row = vec![
                label.to_string(),
                result.upfront_base_coeff.to_string(),
                result.upfront_rate_coeff.to_string(),
                result.stats.num_sent.to_string(),
                result.stats.num_failed.to_string(),
                result.stats.num_reached_receiver.to_string(),
            ];
            row.extend(
                nodes
                    .iter()
                    .map(|node| result.revenues.get(*node).copied().unwrap_or(0.0).to_string()),
            );
            writer.queue(&row)?;
        }
    }

    writer.write(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Snapshot, SnapshotChannel};
    use std::fs;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    fn channel(src: &str, dst: &str, cid: &str) -> SnapshotChannel {
        SnapshotChannel {
            source: src.to_string(),
            destination: dst.to_string(),
            short_channel_id: cid.to_string(),
            satoshis: 1_000_000,
            active: true,
            base_fee_millisatoshi: None,
            fee_per_millionth: None,
        }
    }

    fn wheel_model() -> NetworkModel {
        let mut channels = vec![];
        for (a, b, cid) in [("Alice", "Hub", "cid-ah"), ("Bob", "Hub", "cid-bh")] {
            channels.push(channel(a, b, cid));
            channels.push(channel(b, a, cid));
        }
        NetworkModel::from_snapshot(&Snapshot { channels }, 2).unwrap()
    }

    fn test_cfg() -> SimulationCfg {
        SimulationCfg {
            duration: 20.0,
            jam_delay: 7.0,
            no_balance_failures: true,
            max_target_pairs_per_route: 4,
            max_num_attempts_per_route_jamming: 10,
            num_runs: 2,
            ..SimulationCfg::default()
        }
    }

    #[test]
    fn scenario_derives_endpoints_and_targets_from_the_victim() {
        let scenario =
            Scenario::for_target_node(wheel_model(), test_cfg(), &node("Hub")).unwrap();

        assert_eq!(scenario.honest_senders, vec![node("Alice"), node("Bob")]);
        assert_eq!(scenario.honest_receivers, vec![node("Alice"), node("Bob")]);
        assert_eq!(scenario.target_pairs.len(), 4);

        // The attacker's edges are in place for routing.
        assert!(scenario.model.routing().contains_key(&scenario.jammer_sender));
    }

    #[test]
    fn scenario_rejects_a_victim_without_edges() {
        assert!(matches!(
            Scenario::for_target_node(wheel_model(), test_cfg(), &node("Nobody")),
            Err(SimulationError::ValidationError(_))
        ));
    }

    #[test]
    fn grid_produces_one_result_per_coefficient_pair_per_workload() {
        let mut scenario =
            Scenario::for_target_node(wheel_model(), test_cfg(), &node("Hub")).unwrap();
        let results = scenario.run(&[0.0, 1.0], &[0.0, 1.0, 2.0]).unwrap();

        assert_eq!(results.simulations.honest.len(), 6);
        assert_eq!(results.simulations.jamming.len(), 6);
        for result in &results.simulations.jamming {
            assert!(result.stats.num_sent > 0.0);
        }
    }

    /// With zero upfront coefficients a jamming simulation moves no money:
    /// every revenue averages to exactly zero.
    #[test]
    fn zero_upfront_coefficients_leave_jamming_revenues_at_zero() {
        let mut scenario =
            Scenario::for_target_node(wheel_model(), test_cfg(), &node("Hub")).unwrap();
        let results = scenario.run(&[0.0], &[0.0]).unwrap();

        let jamming = &results.simulations.jamming[0];
        for revenue in jamming.revenues.values() {
            assert_eq!(*revenue, 0.0);
        }
        // The honest workload does move success fees around.
        let honest = &results.simulations.honest[0];
        let moved = honest.revenues.values().any(|revenue| *revenue != 0.0);
        assert!(moved || honest.stats.num_reached_receiver == 0.0);
    }

    /// Averaged runs of a deterministic workload equal a single run.
    #[test]
    fn averaging_identical_runs_changes_nothing() {
        let run_with = |num_runs: usize| {
            let cfg = SimulationCfg {
                num_runs,
                ..test_cfg()
            };
            let mut scenario =
                Scenario::for_target_node(wheel_model(), cfg, &node("Hub")).unwrap();
            // A base-only upfront fee keeps every ledger entry integral, so
            // the averages compare exactly.
            let results = scenario.run(&[1.0], &[0.0]).unwrap();
            results.simulations.jamming[0].clone()
        };

        let single = run_with(1);
        let averaged = run_with(3);
        assert_eq!(single.stats.num_sent, averaged.stats.num_sent);
        assert_eq!(single.revenues, averaged.revenues);
    }

    #[test]
    fn results_round_trip_through_json_and_csv() {
        let mut scenario =
            Scenario::for_target_node(wheel_model(), test_cfg(), &node("Hub")).unwrap();
        let results = scenario.run(&[0.0, 2.0], &[0.0]).unwrap();

        let dir = std::env::temp_dir();
        let json_path = dir.join(format!("jamsim-results-{}.json", std::process::id()));
        write_results_json(&results, &json_path).unwrap();
        let raw = fs::read_to_string(&json_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            parsed["simulations"]["jamming"]
                .as_array()
                .map(|series| series.len()),
            Some(2)
        );
        fs::remove_file(&json_path).unwrap();

        let csv_name = format!("jamsim-results-{}.csv", std::process::id());
        write_results_csv(&results, dir.clone(), csv_name.clone(), 10).unwrap();
        let contents = fs::read_to_string(dir.join(&csv_name)).unwrap();
        assert!(contents.starts_with("simulation,upfront_base_coeff"));
        assert!(contents.contains("jamming,2,0"));
        fs::remove_file(dir.join(&csv_name)).unwrap();
    }
}
