use crate::network::{ForwardingError, Htlc, NetworkModel};
use crate::payment::Payment;
use crate::router::Router;
use crate::schedule::{Event, Schedule};
use crate::{NodeId, SimulationCfg};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;

/// Aggregate counts for one run. Every attempt counts as sent; an attempt
/// that ends in an error counts as failed; an attempt whose payment reached
/// the receiver counts as reached. A jam that reaches the receiver is failed
/// there deliberately, so it counts as both reached and failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub num_sent: u64,
    pub num_failed: u64,
    pub num_reached_receiver: u64,
}

/// The simulation engine: executes a schedule of events against a network
/// model, building a route and payment per event and driving it hop by hop.
/// Revenue changes land in the model's ledger. The engine owns nothing of
/// the network; one engine instance drives exactly one run.
pub struct Simulator<'a> {
    cfg: &'a SimulationCfg,
    /// Directed node pairs the attacker aims to jam; empty for honest runs.
    target_pairs: Vec<(NodeId, NodeId)>,
    rng: ChaCha8Rng,
}

impl<'a> Simulator<'a> {
    pub fn new(
        cfg: &'a SimulationCfg,
        target_pairs: Vec<(NodeId, NodeId)>,
        rng: ChaCha8Rng,
    ) -> Self {
        Simulator {
            cfg,
            target_pairs,
            rng,
        }
    }

    /// Runs the main event loop until the schedule empties or an event falls
    /// past the schedule's end time, then drains every remaining in-flight
    /// HTLC so that lazily deferred resolutions are realized.
    pub fn execute_schedule(
        &mut self,
        schedule: &mut Schedule,
        model: &mut NetworkModel,
    ) -> RunStats {
        let mut stats = RunStats::default();
        while let Some((now, event)) = schedule.pop_earliest() {
            if now > schedule.end_time() {
                log::debug!(
                    "Reached simulation end time {} (next event at {now})",
                    schedule.end_time()
                );
                break;
            }
            log::debug!(
                "Executing event at {now}: {} -> {} for {}",
                event.sender,
                event.receiver,
                event.amount
            );
            if event.desired_result {
                self.process_honest_event(model, &event, now, &mut stats);
            } else {
                self.process_jamming_event(model, schedule, &event, now, &mut stats);
            }
        }
        log::debug!("Finalizing in-flight HTLCs");
        model.resolve_all_htlcs();
        log::info!(
            "Schedule executed: {} sent, {} failed, {} reached receiver",
            stats.num_sent,
            stats.num_failed,
            stats.num_reached_receiver
        );
        stats
    }

    /// Tries routes in shortest-first order until one attempt succeeds. A
    /// balance failure retries the same route; a jammed hop moves on to the
    /// next route; running out of routes ends the event.
    fn process_honest_event(
        &mut self,
        model: &mut NetworkModel,
        event: &Event,
        now: f64,
        stats: &mut RunStats,
    ) {
        let router = Router::new(model, event.amount, self.cfg.max_route_length);
        let mut routes = router.honest_routes(&event.sender, &event.receiver, &event.must_route_via);

        for route_index in 0..self.cfg.max_num_routes_honest {
            let Some(route) = routes.next() else {
                if route_index == 0 {
                    log::debug!(
                        "Skipping event: {}",
                        ForwardingError::NoRoute(event.sender.clone(), event.receiver.clone())
                    );
                } else {
                    log::debug!("No more routes from {} to {}", event.sender, event.receiver);
                }
                return;
            };
            let payment = match Payment::along_route(
                model,
                &route,
                event.amount,
                event.processing_delay,
                true,
            ) {
                Ok(payment) => payment,
                Err(e) => {
                    log::debug!("Skipping route {route:?}: {e}");
                    continue;
                },
            };

            for _ in 0..self.cfg.max_num_attempts_per_route_honest {
                stats.num_sent += 1;
                match self.attempt_send(model, &payment, now) {
                    Ok(()) => {
                        stats.num_reached_receiver += 1;
                        return;
                    },
                    Err(e @ ForwardingError::BalanceFailure(_, _)) => {
                        // Balance failures are transient; retry the route.
                        stats.num_failed += 1;
                        log::debug!("Attempt failed: {e}");
                    },
                    Err(e) => {
                        stats.num_failed += 1;
                        log::debug!("Replacing route after failure: {e}");
                        break;
                    },
                }
            }
        }
    }

    /// Drives one jamming batch: keeps pulling routes that thread as many
    /// still-unjammed targets as possible, sending jams along each until a
    /// hop reports its slots jammed. Afterwards the successor batch is
    /// scheduled one jam delay later, if it still fits the simulation.
    fn process_jamming_event(
        &mut self,
        model: &mut NetworkModel,
        schedule: &mut Schedule,
        event: &Event,
        now: f64,
        stats: &mut RunStats,
    ) {
        let mut unjammed: BTreeSet<(NodeId, NodeId)> =
            self.target_pairs.iter().cloned().collect();
        if unjammed.is_empty() {
            log::debug!("No target hops to jam; not scheduling further batches");
            return;
        }

        let router = Router::new(model, event.amount, self.cfg.max_route_length);
        let mut generator = router.jamming_routes(
            &event.sender,
            &event.receiver,
            &self.target_pairs,
            self.cfg.max_target_pairs_per_route,
        );

        while !unjammed.is_empty() {
            let Some(route) = generator.next_route(&unjammed) else {
                log::debug!(
                    "Route generator exhausted with {} target hops still unjammed",
                    unjammed.len()
                );
                break;
            };
            let payment = match Payment::along_route(
                model,
                &route,
                event.amount,
                event.processing_delay,
                false,
            ) {
                Ok(payment) => payment,
                Err(e) => {
                    log::debug!("Skipping jamming route {route:?}: {e}");
                    continue;
                },
            };

            for _ in 0..self.cfg.max_num_attempts_per_route_jamming {
                stats.num_sent += 1;
                match self.attempt_send(model, &payment, now) {
                    Ok(()) => {
                        // The jam reached the receiver, who fails it
                        // deliberately; its HTLCs sit in their slots until
                        // they resolve.
                        stats.num_reached_receiver += 1;
                        stats.num_failed += 1;
                    },
                    Err(ForwardingError::SlotsJammed(upstream, downstream)) => {
                        stats.num_failed += 1;
                        if unjammed.remove(&(upstream.clone(), downstream.clone())) {
                            log::debug!("Target hop {upstream} -> {downstream} is now jammed");
                        } else if upstream == event.sender || downstream == event.receiver {
                            log::warn!(
                                "Jammer's own slots depleted at {upstream} -> {downstream}; \
                                 allocate more slots to the jammer's channels"
                            );
                        }
                        break;
                    },
                    Err(e) => {
                        stats.num_failed += 1;
                        log::debug!("Jam attempt failed: {e}");
                    },
                }
            }
        }

        let next_batch = now + self.cfg.jam_delay;
        if next_batch <= schedule.end_time() {
            log::debug!("Scheduling next jamming batch at {next_batch}");
            schedule.push(next_batch, event.clone());
        }
    }

    /// Pushes one payment through its route, hop by hop, left to right. At
    /// each hop the unconditional fee moves first (it is paid at forward
    /// time regardless of what happens later), then the hop may reject for
    /// balance reasons, then a slot is claimed, resolving one outdated HTLC
    /// if that is what frees it. HTLC insertion is a per-hop commitment:
    /// hops before a failure keep their HTLCs; hops beyond it are never
    /// touched.
    fn attempt_send(
        &mut self,
        model: &mut NetworkModel,
        payment: &Payment,
        now: f64,
    ) -> Result<(), ForwardingError> {
        let payment_id = self.rng.gen::<u64>();
        // Jams never collide with balances: their whole point is to sit in
        // slots, and modelling balance failures for them would only add
        // noise to the attack.
        let no_balance_failures = self.cfg.no_balance_failures || !payment.desired_result;

        for hop in &payment.hops {
            if hop.upfront_fee != 0.0 {
                model.debit(&hop.upstream, hop.upfront_fee);
                model.credit(&hop.downstream, hop.upfront_fee);
            }

            if !no_balance_failures {
                let capacity = model
                    .channel_capacity(&hop.upstream, &hop.downstream, &hop.cid)
                    .ok_or_else(|| {
                        ForwardingError::NoCapableChannel(
                            hop.upstream.clone(),
                            hop.downstream.clone(),
                            hop.amount,
                        )
                    })?;
                // The channel must accommodate the amount plus the upfront fee.
                let prob_low_balance = (hop.amount + hop.upfront_fee) / capacity as f64;
                if self.rng.gen::<f64>() < prob_low_balance {
                    return Err(ForwardingError::BalanceFailure(
                        hop.upstream.clone(),
                        hop.downstream.clone(),
                    ));
                }
            }

            let (has_slot, released) = {
                let state = model
                    .channel_direction_mut(&hop.upstream, &hop.downstream, &hop.cid)
                    .ok_or_else(|| {
                        ForwardingError::NoCapableChannel(
                            hop.upstream.clone(),
                            hop.downstream.clone(),
                            hop.amount,
                        )
                    })?;
                state.ensure_free_slot(now)
            };
            if let Some(htlc) = released {
                log::debug!(
                    "Resolving outdated HTLC from {} to {} (resolution time {}, now {now})",
                    htlc.upstream,
                    htlc.downstream,
                    htlc.resolution_time
                );
                model.apply_htlc(&htlc);
            }
            if !has_slot {
                return Err(ForwardingError::SlotsJammed(
                    hop.upstream.clone(),
                    hop.downstream.clone(),
                ));
            }

            let htlc = Htlc {
                resolution_time: now + payment.processing_delay,
                payment_id,
                success_fee: hop.success_fee,
                desired_result: payment.desired_result,
                upstream: hop.upstream.clone(),
                downstream: hop.downstream.clone(),
            };
            let state = model
                .channel_direction_mut(&hop.upstream, &hop.downstream, &hop.cid)
                .ok_or_else(|| {
                    ForwardingError::NoCapableChannel(
                        hop.upstream.clone(),
                        hop.downstream.clone(),
                        hop.amount,
                    )
                })?;
            let inserted = state.try_insert(htlc);
            debug_assert!(inserted);
        }

        Ok(())
    }
}
