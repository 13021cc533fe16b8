use crate::{NodeId, SimulationCfg, SimulationError};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A planned payment. The amount is what the receiver gets if the payment
/// succeeds; the processing delay is how long every HTLC created for it
/// stays in flight before it can resolve.
#[derive(Debug, Clone)]
pub struct Event {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub amount: u64,
    pub desired_result: bool,
    pub processing_delay: f64,
    /// Nodes the payment must be routed through, in order.
    pub must_route_via: Vec<NodeId>,
}

/// An event with its execution time and an insertion sequence number. Events
/// sharing a timestamp execute in insertion order, which keeps seeded runs
/// bit-for-bit reproducible.
#[derive(Debug, Clone)]
struct ScheduledEvent {
    time: f64,
    seq: u64,
    event: Event,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.seq.cmp(&other.seq))
    }
}

/// A time-ordered queue of pending payments, with an end time that bounds
/// execution independently of the last event's timestamp.
#[derive(Debug)]
pub struct Schedule {
    heap: BinaryHeap<Reverse<ScheduledEvent>>,
    next_seq: u64,
    end_time: f64,
}

impl Schedule {
    pub fn new(end_time: f64) -> Self {
        Schedule {
            heap: BinaryHeap::new(),
            next_seq: 0,
            end_time,
        }
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn push(&mut self, time: f64, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledEvent { time, seq, event }));
    }

    pub fn pop_earliest(&mut self) -> Option<(f64, Event)> {
        self.heap.pop().map(|entry| (entry.0.time, entry.0.event))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Generates an honest workload: payment arrivals form a Poisson process
    /// with the configured rate, amounts are drawn uniformly, the processing
    /// delay is the configured minimum plus an exponential extra, and sender
    /// and receiver are picked uniformly from the candidate sets. A draw
    /// that picks the same node for both schedules nothing for that tick.
    pub fn honest(
        cfg: &SimulationCfg,
        senders: &[NodeId],
        receivers: &[NodeId],
        must_route_via: &[NodeId],
        rng: &mut impl Rng,
    ) -> Result<Self, SimulationError> {
        debug_assert!(!senders.is_empty() && !receivers.is_empty());
        let mut schedule = Schedule::new(cfg.duration);
        let inter_arrival = Exp::new(cfg.honest_payments_per_second).map_err(|e| {
            SimulationError::ValidationError(format!("invalid honest payment rate: {e}"))
        })?;
        let extra_delay = Exp::new(1.0 / cfg.expected_extra_processing_delay).map_err(|e| {
            SimulationError::ValidationError(format!("invalid extra processing delay: {e}"))
        })?;

        let mut t = 0.0;
        while t <= cfg.duration {
            let sender = senders[rng.gen_range(0..senders.len())].clone();
            let receiver = receivers[rng.gen_range(0..receivers.len())].clone();
            if sender != receiver {
                let event = Event {
                    sender,
                    receiver,
                    amount: cfg.honest_amount.value(rng),
                    desired_result: true,
                    processing_delay: cfg.min_processing_delay + extra_delay.sample(rng),
                    must_route_via: must_route_via.to_vec(),
                };
                schedule.push(t, event);
            }
            t += inter_arrival.sample(rng);
        }
        Ok(schedule)
    }

    /// Seeds a jamming workload with a single event at time zero. The engine
    /// pushes successor events itself, one batch per jam delay, so the
    /// schedule never holds more than the next batch.
    pub fn jamming(cfg: &SimulationCfg, jammer_sender: &NodeId, jammer_receiver: &NodeId) -> Self {
        let mut schedule = Schedule::new(cfg.duration);
        schedule.push(
            0.0,
            Event {
                sender: jammer_sender.clone(),
                receiver: jammer_receiver.clone(),
                amount: cfg.dust_limit,
                desired_result: false,
                processing_delay: cfg.jam_delay,
                must_route_via: vec![],
            },
        );
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_event(sender: &str, receiver: &str) -> Event {
        Event {
            sender: NodeId::from(sender),
            receiver: NodeId::from(receiver),
            amount: 100,
            desired_result: true,
            processing_delay: 1.0,
            must_route_via: vec![],
        }
    }

    #[test]
    fn events_pop_in_time_order() {
        let mut schedule = Schedule::new(10.0);
        schedule.push(5.0, test_event("A", "B"));
        schedule.push(1.0, test_event("C", "D"));
        schedule.push(3.0, test_event("E", "F"));

        let (t1, _) = schedule.pop_earliest().unwrap();
        let (t2, _) = schedule.pop_earliest().unwrap();
        let (t3, _) = schedule.pop_earliest().unwrap();
        assert_eq!((t1, t2, t3), (1.0, 3.0, 5.0));
        assert!(schedule.is_empty());
    }

    #[test]
    fn equal_timestamps_pop_in_insertion_order() {
        let mut schedule = Schedule::new(10.0);
        schedule.push(2.0, test_event("A", "B"));
        schedule.push(2.0, test_event("C", "D"));
        schedule.push(2.0, test_event("E", "F"));

        let (_, first) = schedule.pop_earliest().unwrap();
        let (_, second) = schedule.pop_earliest().unwrap();
        let (_, third) = schedule.pop_earliest().unwrap();
        assert_eq!(first.sender, NodeId::from("A"));
        assert_eq!(second.sender, NodeId::from("C"));
        assert_eq!(third.sender, NodeId::from("E"));
    }

    #[test]
    fn honest_schedule_stays_within_duration() {
        let cfg = SimulationCfg {
            duration: 100.0,
            ..SimulationCfg::default()
        };
        let senders = vec![NodeId::from("Alice"), NodeId::from("Bob")];
        let receivers = vec![NodeId::from("Carol")];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut schedule = Schedule::honest(&cfg, &senders, &receivers, &[], &mut rng).unwrap();

        assert!(!schedule.is_empty());
        while let Some((t, event)) = schedule.pop_earliest() {
            assert!(t <= cfg.duration);
            assert!(event.desired_result);
            assert!(event.processing_delay >= cfg.min_processing_delay);
            assert!(event.sender != event.receiver);
        }
    }

    #[test]
    fn honest_schedule_is_reproducible_under_a_fixed_seed() {
        let cfg = SimulationCfg {
            duration: 50.0,
            ..SimulationCfg::default()
        };
        let senders = vec![NodeId::from("Alice")];
        let receivers = vec![NodeId::from("Bob")];

        let mut times_a = vec![];
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut schedule = Schedule::honest(&cfg, &senders, &receivers, &[], &mut rng).unwrap();
        while let Some((t, event)) = schedule.pop_earliest() {
            times_a.push((t, event.amount, event.processing_delay));
        }

        let mut times_b = vec![];
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut schedule = Schedule::honest(&cfg, &senders, &receivers, &[], &mut rng).unwrap();
        while let Some((t, event)) = schedule.pop_earliest() {
            times_b.push((t, event.amount, event.processing_delay));
        }

        assert_eq!(times_a, times_b);
    }

    #[test]
    fn jamming_schedule_holds_a_single_seed_event() {
        let cfg = SimulationCfg::default();
        let mut schedule = Schedule::jamming(
            &cfg,
            &NodeId::from("JammerSender"),
            &NodeId::from("JammerReceiver"),
        );
        assert_eq!(schedule.len(), 1);
        let (t, event) = schedule.pop_earliest().unwrap();
        assert_eq!(t, 0.0);
        assert!(!event.desired_result);
        assert_eq!(event.amount, cfg.dust_limit);
        assert_eq!(event.processing_delay, cfg.jam_delay);
    }
}
