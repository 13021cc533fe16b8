use crate::{ChannelId, NodeId, SimulationError};
use serde::Deserialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use thiserror::Error;

/// Capacity assigned to the channels the attacker opens towards its targets.
/// Large enough that the attacker's own edges never constrain routing.
const JAMMER_CHANNEL_CAPACITY: u64 = 1_000_000_000;

/// ForwardingError represents the ways a payment can fail while being pushed
/// through the network. Since we control the whole route, these are not
/// obfuscated onion errors: the engine reads the failing hop directly and
/// recovers locally (route replacement, retry, or jam bookkeeping).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForwardingError {
    /// No route between the sender and receiver supports the amount.
    #[error("NoRoute: {0} -> {1}")]
    NoRoute(NodeId, NodeId),
    /// A hop on the chosen route has no enabled channel with enough capacity.
    #[error("NoCapableChannel: {0} -> {1} for amount {2}")]
    NoCapableChannel(NodeId, NodeId, f64),
    /// All slots on the hop hold HTLCs that resolve strictly in the future.
    #[error("SlotsJammed: {0} -> {1}")]
    SlotsJammed(NodeId, NodeId),
    /// The hop probabilistically rejected the payment for (unmodelled)
    /// balance reasons.
    #[error("BalanceFailure: {0} -> {1}")]
    BalanceFailure(NodeId, NodeId),
}

/// The direction of forwarding over a channel. Forwarding from the
/// alphabetically lesser node to the greater one is `Alph`; the reverse is
/// `NonAlph`. Every channel has fixed endpoints, so the direction of a
/// forward is fully determined by the endpoint identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Alph,
    NonAlph,
}

impl Direction {
    /// Derives the direction of a forward from upstream to downstream.
    pub fn of(upstream: &NodeId, downstream: &NodeId) -> Direction {
        debug_assert!(upstream != downstream);
        if upstream < downstream {
            Direction::Alph
        } else {
            Direction::NonAlph
        }
    }

    fn index(self) -> usize {
        match self {
            Direction::Alph => 0,
            Direction::NonAlph => 1,
        }
    }
}

/// An in-flight HTLC. Balances are not modelled, so an HTLC carries only the
/// success-case fee that resolution will transfer, not the payment amount.
#[derive(Debug, Clone)]
pub struct Htlc {
    /// Absolute simulated time at which the HTLC can be resolved.
    pub resolution_time: f64,
    /// Identifier of the payment attempt that created this HTLC.
    pub payment_id: u64,
    /// Success-case fee transferred upstream -> downstream on success.
    pub success_fee: f64,
    /// True for honest payments, false for jams.
    pub desired_result: bool,
    /// The node that forwarded the HTLC.
    pub upstream: NodeId,
    /// The node that received the HTLC.
    pub downstream: NodeId,
}

impl PartialEq for Htlc {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Htlc {}

impl PartialOrd for Htlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Htlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.resolution_time
            .total_cmp(&other.resolution_time)
            .then(self.payment_id.cmp(&other.payment_id))
    }
}

/// One side of a channel's forwarding process: the four fee coefficients and
/// the queue of in-flight HTLCs, ordered by resolution time (earliest first)
/// and capped at `num_slots`.
#[derive(Debug, Clone)]
pub struct ChannelInDirection {
    pub success_base_fee: f64,
    pub success_fee_rate: f64,
    pub upfront_base_fee: f64,
    pub upfront_fee_rate: f64,
    num_slots: usize,
    slots: BinaryHeap<Reverse<Htlc>>,
}

impl ChannelInDirection {
    /// Creates a direction with the given slot count and zero fees.
    pub fn new(num_slots: usize) -> Self {
        debug_assert!(num_slots > 0);
        ChannelInDirection {
            success_base_fee: 0.0,
            success_fee_rate: 0.0,
            upfront_base_fee: 0.0,
            upfront_fee_rate: 0.0,
            num_slots,
            slots: BinaryHeap::with_capacity(num_slots),
        }
    }

    pub fn set_success_fee(&mut self, base: f64, rate: f64) {
        self.success_base_fee = base;
        self.success_fee_rate = rate;
    }

    pub fn set_upfront_fee(&mut self, base: f64, rate: f64) {
        self.upfront_base_fee = base;
        self.upfront_fee_rate = rate;
    }

    /// Success-case fee for forwarding the given payment body.
    pub fn success_fee(&self, body: f64) -> f64 {
        self.success_base_fee + self.success_fee_rate * body
    }

    /// Unconditional fee for the given amount. The amount already includes
    /// the success-case fee, which is what a routing node actually sees.
    pub fn upfront_fee(&self, amount: f64) -> f64 {
        self.upfront_base_fee + self.upfront_fee_rate * amount
    }

    /// Total fee for forwarding a payment body, used as the sort key when
    /// choosing among parallel channels.
    pub fn total_fee(&self, body: f64) -> f64 {
        let success_fee = self.success_fee(body);
        success_fee + self.upfront_fee(body + success_fee)
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_slots_occupied(&self) -> usize {
        self.slots.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.len() < self.num_slots
    }

    /// A channel direction is jammed at a given time if all slots are busy
    /// and the earliest in-flight HTLC cannot yet be resolved.
    pub fn is_jammed(&self, now: f64) -> bool {
        match self.peek_earliest() {
            Some(earliest) => !self.has_free_slot() && earliest.resolution_time > now,
            None => false,
        }
    }

    pub fn peek_earliest(&self) -> Option<&Htlc> {
        self.slots.peek().map(|h| &h.0)
    }

    pub fn pop_earliest(&mut self) -> Option<Htlc> {
        self.slots.pop().map(|h| h.0)
    }

    /// Stores an HTLC, refusing if the queue is full. The caller is expected
    /// to have freed a slot via [`ChannelInDirection::ensure_free_slot`].
    pub fn try_insert(&mut self, htlc: Htlc) -> bool {
        if !self.has_free_slot() {
            return false;
        }
        self.slots.push(Reverse(htlc));
        true
    }

    /// Makes sure a slot is available for a new HTLC. If the queue is full
    /// but the earliest HTLC has a resolution time in the past (non-strict:
    /// an HTLC expiring exactly now resolves), that HTLC is popped and
    /// returned so the caller can apply its fee effect. Returns whether a
    /// slot is available along with the released HTLC, if any.
    pub fn ensure_free_slot(&mut self, now: f64) -> (bool, Option<Htlc>) {
        if self.has_free_slot() {
            return (true, None);
        }
        match self.peek_earliest() {
            Some(earliest) if earliest.resolution_time <= now => (true, self.pop_earliest()),
            _ => (false, None),
        }
    }

    /// Drops all in-flight HTLCs without resolving them.
    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

/// A channel between two nodes: a capacity and up to two directional states.
/// A direction that is absent is disabled for forwarding.
#[derive(Debug, Clone)]
pub struct Channel {
    capacity: u64,
    directions: [Option<ChannelInDirection>; 2],
}

impl Channel {
    pub fn new(capacity: u64) -> Self {
        Channel {
            capacity,
            directions: [None, None],
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn enable_direction(&mut self, direction: Direction, state: ChannelInDirection) {
        debug_assert!(self.directions[direction.index()].is_none());
        self.directions[direction.index()] = Some(state);
    }

    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.directions[direction.index()].is_some()
    }

    pub fn direction(&self, direction: Direction) -> Option<&ChannelInDirection> {
        self.directions[direction.index()].as_ref()
    }

    pub fn direction_mut(&mut self, direction: Direction) -> Option<&mut ChannelInDirection> {
        self.directions[direction.index()].as_mut()
    }

    /// Whether this channel can forward the amount in the given direction.
    pub fn can_forward(&self, amount: f64, direction: Direction) -> bool {
        self.is_enabled(direction) && amount <= self.capacity as f64
    }

    fn reset(&mut self) {
        for direction in self.directions.iter_mut().flatten() {
            direction.reset();
        }
    }
}

/// The set of parallel channels between an unordered node pair. Routing picks
/// one channel per hop; selection is cheapest-first with channel id as the
/// tie-break for determinism.
#[derive(Debug, Clone, Default)]
pub struct Hop {
    channels: BTreeMap<ChannelId, Channel>,
}

impl Hop {
    pub fn channel(&self, cid: &ChannelId) -> Option<&Channel> {
        self.channels.get(cid)
    }

    pub fn channel_mut(&mut self, cid: &ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(cid)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &Channel)> {
        self.channels.iter()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// The cheapest channel that is enabled in the direction and can carry
    /// the amount. Iteration is in ascending channel id order and the strict
    /// comparison keeps the first of equally priced channels, which yields
    /// the id-ascending tie-break.
    pub fn cheapest_channel(
        &self,
        amount: f64,
        direction: Direction,
    ) -> Option<(&ChannelId, &ChannelInDirection)> {
        let mut best: Option<(&ChannelId, &ChannelInDirection, f64)> = None;
        for (cid, channel) in &self.channels {
            if !channel.can_forward(amount, direction) {
                continue;
            }
            let Some(state) = channel.direction(direction) else {
                continue;
            };
            let fee = state.total_fee(amount);
            match best {
                Some((_, _, best_fee)) if fee.total_cmp(&best_fee) != Ordering::Less => {},
                _ => best = Some((cid, state, fee)),
            }
        }
        best.map(|(cid, state, _)| (cid, state))
    }

    /// A hop is jammed in a direction if every one of its channels is.
    /// Channels with the direction disabled cannot be used at all and count
    /// as jammed.
    pub fn is_jammed(&self, direction: Direction, now: f64) -> bool {
        self.channels.values().all(|channel| match channel.direction(direction) {
            Some(state) => state.is_jammed(now),
            None => true,
        })
    }

    pub fn num_slots_occupied(&self, direction: Direction) -> usize {
        self.channels
            .values()
            .filter_map(|channel| channel.direction(direction))
            .map(|state| state.num_slots_occupied())
            .sum()
    }
}

/// One channel entry of a topology snapshot, following the scheme of CLN's
/// `listchannels`: each undirected channel appears once per direction, and a
/// direction missing from the snapshot (or marked inactive) is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotChannel {
    pub source: String,
    pub destination: String,
    pub short_channel_id: String,
    pub satoshis: u64,
    pub active: bool,
    #[serde(default)]
    pub base_fee_millisatoshi: Option<f64>,
    #[serde(default)]
    pub fee_per_millionth: Option<f64>,
}

/// A parsed topology snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub channels: Vec<SnapshotChannel>,
}

/// The network model owns every hop (and hence all channel state) and keeps
/// two views of the topology: the undirected hop store for state lookup and
/// mutation, and a directed routing adjacency with one entry per enabled
/// channel direction carrying only `(cid, capacity)`. It also owns the
/// revenue ledger, which is mutated only by HTLC resolution and by upfront
/// fee transfers at forward time.
#[derive(Debug, Clone)]
pub struct NetworkModel {
    hops: BTreeMap<(NodeId, NodeId), Hop>,
    routing: BTreeMap<NodeId, BTreeMap<NodeId, Vec<(ChannelId, u64)>>>,
    ledger: BTreeMap<NodeId, f64>,
}

fn hop_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn transfer_on_resolution(ledger: &mut BTreeMap<NodeId, f64>, htlc: &Htlc) {
    // Only an HTLC whose desired result is success moves the fee. A failed
    // HTLC returns the held amount upstream, and no fee is due for that.
    if htlc.desired_result {
        *ledger.entry(htlc.upstream.clone()).or_insert(0.0) -= htlc.success_fee;
        *ledger.entry(htlc.downstream.clone()).or_insert(0.0) += htlc.success_fee;
    }
}

impl NetworkModel {
    /// Builds a model from a parsed snapshot. Every channel direction gets
    /// `default_num_slots` slots; success fees come from the snapshot fields
    /// (millisatoshi base, per-millionth rate) and upfront fees start at
    /// zero until coefficients are applied.
    pub fn from_snapshot(
        snapshot: &Snapshot,
        default_num_slots: usize,
    ) -> Result<Self, SimulationError> {
        let mut model = NetworkModel {
            hops: BTreeMap::new(),
            routing: BTreeMap::new(),
            ledger: BTreeMap::new(),
        };

        for entry in &snapshot.channels {
            if entry.source == entry.destination {
                return Err(SimulationError::SnapshotError(format!(
                    "channel {} connects {} to itself",
                    entry.short_channel_id, entry.source
                )));
            }
            let src = NodeId::new(entry.source.clone());
            let dst = NodeId::new(entry.destination.clone());
            let cid = ChannelId::new(entry.short_channel_id.clone());

            model.ledger.entry(src.clone()).or_insert(0.0);
            model.ledger.entry(dst.clone()).or_insert(0.0);

            let hop = model.hops.entry(hop_key(&src, &dst)).or_default();
            let channel = hop
                .channels
                .entry(cid.clone())
                .or_insert_with(|| Channel::new(entry.satoshis));
            if channel.capacity != entry.satoshis {
                return Err(SimulationError::SnapshotError(format!(
                    "channel {} appears with capacities {} and {}",
                    cid, channel.capacity, entry.satoshis
                )));
            }

            if !entry.active {
                continue;
            }

            let direction = Direction::of(&src, &dst);
            if channel.is_enabled(direction) {
                return Err(SimulationError::SnapshotError(format!(
                    "channel {} direction {} -> {} appears twice",
                    cid, src, dst
                )));
            }
            let mut state = ChannelInDirection::new(default_num_slots);
            state.set_success_fee(
                entry.base_fee_millisatoshi.map_or(0.0, |msat| msat / 1000.0),
                entry.fee_per_millionth.map_or(0.0, |ppm| ppm / 1_000_000.0),
            );
            channel.enable_direction(direction, state);

            model
                .routing
                .entry(src)
                .or_default()
                .entry(dst)
                .or_default()
                .push((cid, entry.satoshis));
        }

        Ok(model)
    }

    /// Opens the attacker's channels: one from the jammer's sender node to
    /// every node it must reach targets through, and one from every node the
    /// jammer receives from back to its receiver node. These channels are
    /// enabled in one direction only, carry no fees, and get a widened slot
    /// count so that the attack is never bottlenecked on the attacker's own
    /// edges.
    pub fn add_jammer_edges(
        &mut self,
        jammer_sender: &NodeId,
        jammer_receiver: &NodeId,
        send_to: &[NodeId],
        receive_from: &[NodeId],
        num_slots: usize,
    ) {
        self.ledger.entry(jammer_sender.clone()).or_insert(0.0);
        self.ledger.entry(jammer_receiver.clone()).or_insert(0.0);

        for node in send_to.iter().collect::<BTreeSet<_>>() {
            if node == jammer_sender {
                continue;
            }
            let cid = ChannelId::new(format!("jammer-out-{node}"));
            self.insert_directed_channel(jammer_sender, node, cid, num_slots);
        }
        for node in receive_from.iter().collect::<BTreeSet<_>>() {
            if node == jammer_receiver {
                continue;
            }
            let cid = ChannelId::new(format!("jammer-in-{node}"));
            self.insert_directed_channel(node, jammer_receiver, cid, num_slots);
        }
    }

    fn insert_directed_channel(
        &mut self,
        upstream: &NodeId,
        downstream: &NodeId,
        cid: ChannelId,
        num_slots: usize,
    ) {
        self.ledger.entry(upstream.clone()).or_insert(0.0);
        self.ledger.entry(downstream.clone()).or_insert(0.0);

        let hop = self.hops.entry(hop_key(upstream, downstream)).or_default();
        let channel = hop
            .channels
            .entry(cid.clone())
            .or_insert_with(|| Channel::new(JAMMER_CHANNEL_CAPACITY));
        let direction = Direction::of(upstream, downstream);
        if !channel.is_enabled(direction) {
            channel.enable_direction(direction, ChannelInDirection::new(num_slots));
            self.routing
                .entry(upstream.clone())
                .or_default()
                .entry(downstream.clone())
                .or_default()
                .push((cid, JAMMER_CHANNEL_CAPACITY));
        }
    }

    pub fn hop(&self, a: &NodeId, b: &NodeId) -> Option<&Hop> {
        self.hops.get(&hop_key(a, b))
    }

    /// Looks up the directional state of a specific channel for a forward
    /// from `upstream` to `downstream`.
    pub fn channel_direction(
        &self,
        upstream: &NodeId,
        downstream: &NodeId,
        cid: &ChannelId,
    ) -> Option<&ChannelInDirection> {
        self.hops
            .get(&hop_key(upstream, downstream))?
            .channel(cid)?
            .direction(Direction::of(upstream, downstream))
    }

    pub fn channel_direction_mut(
        &mut self,
        upstream: &NodeId,
        downstream: &NodeId,
        cid: &ChannelId,
    ) -> Option<&mut ChannelInDirection> {
        self.hops
            .get_mut(&hop_key(upstream, downstream))?
            .channel_mut(cid)?
            .direction_mut(Direction::of(upstream, downstream))
    }

    pub fn channel_capacity(&self, a: &NodeId, b: &NodeId, cid: &ChannelId) -> Option<u64> {
        self.hops
            .get(&hop_key(a, b))?
            .channel(cid)
            .map(|channel| channel.capacity())
    }

    /// The directed routing adjacency: one `(cid, capacity)` entry per
    /// enabled channel direction. Used for path search only; all other
    /// channel state lives in the hop store.
    pub fn routing(&self) -> &BTreeMap<NodeId, BTreeMap<NodeId, Vec<(ChannelId, u64)>>> {
        &self.routing
    }

    /// Directed edges into the given node, as (upstream, node) pairs.
    pub fn in_edges(&self, node: &NodeId) -> Vec<(NodeId, NodeId)> {
        self.routing
            .iter()
            .filter(|(_, targets)| targets.contains_key(node))
            .map(|(from, _)| (from.clone(), node.clone()))
            .collect()
    }

    /// Directed edges out of the given node, as (node, downstream) pairs.
    pub fn out_edges(&self, node: &NodeId) -> Vec<(NodeId, NodeId)> {
        self.routing
            .get(node)
            .map(|targets| {
                targets.keys().map(|to| (node.clone(), to.clone())).collect()
            })
            .unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.ledger.keys()
    }

    pub fn credit(&mut self, node: &NodeId, amount: f64) {
        *self.ledger.entry(node.clone()).or_insert(0.0) += amount;
    }

    pub fn debit(&mut self, node: &NodeId, amount: f64) {
        *self.ledger.entry(node.clone()).or_insert(0.0) -= amount;
    }

    pub fn revenue(&self, node: &NodeId) -> f64 {
        self.ledger.get(node).copied().unwrap_or(0.0)
    }

    pub fn revenues(&self) -> &BTreeMap<NodeId, f64> {
        &self.ledger
    }

    /// Applies the fee effect of a resolved HTLC to the ledger.
    pub fn apply_htlc(&mut self, htlc: &Htlc) {
        transfer_on_resolution(&mut self.ledger, htlc);
    }

    /// Resolves every remaining in-flight HTLC against its own resolution
    /// time. Run after the event loop ends to realize the lazily deferred
    /// resolutions; afterwards every directional queue is empty.
    pub fn resolve_all_htlcs(&mut self) {
        for hop in self.hops.values_mut() {
            for channel in hop.channels.values_mut() {
                for state in channel.directions.iter_mut().flatten() {
                    while let Some(htlc) = state.pop_earliest() {
                        log::trace!(
                            "Draining HTLC from {} to {} with resolution time {}",
                            htlc.upstream,
                            htlc.downstream,
                            htlc.resolution_time
                        );
                        transfer_on_resolution(&mut self.ledger, &htlc);
                    }
                }
            }
        }
    }

    /// Sets the success-case fee coefficients on every enabled channel
    /// direction.
    pub fn set_success_fee_for_all(&mut self, base: f64, rate: f64) {
        for hop in self.hops.values_mut() {
            for channel in hop.channels.values_mut() {
                for state in channel.directions.iter_mut().flatten() {
                    state.set_success_fee(base, rate);
                }
            }
        }
    }

    /// Derives upfront fee coefficients on every enabled channel direction
    /// as multiples of its success-case coefficients.
    pub fn apply_upfront_coefficients(&mut self, base_coeff: f64, rate_coeff: f64) {
        for hop in self.hops.values_mut() {
            for channel in hop.channels.values_mut() {
                for state in channel.directions.iter_mut().flatten() {
                    state.set_upfront_fee(
                        base_coeff * state.success_base_fee,
                        rate_coeff * state.success_fee_rate,
                    );
                }
            }
        }
    }

    /// Clears all in-flight HTLCs and zeroes the revenue ledger. The
    /// topology and fee coefficients are left untouched so the model can be
    /// reused across runs.
    pub fn reset(&mut self) {
        for hop in self.hops.values_mut() {
            for channel in hop.channels.values_mut() {
                channel.reset();
            }
        }
        for revenue in self.ledger.values_mut() {
            *revenue = 0.0;
        }
    }
}
