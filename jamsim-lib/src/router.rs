use crate::network::NetworkModel;
use crate::NodeId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Share of extra capacity required on top of the payment amount when
/// filtering routing edges, to leave room for the fees that are not known
/// until the payment is constructed.
const CAPACITY_FILTERING_SAFETY_MARGIN: f64 = 0.05;

/// A path-search view over the routing graph, filtered down to the edges
/// that can carry a given amount (with a safety margin for fees). Parallel
/// channels collapse to a single directed edge here; the concrete channel is
/// picked later, per hop, when the payment is constructed.
pub struct Router {
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
    max_route_length: usize,
}

impl Router {
    pub fn new(model: &NetworkModel, amount: u64, max_route_length: usize) -> Self {
        let required = (1.0 + CAPACITY_FILTERING_SAFETY_MARGIN) * amount as f64;
        let mut adjacency: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (from, targets) in model.routing() {
            for (to, edges) in targets {
                if edges.iter().any(|(_, capacity)| *capacity as f64 >= required) {
                    adjacency.entry(from.clone()).or_default().insert(to.clone());
                }
            }
        }
        Router {
            adjacency,
            max_route_length,
        }
    }

    pub fn has_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        self.adjacency.get(from).is_some_and(|next| next.contains(to))
    }

    /// One shortest path (by hop count) from `from` to `to`, or none if `to`
    /// is unreachable. BFS explores successors in identifier order, so the
    /// result is deterministic and equals the first path that
    /// [`Router::shortest_paths`] yields.
    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<Vec<NodeId>> {
        self.shortest_paths(from, to).next()
    }

    /// All shortest paths from `from` to `to`, enumerated lazily in
    /// deterministic order.
    pub fn shortest_paths(&self, from: &NodeId, to: &NodeId) -> AllShortestPaths {
        if from == to {
            return AllShortestPaths::trivial(from.clone());
        }

        // BFS from the source, remembering every predecessor that lies on
        // some shortest path.
        let mut dist: BTreeMap<&NodeId, usize> = BTreeMap::new();
        let mut preds: BTreeMap<&NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut queue = VecDeque::new();
        dist.insert(from, 0);
        queue.push_back(from);
        while let Some(node) = queue.pop_front() {
            let node_dist = dist[node];
            if let Some(target_dist) = dist.get(to) {
                if node_dist + 1 > *target_dist {
                    break;
                }
            }
            let Some(successors) = self.adjacency.get(node) else {
                continue;
            };
            for next in successors {
                match dist.get(next) {
                    None => {
                        dist.insert(next, node_dist + 1);
                        preds.entry(next).or_default().push(node.clone());
                        queue.push_back(next);
                    },
                    Some(d) if *d == node_dist + 1 => {
                        preds.entry(next).or_default().push(node.clone());
                    },
                    Some(_) => {},
                }
            }
        }

        if !dist.contains_key(to) {
            return AllShortestPaths::empty();
        }
        let preds = preds
            .into_iter()
            .map(|(node, mut list)| {
                list.sort();
                (node.clone(), list)
            })
            .collect();
        AllShortestPaths::new(from.clone(), to.clone(), preds)
    }

    /// Routes for an honest payment: shortest paths from sender to receiver.
    /// If `via` is non-empty, the route must pass through those nodes in
    /// order; it is assembled by concatenating exact shortest sub-paths, so
    /// nodes may repeat only as those sub-paths produce them. Variants are
    /// enumerated over the first segment; later segments are pinned to their
    /// deterministic shortest path.
    pub fn honest_routes(
        &self,
        sender: &NodeId,
        receiver: &NodeId,
        via: &[NodeId],
    ) -> HonestRoutes {
        let first_anchor = via.first().unwrap_or(receiver);
        let first_segment = self.shortest_paths(sender, first_anchor);

        let mut rest = vec![first_anchor.clone()];
        let mut anchors: Vec<&NodeId> = via.iter().collect();
        anchors.push(receiver);
        for pair in anchors.windows(2) {
            match self.shortest_path(pair[0], pair[1]) {
                Some(sub) => rest.extend_from_slice(&sub[1..]),
                None => {
                    return HonestRoutes {
                        first_segment: AllShortestPaths::empty(),
                        rest: vec![],
                    }
                },
            }
        }

        HonestRoutes {
            first_segment,
            rest,
        }
    }

    /// A generator of jamming routes threading as many target pairs as
    /// possible, driven batch by batch by the engine.
    pub fn jamming_routes(
        &self,
        sender: &NodeId,
        receiver: &NodeId,
        targets: &[(NodeId, NodeId)],
        max_target_pairs_per_route: usize,
    ) -> JammingRoutes<'_> {
        let size = max_target_pairs_per_route.min(targets.len());
        JammingRoutes {
            router: self,
            sender: sender.clone(),
            receiver: receiver.clone(),
            targets: targets.to_vec(),
            size,
            combination: (0..size).collect(),
            permutation: (0..size).collect(),
            exhausted: size == 0,
        }
    }

    /// Builds a route `sender -> p1.0 -> p1.1 -> ... -> pn.1 -> receiver` by
    /// concatenating shortest sub-paths between consecutive anchors. Each
    /// target pair must be a direct edge. The route may revisit nodes and
    /// edges; only the total length is capped.
    fn route_via_pairs(
        &self,
        sender: &NodeId,
        receiver: &NodeId,
        pairs: &[&(NodeId, NodeId)],
    ) -> Option<Vec<NodeId>> {
        let (first_upstream, _) = pairs.first()?;
        let mut route = self.shortest_path(sender, first_upstream)?;
        let mut prev_downstream: Option<&NodeId> = None;

        for (upstream, downstream) in pairs.iter() {
            if !self.has_edge(upstream, downstream) {
                return None;
            }
            if let Some(prev) = prev_downstream {
                if prev != upstream {
                    let sub = self.shortest_path(prev, upstream)?;
                    route.extend_from_slice(&sub[1..]);
                }
            }
            route.push(downstream.clone());
            if route.len() > self.max_route_length + 1 {
                return None;
            }
            prev_downstream = Some(downstream);
        }

        let tail = self.shortest_path(prev_downstream?, receiver)?;
        route.extend_from_slice(&tail[1..]);
        if route.len() > self.max_route_length + 1 {
            return None;
        }
        Some(route)
    }
}

/// Lazy enumeration of all shortest paths between two nodes, walking the BFS
/// predecessor DAG depth-first from the target back to the source.
pub struct AllShortestPaths {
    source: NodeId,
    preds: BTreeMap<NodeId, Vec<NodeId>>,
    /// Work stack of partial paths, stored reversed (target first).
    stack: Vec<Vec<NodeId>>,
}

impl AllShortestPaths {
    fn new(source: NodeId, target: NodeId, preds: BTreeMap<NodeId, Vec<NodeId>>) -> Self {
        AllShortestPaths {
            source,
            preds,
            stack: vec![vec![target]],
        }
    }

    fn empty() -> Self {
        AllShortestPaths {
            source: NodeId::new(""),
            preds: BTreeMap::new(),
            stack: vec![],
        }
    }

    fn trivial(node: NodeId) -> Self {
        AllShortestPaths {
            source: node.clone(),
            preds: BTreeMap::new(),
            stack: vec![vec![node]],
        }
    }
}

impl Iterator for AllShortestPaths {
    type Item = Vec<NodeId>;

    fn next(&mut self) -> Option<Vec<NodeId>> {
        while let Some(partial) = self.stack.pop() {
            let frontier = partial.last().expect("partial paths are never empty");
            if *frontier == self.source {
                let mut path = partial;
                path.reverse();
                return Some(path);
            }
            if let Some(preds) = self.preds.get(frontier) {
                // Push in reverse so that the smallest predecessor is
                // explored first.
                for pred in preds.iter().rev() {
                    let mut extended = partial.clone();
                    extended.push(pred.clone());
                    self.stack.push(extended);
                }
            }
        }
        None
    }
}

/// Honest route iterator: every shortest-path variant of the first segment,
/// each concatenated with the fixed remainder through the via nodes.
pub struct HonestRoutes {
    first_segment: AllShortestPaths,
    /// Path from the first anchor to the receiver, starting at the anchor.
    rest: Vec<NodeId>,
}

impl Iterator for HonestRoutes {
    type Item = Vec<NodeId>;

    fn next(&mut self) -> Option<Vec<NodeId>> {
        let mut head = self.first_segment.next()?;
        head.extend_from_slice(&self.rest[1..]);
        Some(head)
    }
}

/// Jamming route generator: iterates subset sizes from the configured
/// maximum down to one, and for each size the subsets of the target list
/// (lexicographic by index) and their permutations (lexicographic). State
/// advances lazily; each yielded candidate is first re-checked against the
/// caller's live set of still-unjammed targets so that removals made during
/// the batch prune the search.
pub struct JammingRoutes<'a> {
    router: &'a Router,
    sender: NodeId,
    receiver: NodeId,
    targets: Vec<(NodeId, NodeId)>,
    size: usize,
    combination: Vec<usize>,
    permutation: Vec<usize>,
    exhausted: bool,
}

impl JammingRoutes<'_> {
    /// The next route that threads only still-unjammed targets, or none when
    /// the enumeration is exhausted.
    pub fn next_route(&mut self, unjammed: &BTreeSet<(NodeId, NodeId)>) -> Option<Vec<NodeId>> {
        while !self.exhausted {
            let subset_is_live = self
                .combination
                .iter()
                .all(|&i| unjammed.contains(&self.targets[i]));
            if !subset_is_live {
                // No permutation of a dead subset can help; skip them all.
                self.advance_combination();
                continue;
            }

            let pairs: Vec<&(NodeId, NodeId)> = self
                .permutation
                .iter()
                .map(|&i| &self.targets[self.combination[i]])
                .collect();
            let route = self
                .router
                .route_via_pairs(&self.sender, &self.receiver, &pairs);
            self.advance_permutation();
            if let Some(route) = route {
                log::trace!("Yielding jamming route {route:?}");
                return Some(route);
            }
        }
        None
    }

    fn advance_permutation(&mut self) {
        if !next_permutation(&mut self.permutation) {
            self.advance_combination();
        }
    }

    fn advance_combination(&mut self) {
        if next_combination(&mut self.combination, self.targets.len()) {
            self.permutation = (0..self.size).collect();
            return;
        }
        // Subsets of this size are exhausted; drop to the next smaller size.
        if self.size <= 1 {
            self.exhausted = true;
            return;
        }
        self.size -= 1;
        self.combination = (0..self.size).collect();
        self.permutation = (0..self.size).collect();
    }
}

/// Advances `p` to the lexicographically next permutation, returning false
/// (and leaving `p` in its last state) when it was already the final one.
fn next_permutation(p: &mut [usize]) -> bool {
    let n = p.len();
    if n < 2 {
        return false;
    }
    let mut i = n - 1;
    while i > 0 && p[i - 1] >= p[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = n - 1;
    while p[j] <= p[i - 1] {
        j -= 1;
    }
    p.swap(i - 1, j);
    p[i..].reverse();
    true
}

/// Advances an ascending index combination drawn from `0..m` to the next
/// one, returning false when exhausted.
fn next_combination(c: &mut [usize], m: usize) -> bool {
    let k = c.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if c[i] != i + m - k {
            c[i] += 1;
            for j in i + 1..k {
                c[j] = c[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Snapshot, SnapshotChannel};
    use crate::ChannelId;

    fn channel(src: &str, dst: &str, cid: &str, satoshis: u64) -> SnapshotChannel {
        SnapshotChannel {
            source: src.to_string(),
            destination: dst.to_string(),
            short_channel_id: cid.to_string(),
            satoshis,
            active: true,
            base_fee_millisatoshi: None,
            fee_per_millionth: None,
        }
    }

    fn both_ways(src: &str, dst: &str, cid: &str, satoshis: u64) -> Vec<SnapshotChannel> {
        vec![
            channel(src, dst, cid, satoshis),
            channel(dst, src, cid, satoshis),
        ]
    }

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    fn route(nodes: &[&str]) -> Vec<NodeId> {
        nodes.iter().map(|n| node(n)).collect()
    }

    /// A diamond: A - B - D and A - C - D, both of length two.
    fn diamond() -> NetworkModel {
        let mut channels = vec![];
        channels.extend(both_ways("A", "B", "cid-ab", 1_000_000));
        channels.extend(both_ways("A", "C", "cid-ac", 1_000_000));
        channels.extend(both_ways("B", "D", "cid-bd", 1_000_000));
        channels.extend(both_ways("C", "D", "cid-cd", 1_000_000));
        NetworkModel::from_snapshot(&Snapshot { channels }, 483).unwrap()
    }

    /// The wheel topology of the worked jamming example: a Sender feeding
    /// Alice, with Hub connected to both Alice and Bob.
    fn wheel() -> NetworkModel {
        let mut channels = vec![channel("Sender", "Alice", "cid-sa", 1_000_000)];
        channels.extend(both_ways("Alice", "Hub", "cid-ah", 1_000_000));
        channels.extend(both_ways("Bob", "Hub", "cid-bh", 1_000_000));
        NetworkModel::from_snapshot(&Snapshot { channels }, 483).unwrap()
    }

    #[test]
    fn shortest_paths_yields_every_minimal_path_deterministically() {
        let model = diamond();
        let router = Router::new(&model, 100, 20);
        let paths: Vec<_> = router.shortest_paths(&node("A"), &node("D")).collect();
        assert_eq!(
            paths,
            vec![route(&["A", "B", "D"]), route(&["A", "C", "D"])]
        );

        // Unreachable target yields nothing.
        assert!(router.shortest_paths(&node("D"), &node("Z")).next().is_none());

        // Trivial path from a node to itself.
        assert_eq!(
            router.shortest_path(&node("A"), &node("A")).unwrap(),
            route(&["A"])
        );
    }

    #[test]
    fn capacity_filter_applies_a_fee_safety_margin() {
        let mut channels = both_ways("A", "B", "cid-ab", 1_000);
        channels.extend(both_ways("B", "C", "cid-bc", 1_000_000));
        let model = NetworkModel::from_snapshot(&Snapshot { channels }, 483).unwrap();

        // 1000 sats of capacity carry a 900 sat payment (945 with margin)...
        let router = Router::new(&model, 900, 20);
        assert!(router.has_edge(&node("A"), &node("B")));

        // ...but not a 990 sat one (1039.5 with margin).
        let router = Router::new(&model, 990, 20);
        assert!(!router.has_edge(&node("A"), &node("B")));
        assert!(router.has_edge(&node("B"), &node("C")));
    }

    #[test]
    fn honest_routes_respect_must_route_via() {
        let model = wheel();
        let router = Router::new(&model, 100, 20);

        // Alice - Hub - Bob is forced through the hub even though the hub is
        // already on every path; the shape matters with richer graphs.
        let routes: Vec<_> = router
            .honest_routes(&node("Alice"), &node("Bob"), &[node("Hub")])
            .collect();
        assert_eq!(routes, vec![route(&["Alice", "Hub", "Bob"])]);

        // A via node that cannot be reached produces no routes.
        let mut routes = router.honest_routes(&node("Alice"), &node("Bob"), &[node("Nowhere")]);
        assert!(routes.next().is_none());
    }

    #[test]
    fn honest_routes_enumerate_first_segment_variants() {
        let model = diamond();
        let router = Router::new(&model, 100, 20);
        let routes: Vec<_> = router
            .honest_routes(&node("A"), &node("D"), &[])
            .collect();
        assert_eq!(
            routes,
            vec![route(&["A", "B", "D"]), route(&["A", "C", "D"])]
        );
    }

    #[test]
    fn jamming_route_threads_targets_into_a_looped_route() {
        let model = wheel();
        let router = Router::new(&model, 354, 20);

        let targets = vec![
            (node("Alice"), node("Hub")),
            (node("Hub"), node("Alice")),
            (node("Hub"), node("Bob")),
        ];
        let unjammed: BTreeSet<_> = targets.iter().cloned().collect();
        let mut generator = router.jamming_routes(&node("Sender"), &node("Bob"), &targets, 3);

        // The first candidate is the identity permutation of the full
        // subset, which produces the looped route of the worked example:
        // the same Alice -> Hub edge is traversed twice.
        let first = generator.next_route(&unjammed).unwrap();
        assert_eq!(first, route(&["Sender", "Alice", "Hub", "Alice", "Hub", "Bob"]));
    }

    #[test]
    fn jamming_generator_skips_subsets_with_jammed_targets() {
        let model = wheel();
        let router = Router::new(&model, 354, 20);

        let targets = vec![
            (node("Alice"), node("Hub")),
            (node("Hub"), node("Bob")),
        ];
        let mut generator = router.jamming_routes(&node("Sender"), &node("Bob"), &targets, 2);

        // Only the second target is still unjammed: all subsets touching
        // the first are skipped without being yielded.
        let unjammed: BTreeSet<_> = [(node("Hub"), node("Bob"))].into_iter().collect();
        let next = generator.next_route(&unjammed).unwrap();
        assert_eq!(next, route(&["Sender", "Alice", "Hub", "Bob"]));

        // Nothing is left once every target is jammed.
        let empty = BTreeSet::new();
        assert!(generator.next_route(&empty).is_none());
    }

    #[test]
    fn jamming_routes_honor_the_length_cap() {
        let model = wheel();
        let router = Router::new(&model, 354, 3);

        let targets = vec![
            (node("Alice"), node("Hub")),
            (node("Hub"), node("Alice")),
            (node("Hub"), node("Bob")),
        ];
        let unjammed: BTreeSet<_> = targets.iter().cloned().collect();
        let mut generator = router.jamming_routes(&node("Sender"), &node("Bob"), &targets, 3);

        // With at most three hops the looped route is out; the generator
        // falls through to smaller subsets that still fit.
        let first = generator.next_route(&unjammed).unwrap();
        assert!(first.len() <= 4);
    }

    #[test]
    fn permutations_and_combinations_advance_lexicographically() {
        let mut p = vec![0, 1, 2];
        assert!(next_permutation(&mut p));
        assert_eq!(p, vec![0, 2, 1]);
        assert!(next_permutation(&mut p));
        assert_eq!(p, vec![1, 0, 2]);
        p = vec![2, 1, 0];
        assert!(!next_permutation(&mut p));

        let mut c = vec![0, 1];
        assert!(next_combination(&mut c, 4));
        assert_eq!(c, vec![0, 2]);
        c = vec![0, 3];
        assert!(next_combination(&mut c, 4));
        assert_eq!(c, vec![1, 2]);
        c = vec![2, 3];
        assert!(!next_combination(&mut c, 4));
    }

    #[test]
    fn router_ignores_channel_identity_for_path_search() {
        // Parallel channels collapse to one edge in the search view.
        let mut channels = both_ways("A", "B", "cid-1", 1_000_000);
        channels.extend(both_ways("A", "B", "cid-2", 1_000_000));
        let model = NetworkModel::from_snapshot(&Snapshot { channels }, 483).unwrap();
        let router = Router::new(&model, 100, 20);
        let paths: Vec<_> = router.shortest_paths(&node("A"), &node("B")).collect();
        assert_eq!(paths.len(), 1);

        // The hop itself still exposes both channels for selection.
        let hop = model.hop(&node("A"), &node("B")).unwrap();
        assert_eq!(hop.num_channels(), 2);
        assert!(hop.channel(&ChannelId::from("cid-1")).is_some());
    }
}
