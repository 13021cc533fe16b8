use crate::network::{Direction, ForwardingError, NetworkModel};
use crate::{ChannelId, NodeId};

/// The per-hop share of a payment. The body is what the downstream node
/// receives; the amount is the body plus this hop's success-case fee; the
/// upfront fee is levied on the amount, which is all a routing node sees.
#[derive(Debug, Clone)]
pub struct HopPayment {
    pub upstream: NodeId,
    pub downstream: NodeId,
    pub cid: ChannelId,
    pub body: f64,
    pub amount: f64,
    pub success_fee: f64,
    pub upfront_fee: f64,
}

/// A payment built for one route attempt: one [`HopPayment`] per hop,
/// ordered sender-side first. The forwarding engine consumes it left to
/// right and discards it after delivery or failure.
#[derive(Debug, Clone)]
pub struct Payment {
    pub hops: Vec<HopPayment>,
    pub desired_result: bool,
    pub processing_delay: f64,
}

impl Payment {
    /// Builds a payment along a route by walking it backwards from the
    /// receiver. At each hop the cheapest qualifying channel is chosen, the
    /// success fee is charged on the amount forwarded downstream, and the
    /// upfront fee on the resulting hop amount. Fails with
    /// `NoCapableChannel` if some hop has no enabled channel with enough
    /// capacity.
    pub fn along_route(
        model: &NetworkModel,
        route: &[NodeId],
        receiver_amount: u64,
        processing_delay: f64,
        desired_result: bool,
    ) -> Result<Payment, ForwardingError> {
        debug_assert!(route.len() >= 2);
        let mut hops = Vec::with_capacity(route.len() - 1);
        let mut downstream_amount = receiver_amount as f64;

        for pair in route.windows(2).rev() {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            let direction = Direction::of(upstream, downstream);
            let (cid, state) = model
                .hop(upstream, downstream)
                .and_then(|hop| hop.cheapest_channel(downstream_amount, direction))
                .ok_or_else(|| {
                    ForwardingError::NoCapableChannel(
                        upstream.clone(),
                        downstream.clone(),
                        downstream_amount,
                    )
                })?;

            let body = downstream_amount;
            let success_fee = state.success_fee(body);
            let amount = body + success_fee;
            let upfront_fee = state.upfront_fee(amount);

            hops.push(HopPayment {
                upstream: upstream.clone(),
                downstream: downstream.clone(),
                cid: cid.clone(),
                body,
                amount,
                success_fee,
                upfront_fee,
            });
            downstream_amount = amount;
        }

        hops.reverse();
        Ok(Payment {
            hops,
            desired_result,
            processing_delay,
        })
    }

    /// What the sender pays on entry: the outermost hop amount.
    pub fn total_amount(&self) -> f64 {
        self.hops.first().map_or(0.0, |hop| hop.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Snapshot, SnapshotChannel};

    /// A three hop line A - B - C - D where every direction charges the same
    /// linear fees, set explicitly below.
    fn line_model() -> NetworkModel {
        let mut channels = vec![];
        for (i, (a, b)) in [("A", "B"), ("B", "C"), ("C", "D")].iter().enumerate() {
            for (src, dst) in [(a, b), (b, a)] {
                channels.push(SnapshotChannel {
                    source: src.to_string(),
                    destination: dst.to_string(),
                    short_channel_id: format!("cid-{i}"),
                    satoshis: 1_000_000,
                    active: true,
                    base_fee_millisatoshi: None,
                    fee_per_millionth: None,
                });
            }
        }
        NetworkModel::from_snapshot(&Snapshot { channels }, 483).unwrap()
    }

    fn route(nodes: &[&str]) -> Vec<NodeId> {
        nodes.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn fees_accumulate_backwards_along_the_route() {
        let mut model = line_model();
        model.set_success_fee_for_all(1.0, 0.01);
        model.apply_upfront_coefficients(2.0, 0.5);

        let payment =
            Payment::along_route(&model, &route(&["A", "B", "C", "D"]), 100, 1.0, true).unwrap();
        assert_eq!(payment.hops.len(), 3);

        // Last hop: body 100, success fee 1 + 0.01 * 100 = 2.
        let last = &payment.hops[2];
        assert_eq!(last.body, 100.0);
        assert_eq!(last.success_fee, 2.0);
        assert_eq!(last.amount, 102.0);
        // Upfront fees are levied on the amount: 2 + 0.005 * 102.
        assert!((last.upfront_fee - 2.51).abs() < 1e-9);

        // Middle hop forwards the last hop's amount as its body.
        let middle = &payment.hops[1];
        assert_eq!(middle.body, 102.0);
        assert_eq!(middle.success_fee, 1.0 + 0.01 * 102.0);
        assert_eq!(middle.amount, middle.body + middle.success_fee);

        // The outermost amount is what the sender pays on entry.
        let first = &payment.hops[0];
        assert_eq!(first.body, middle.amount);
        assert_eq!(payment.total_amount(), first.amount);

        // Hops run sender side first.
        assert_eq!(first.upstream, NodeId::from("A"));
        assert_eq!(last.downstream, NodeId::from("D"));
    }

    #[test]
    fn zero_fees_pass_the_amount_through_unchanged() {
        let model = line_model();
        let payment =
            Payment::along_route(&model, &route(&["A", "B", "C", "D"]), 354, 7.0, false).unwrap();
        for hop in &payment.hops {
            assert_eq!(hop.body, 354.0);
            assert_eq!(hop.amount, 354.0);
            assert_eq!(hop.success_fee, 0.0);
            assert_eq!(hop.upfront_fee, 0.0);
        }
        assert!(!payment.desired_result);
        assert_eq!(payment.processing_delay, 7.0);
    }

    #[test]
    fn construction_fails_without_a_capable_channel() {
        let model = line_model();
        // 2 million exceeds every channel capacity.
        let result = Payment::along_route(&model, &route(&["A", "B"]), 2_000_000, 1.0, true);
        assert!(matches!(result, Err(ForwardingError::NoCapableChannel(_, _, _))));

        // No channel exists between A and C at all.
        let result = Payment::along_route(&model, &route(&["A", "C"]), 100, 1.0, true);
        assert!(matches!(result, Err(ForwardingError::NoCapableChannel(_, _, _))));
    }
}
