//! Simulated message transport.
//!
//! Outbound messages produced during a tick land in an outbox. At the end
//! of the tick the outbox is flushed: broadcasts are expanded against the
//! membership of that moment into one owned copy per recipient. Delivery
//! draws a shuffled, capped subset of the pending queue; messages that
//! lose the delivery draw stay queued for a later tick.

use quorum_core::Membership;
use quorum_env::{AgentId, Message, Recipient};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

/// One addressed copy of `msg` per recipient in `membership`, sender
/// excluded.
pub(crate) fn expand(msg: &Message, membership: &Membership) -> Vec<Message> {
    let targets: Vec<AgentId> = match msg.receiver {
        Recipient::Agent(target) => vec![target],
        Recipient::All => membership.all().collect(),
        Recipient::Servers => membership.servers().iter().copied().collect(),
        Recipient::Clients => membership.clients().iter().copied().collect(),
    };

    targets
        .into_iter()
        .filter(|target| *target != msg.sender)
        .map(|target| msg.addressed_to(target))
        .collect()
}

/// Counters kept by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Messages handed to the network
    pub submitted: u64,

    /// Concrete copies created by broadcast expansion
    pub expanded: u64,

    /// Messages delivered to agents
    pub delivered: u64,

    /// Broadcasts that found no recipient
    pub unroutable: u64,
}

/// Pending-message queue with broadcast fan-out.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    /// Concrete, addressed messages waiting for delivery
    pending: Vec<Message>,

    /// Output of the current tick, not yet expanded
    outbox: Vec<Message>,

    /// Per-step delivery cap
    max_messages_per_step: usize,

    /// Chance that a selected message is delivered this tick
    delivery_probability: f64,

    stats: NetworkStats,
}

impl SimNetwork {
    /// Creates an empty network.
    pub fn new(max_messages_per_step: usize, delivery_probability: f64) -> Self {
        Self {
            pending: Vec::new(),
            outbox: Vec::new(),
            max_messages_per_step,
            delivery_probability: delivery_probability.clamp(0.0, 1.0),
            stats: NetworkStats::default(),
        }
    }

    /// Buffers a message until the end of the tick.
    pub fn submit(&mut self, msg: Message) {
        self.stats.submitted += 1;
        self.outbox.push(msg);
    }

    /// Expands the outbox into the pending queue.
    ///
    /// Broadcast recipients are resolved against `membership` now, not at
    /// send time. The sender never receives its own broadcast. Returns the
    /// number of messages queued.
    pub fn flush(&mut self, membership: &Membership) -> usize {
        let before = self.pending.len();

        for msg in std::mem::take(&mut self.outbox) {
            if !msg.receiver.is_broadcast() {
                self.pending.push(msg);
                continue;
            }

            let copies = expand(&msg, membership);
            if copies.is_empty() {
                trace!(%msg, "broadcast without recipients");
                self.stats.unroutable += 1;
            }
            self.stats.expanded += copies.len() as u64;
            self.pending.extend(copies);
        }

        self.pending.len() - before
    }

    /// Draws this tick's deliveries.
    pub fn select<R: Rng>(&mut self, rng: &mut R) -> Vec<Message> {
        self.pending.shuffle(rng);

        let mut batch = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for msg in self.pending.drain(..) {
            let deliver = batch.len() < self.max_messages_per_step
                && (self.delivery_probability >= 1.0 || rng.gen::<f64>() < self.delivery_probability);
            if deliver {
                batch.push(msg);
            } else {
                kept.push(msg);
            }
        }
        self.pending = kept;

        self.stats.delivered += batch.len() as u64;
        batch
    }

    /// Messages queued for delivery.
    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    /// True when nothing is queued or buffered.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.outbox.is_empty()
    }

    /// Transport counters.
    pub fn stats(&self) -> NetworkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_env::{Payload, Token, TokenId};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn membership(servers: u64, clients: u64) -> Membership {
        let mut membership = Membership::default();
        for i in 0..servers {
            membership.add_server(AgentId::from_seed(i));
        }
        for i in 0..clients {
            membership.add_client(AgentId::from_seed(100 + i));
        }
        membership
    }

    #[test]
    fn test_broadcast_resolved_at_expansion_time() {
        let mut membership = membership(5, 3);
        let mut network = SimNetwork::new(100, 1.0);

        let client = AgentId::from_seed(100);
        network.submit(Message::get_tokens(client, 1));

        // Two clients join the servers before the tick ends
        membership.promote(AgentId::from_seed(101));
        membership.promote(AgentId::from_seed(102));

        assert_eq!(network.flush(&membership), 7);
        assert!(network
            .pending()
            .iter()
            .all(|m| m.target().is_some_and(|t| membership.servers().contains(&t))));
    }

    #[test]
    fn test_sender_excluded_from_own_broadcast() {
        let membership = membership(3, 2);
        let mut network = SimNetwork::new(100, 1.0);
        let server = AgentId::from_seed(0);

        network.submit(Message::new(server, Recipient::All, Payload::TurnedToClient));

        assert_eq!(network.flush(&membership), 4);
        assert!(network.pending().iter().all(|m| m.target() != Some(server)));
    }

    #[test]
    fn test_fan_out_copies_are_independent() {
        let membership = membership(3, 0);
        let mut network = SimNetwork::new(100, 1.0);
        let sender = AgentId::from_seed(50);
        let tokens = vec![Token::new(TokenId::from_seed(1))];

        network.submit(Message::new(
            sender,
            Recipient::Servers,
            Payload::DbUpdate { request: 1, tokens },
        ));
        network.flush(&membership);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut batch = network.select(&mut rng);
        if let Payload::DbUpdate { tokens, .. } = &mut batch[0].payload {
            tokens[0].version = 99;
        }
        for other in &batch[1..] {
            match &other.payload {
                Payload::DbUpdate { tokens, .. } => assert_eq!(tokens[0].version, 0),
                p => panic!("unexpected payload {p:?}"),
            }
        }
    }

    #[test]
    fn test_select_respects_cap() {
        let membership = membership(6, 0);
        let mut network = SimNetwork::new(4, 1.0);
        network.submit(Message::get_tokens(AgentId::from_seed(100), 1));
        network.flush(&membership);

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(network.select(&mut rng).len(), 4);
        assert_eq!(network.pending().len(), 2);
        assert_eq!(network.select(&mut rng).len(), 2);
        assert!(network.is_idle());
        assert_eq!(network.stats().delivered, 6);
    }

    proptest::proptest! {
        #[test]
        fn prop_fan_out_matches_membership(servers in 1u64..9, clients in 1u64..6, sender in 0u64..20) {
            let membership = membership(servers, clients);
            let sender = AgentId::from_seed(sender);
            let mut network = SimNetwork::new(1000, 1.0);

            network.submit(Message::new(sender, Recipient::All, Payload::TurnedToClient));
            let queued = network.flush(&membership);

            let member = membership.all().any(|id| id == sender);
            let expected = (servers + clients) as usize - usize::from(member);
            proptest::prop_assert_eq!(queued, expected);
        }
    }

    #[test]
    fn test_select_is_deterministic() {
        let membership = membership(5, 0);
        let run = || {
            let mut network = SimNetwork::new(3, 0.5);
            network.submit(Message::get_tokens(AgentId::from_seed(100), 1));
            network.flush(&membership);
            let mut rng = ChaCha8Rng::seed_from_u64(11);
            network.select(&mut rng)
        };

        assert_eq!(run(), run());
    }
}
