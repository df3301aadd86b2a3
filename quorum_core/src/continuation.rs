//! Continuations: deferred handlers that resume once enough replies arrive.
//!
//! An agent that sends a request registers a [`Continuation`] describing
//! which replies it waits for, how many it needs and what to do next. The
//! registry is an arena keyed by operation id; ids grow monotonically, so
//! iteration order is registration (FIFO) order.

use crate::quorum::Quota;
use quorum_env::{AgentId, Message, Payload, TokenId};
use std::collections::BTreeMap;

/// Identifier of a pending operation within one agent.
pub type OpId = u64;

/// Which replies a continuation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFilter {
    /// `ACK_PAY` for exactly this token and proposed version
    AckPay { token: TokenId, version: u64 },
    /// `ACK_GET_TOKENS` answering this request
    AckGetTokens { request: u64 },
    /// `ACK_DB_UPDATE` answering this request
    AckDbUpdate { request: u64 },
}

impl ReplyFilter {
    /// True if `msg` is a reply this continuation waits for.
    pub fn matches(&self, msg: &Message) -> bool {
        match (self, &msg.payload) {
            (
                ReplyFilter::AckPay { token, version },
                Payload::AckPay {
                    token: t,
                    version: v,
                },
            ) => token == t && version == v,
            (ReplyFilter::AckGetTokens { request }, Payload::AckGetTokens { request: r, .. }) => {
                request == r
            }
            (ReplyFilter::AckDbUpdate { request }, Payload::AckDbUpdate { request: r }) => {
                request == r
            }
            _ => false,
        }
    }
}

/// Why a read was issued, and therefore what happens when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPurpose {
    /// A plain GET_TOKENS operation
    Standalone,
    /// First phase of a PAY: chain into the transfer
    ThenPay { token: TokenId, recipient: AgentId },
    /// Replica refresh before a client turns into a server
    Promotion,
}

/// What to run when a continuation fires, with its captured context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Merge the snapshots, then act on `purpose`
    FinishRead { purpose: ReadPurpose },
    /// Complete the transfer locally
    FinishPay {
        token: TokenId,
        recipient: AgentId,
        version: u64,
    },
    /// Replica pushed to enough peers; leave the server set
    FinishDemotion,
}

/// A registered continuation.
#[derive(Debug, Clone)]
pub struct Continuation {
    /// Operation id (arena key)
    pub op: OpId,

    /// Accepted replies
    pub filter: ReplyFilter,

    /// Required distinct replies, resolved against live membership
    pub quota: Quota,

    /// Replies collected so far, one per sender
    pub replies: BTreeMap<AgentId, Message>,

    /// Handler to run on completion
    pub resume: Resume,
}

impl Continuation {
    /// True once the distinct reply count meets the quota.
    pub fn is_satisfied(&self, servers: usize) -> bool {
        self.replies.len() >= self.quota.required(servers)
    }

    /// Consumes the continuation, returning the collected replies.
    pub fn into_replies(self) -> Vec<Message> {
        self.replies.into_values().collect()
    }
}

/// Outcome of offering a message to the registry.
#[derive(Debug)]
pub enum Offer {
    /// A continuation reached its quota and was removed
    Fired(Continuation),
    /// Matched a continuation that still waits for more replies
    Absorbed,
    /// No continuation wants this message
    Unmatched,
}

/// Arena of pending continuations.
#[derive(Debug, Clone, Default)]
pub struct ContinuationRegistry {
    next_op: OpId,
    pending: BTreeMap<OpId, Continuation>,
}

impl ContinuationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a continuation and returns its operation id.
    pub fn register(&mut self, filter: ReplyFilter, quota: Quota, resume: Resume) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        self.pending.insert(
            op,
            Continuation {
                op,
                filter,
                quota,
                replies: BTreeMap::new(),
                resume,
            },
        );
        op
    }

    /// Offers an inbound message to the first matching continuation.
    ///
    /// `servers` is the current server count used to resolve quotas.
    pub fn offer(&mut self, msg: &Message, servers: usize) -> Offer {
        let Some(op) = self
            .pending
            .values()
            .find(|c| c.filter.matches(msg))
            .map(|c| c.op)
        else {
            return Offer::Unmatched;
        };

        let satisfied = match self.pending.get_mut(&op) {
            Some(continuation) => {
                continuation.replies.insert(msg.sender, msg.clone());
                continuation.is_satisfied(servers)
            }
            None => false,
        };

        if satisfied {
            self.remove(op).map_or(Offer::Absorbed, Offer::Fired)
        } else {
            Offer::Absorbed
        }
    }

    /// Removes and returns the first continuation whose quota is now met.
    ///
    /// Used after membership shrinks, which lowers quorum thresholds.
    pub fn take_ready(&mut self, servers: usize) -> Option<Continuation> {
        let op = self
            .pending
            .values()
            .find(|c| c.is_satisfied(servers))
            .map(|c| c.op)?;
        self.remove(op)
    }

    /// Removes a continuation by id.
    pub fn remove(&mut self, op: OpId) -> Option<Continuation> {
        self.pending.remove(&op)
    }

    /// Number of pending continuations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Iterates pending continuations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Continuation> {
        self.pending.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_env::Recipient;

    fn ack_get(from: u64, to: AgentId, request: u64) -> Message {
        Message::new(
            AgentId::from_seed(from),
            Recipient::Agent(to),
            Payload::AckGetTokens {
                request,
                tokens: Vec::new(),
            },
        )
    }

    #[test]
    fn test_fires_at_read_quorum() {
        let me = AgentId::from_seed(0);
        let mut registry = ContinuationRegistry::new();
        registry.register(
            ReplyFilter::AckGetTokens { request: 1 },
            Quota::Read,
            Resume::FinishRead {
                purpose: ReadPurpose::Standalone,
            },
        );

        // 5 servers -> needs 3
        assert!(matches!(registry.offer(&ack_get(1, me, 1), 5), Offer::Absorbed));
        assert!(matches!(registry.offer(&ack_get(2, me, 1), 5), Offer::Absorbed));
        match registry.offer(&ack_get(3, me, 1), 5) {
            Offer::Fired(c) => assert_eq!(c.into_replies().len(), 3),
            other => panic!("expected fire, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_sender_counts_once() {
        let me = AgentId::from_seed(0);
        let mut registry = ContinuationRegistry::new();
        registry.register(
            ReplyFilter::AckGetTokens { request: 1 },
            Quota::Read,
            Resume::FinishRead {
                purpose: ReadPurpose::Standalone,
            },
        );

        registry.offer(&ack_get(1, me, 1), 3);
        assert!(matches!(registry.offer(&ack_get(1, me, 1), 3), Offer::Absorbed));
        assert_eq!(registry.iter().next().unwrap().replies.len(), 1);
    }

    #[test]
    fn test_stale_request_is_unmatched() {
        let me = AgentId::from_seed(0);
        let mut registry = ContinuationRegistry::new();
        registry.register(
            ReplyFilter::AckGetTokens { request: 2 },
            Quota::Read,
            Resume::FinishRead {
                purpose: ReadPurpose::Standalone,
            },
        );

        assert!(matches!(registry.offer(&ack_get(1, me, 1), 3), Offer::Unmatched));
    }

    #[test]
    fn test_pay_filter_matches_token_and_version() {
        let token = TokenId::from_seed(1);
        let filter = ReplyFilter::AckPay { token, version: 2 };
        let ack = |version| {
            Message::new(
                AgentId::from_seed(1),
                Recipient::Agent(AgentId::from_seed(0)),
                Payload::AckPay { token, version },
            )
        };

        assert!(filter.matches(&ack(2)));
        assert!(!filter.matches(&ack(1)));
    }

    #[test]
    fn test_take_ready_after_membership_shrink() {
        let me = AgentId::from_seed(0);
        let mut registry = ContinuationRegistry::new();
        registry.register(
            ReplyFilter::AckGetTokens { request: 1 },
            Quota::Read,
            Resume::FinishRead {
                purpose: ReadPurpose::Standalone,
            },
        );

        // 7 servers -> needs 4; only 3 arrive
        for from in 1..=3 {
            registry.offer(&ack_get(from, me, 1), 7);
        }
        assert!(registry.take_ready(7).is_none());

        // A server left: 6 servers -> needs 3
        assert!(registry.take_ready(6).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let mut registry = ContinuationRegistry::new();
        let first = registry.register(
            ReplyFilter::AckDbUpdate { request: 1 },
            Quota::Write,
            Resume::FinishDemotion,
        );
        let second = registry.register(
            ReplyFilter::AckDbUpdate { request: 2 },
            Quota::Write,
            Resume::FinishDemotion,
        );

        let ops: Vec<OpId> = registry.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![first, second]);
    }
}
