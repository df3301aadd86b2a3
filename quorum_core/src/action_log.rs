//! Action log recording and replay.
//!
//! Every client-initiated operation writes its start, linearization point
//! and finish into an ordered log. A recorded log can be replayed under a
//! different fault configuration: the replay issues exactly the same
//! requests, in the same order relative to the recorded finishes, so the
//! two runs can be compared for safety.

use quorum_env::{AgentId, Message, SimError, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of a logged boundary event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    PayStart,
    PayLinearized,
    PayFinish,
    GetTokensStart,
    GetTokensFinish,
    ClientTransformStart,
    ClientTransformFinish,
    ServerTransformStart,
    ServerTransformFinish,
}

impl ActionKind {
    /// True for the kinds that begin an operation.
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            ActionKind::PayStart
                | ActionKind::GetTokensStart
                | ActionKind::ClientTransformStart
                | ActionKind::ServerTransformStart
        )
    }

    /// True if replay must observe this entry before moving past it.
    ///
    /// Linearization points are audit data only.
    pub fn gates_replay(&self) -> bool {
        !matches!(self, ActionKind::PayLinearized)
    }
}

/// One entry of the action log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Agent that performed the action
    pub agent: AgentId,

    /// Simulation step at which it happened
    pub step: u64,

    /// Boundary kind
    pub kind: ActionKind,

    /// The request that started the operation (starts of PAY / GET_TOKENS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

/// Ordered list of action records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    entries: Vec<ActionRecord>,
}

impl ActionLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn push(&mut self, record: ActionRecord) {
        self.entries.push(record);
    }

    /// Returns the records in order.
    pub fn entries(&self) -> &[ActionRecord] {
        &self.entries
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts the records of one kind.
    pub fn count(&self, kind: ActionKind) -> usize {
        self.entries.iter().filter(|r| r.kind == kind).count()
    }

    /// Highest request number carried by any logged message.
    pub fn max_request(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|r| r.message.as_ref().and_then(Message::request))
            .max()
    }

    /// Serializes the log to pretty JSON.
    pub fn to_json(&self) -> Result<String, SimError> {
        serde_json::to_string_pretty(self).map_err(SimError::persistence)
    }

    /// Parses a log from JSON.
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        serde_json::from_str(json).map_err(SimError::persistence)
    }
}

impl FromIterator<ActionRecord> for ActionLog {
    fn from_iter<I: IntoIterator<Item = ActionRecord>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Walks a recorded log during replay.
///
/// Gating entries are consumed strictly in order: a start becomes
/// available only once every earlier gating entry has been observed.
/// Observed events consume the first unconsumed matching entry.
#[derive(Debug, Clone)]
pub struct ReplayCursor {
    entries: Vec<ActionRecord>,
    consumed: Vec<bool>,
    head: usize,
}

impl ReplayCursor {
    /// Creates a cursor positioned at the first gating entry.
    pub fn new(log: ActionLog) -> Self {
        let consumed = vec![false; log.entries.len()];
        let mut cursor = Self {
            entries: log.entries,
            consumed,
            head: 0,
        };
        cursor.advance();
        cursor
    }

    /// The next gating entry, if any.
    pub fn head(&self) -> Option<&ActionRecord> {
        self.entries.get(self.head)
    }

    /// The next start to issue, if it belongs to `agent`.
    pub fn next_start_for(&self, agent: AgentId) -> Option<&ActionRecord> {
        self.head()
            .filter(|record| record.agent == agent && record.kind.is_start())
    }

    /// Marks the first unconsumed entry matching `(agent, kind)` as seen.
    ///
    /// Returns false if the event does not appear in the remaining log.
    pub fn observe(&mut self, agent: AgentId, kind: ActionKind) -> bool {
        let found = self
            .entries
            .iter()
            .enumerate()
            .position(|(idx, r)| !self.consumed[idx] && r.agent == agent && r.kind == kind);

        match found {
            Some(idx) => {
                self.consumed[idx] = true;
                self.advance();
                true
            }
            None => false,
        }
    }

    /// True once every gating entry has been observed.
    pub fn is_drained(&self) -> bool {
        self.head >= self.entries.len()
    }

    /// Number of gating entries not yet observed.
    pub fn remaining(&self) -> usize {
        self.entries
            .iter()
            .zip(&self.consumed)
            .filter(|(r, seen)| r.kind.gates_replay() && !**seen)
            .count()
    }

    fn advance(&mut self) {
        while let Some(record) = self.entries.get(self.head) {
            if self.consumed[self.head] || !record.kind.gates_replay() {
                self.head += 1;
            } else {
                break;
            }
        }
    }
}

/// Counts, per paying client, the distinct servers that accepted its PAY.
///
/// Once the count reaches the write quorum the PAY is linearized.
#[derive(Debug, Clone, Default)]
pub struct LinearizationTracker {
    ongoing: BTreeMap<AgentId, PendingPay>,
}

#[derive(Debug, Clone)]
struct PendingPay {
    token: TokenId,
    version: u64,
    accepted_by: BTreeSet<AgentId>,
}

impl LinearizationTracker {
    /// Starts tracking a PAY; replaces any earlier PAY of the same client.
    pub fn start(&mut self, payer: AgentId, token: TokenId, version: u64) {
        self.ongoing.insert(
            payer,
            PendingPay {
                token,
                version,
                accepted_by: BTreeSet::new(),
            },
        );
    }

    /// Records that `server` applied the PAY.
    ///
    /// Returns true exactly once, when the write quorum is reached.
    pub fn accept(
        &mut self,
        payer: AgentId,
        server: AgentId,
        token: TokenId,
        version: u64,
        write_quorum: usize,
    ) -> bool {
        let Some(pending) = self.ongoing.get_mut(&payer) else {
            return false;
        };
        if pending.token != token || pending.version != version {
            return false;
        }

        pending.accepted_by.insert(server);
        if pending.accepted_by.len() >= write_quorum {
            self.ongoing.remove(&payer);
            return true;
        }
        false
    }
}
