//! Ground truth checks for a simulation run.
//!
//! The Oracle knows the token set the run started with and judges the
//! final state of the agents:
//! - The replicated database (union of the server replicas)
//! - Token conservation
//! - Liveness of non-faulty clients
//! - Divergence between two runs

use quorum_core::Agent;
use quorum_env::{AgentId, AgentRole, Token, TokenDb, TokenId};
use serde::{Deserialize, Serialize};

/// Clients that still have an operation in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    /// Non-faulty clients with `during_action` set
    pub stuck: Vec<AgentId>,

    /// Faulty agents with `during_action` set (tolerated)
    pub stuck_faulty: Vec<AgentId>,
}

impl LivenessReport {
    /// True if every non-faulty client finished.
    pub fn is_live(&self) -> bool {
        self.stuck.is_empty()
    }
}

/// A token whose final state differs between two runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub token: TokenId,
    pub left: Option<Token>,
    pub right: Option<Token>,
}

/// Judges runs against the initial allocation.
#[derive(Debug, Clone)]
pub struct Oracle {
    /// Token set every agent started with
    genesis: TokenDb,
}

impl Oracle {
    /// Creates an oracle for the given initial allocation.
    pub fn new(genesis: TokenDb) -> Self {
        Self { genesis }
    }

    /// Initial allocation.
    pub fn genesis(&self) -> &TokenDb {
        &self.genesis
    }

    /// Merges every server replica, keeping the highest version per token.
    pub fn final_db<'a, I>(agents: I) -> TokenDb
    where
        I: IntoIterator<Item = &'a Agent>,
    {
        let mut db = TokenDb::new();
        for replica in agents.into_iter().filter_map(Agent::replica) {
            db.merge_all(replica.iter().cloned());
        }
        db
    }

    /// Lists agents that did not finish their operation.
    pub fn liveness<'a, I>(agents: I) -> LivenessReport
    where
        I: IntoIterator<Item = &'a Agent>,
    {
        let mut report = LivenessReport::default();
        for agent in agents.into_iter().filter(|a| a.during_action()) {
            if agent.is_faulty() {
                report.stuck_faulty.push(agent.id());
            } else if agent.role() == AgentRole::Client {
                report.stuck.push(agent.id());
            }
        }
        report
    }

    /// Every initial token is still present, owned and no older than at
    /// the start.
    pub fn check_conservation(&self, final_db: &TokenDb) -> Result<(), String> {
        for initial in self.genesis.iter() {
            let Some(token) = final_db.get(&initial.id) else {
                return Err(format!("token {} vanished", initial.id));
            };
            if token.version < initial.version {
                return Err(format!(
                    "token {} went back from v{} to v{}",
                    initial.id, initial.version, token.version
                ));
            }
            if token.owner.is_none() {
                return Err(format!("token {} lost its owner", initial.id));
            }
        }

        if final_db.len() != self.genesis.len() {
            return Err(format!(
                "{} tokens at the end, {} at the start",
                final_db.len(),
                self.genesis.len()
            ));
        }
        Ok(())
    }

    /// Tokens whose `(version, owner)` differ between two databases.
    pub fn divergences(left: &TokenDb, right: &TokenDb) -> Vec<Divergence> {
        let mut ids: Vec<TokenId> = left.iter().chain(right.iter()).map(|t| t.id).collect();
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .filter_map(|id| {
                let l = left.get(&id);
                let r = right.get(&id);
                (l != r).then(|| Divergence {
                    token: id,
                    left: l.cloned(),
                    right: r.cloned(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(entries: &[(u64, u64, u64)]) -> TokenDb {
        entries
            .iter()
            .map(|&(id, version, owner)| Token {
                id: TokenId::from_seed(id),
                version,
                owner: Some(AgentId::from_seed(owner)),
            })
            .collect()
    }

    #[test]
    fn test_final_db_takes_max_over_servers() {
        let s1 = Agent::server(AgentId::from_seed(1), db(&[(0, 3, 7), (1, 0, 7)]));
        let s2 = Agent::server(AgentId::from_seed(2), db(&[(0, 1, 8), (1, 2, 9)]));
        let client = Agent::client(AgentId::from_seed(3), db(&[(0, 9, 3)]));

        let merged = Oracle::final_db([&s1, &s2, &client]);

        // The client's snapshot is not part of the replicated state
        assert_eq!(merged.get(&TokenId::from_seed(0)).map(|t| t.version), Some(3));
        assert_eq!(merged.get(&TokenId::from_seed(1)).map(|t| t.version), Some(2));
    }

    #[test]
    fn test_conservation() {
        let oracle = Oracle::new(db(&[(0, 0, 1), (1, 0, 1)]));

        assert!(oracle.check_conservation(&db(&[(0, 4, 2), (1, 0, 1)])).is_ok());
        assert!(oracle.check_conservation(&db(&[(0, 4, 2)])).is_err());
        assert!(oracle
            .check_conservation(&db(&[(0, 0, 1), (1, 0, 1), (2, 0, 1)]))
            .is_err());
    }

    #[test]
    fn test_divergences() {
        let a = db(&[(0, 1, 1), (1, 2, 2)]);
        let b = db(&[(0, 1, 1), (1, 2, 3), (2, 0, 1)]);

        let diff = Oracle::divergences(&a, &b);

        assert_eq!(diff.len(), 2);
        assert!(diff[0].token < diff[1].token);
        assert!(Oracle::divergences(&a, &a).is_empty());
    }

    #[test]
    fn test_liveness_ignores_faulty_and_idle() {
        let idle = Agent::client(AgentId::from_seed(1), TokenDb::new());
        let report = Oracle::liveness([&idle]);
        assert!(report.is_live());
    }
}
