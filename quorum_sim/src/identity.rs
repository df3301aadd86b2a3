//! Deterministic identity provider for simulation.

use quorum_env::{AgentId, TokenId};

/// Derives agent and token ids from a master seed.
///
/// A recorded run and its replay must agree on every identity, so ids
/// are never drawn from entropy. Ids are:
/// - Deterministic: same seed and index always give the same id
/// - Unique: servers, clients and tokens live in separate namespaces
/// - Isolated: growing the population doesn't change earlier ids
#[derive(Debug, Clone, Copy)]
pub struct DeterministicIdProvider {
    master_seed: u64,
}

const SERVER_SALT: u64 = 0x9e3779b97f4a7c15;
const CLIENT_SALT: u64 = 0x517cc1b727220a95;
const TOKEN_SALT: u64 = 0x3c6ef372fe94f82b;

impl DeterministicIdProvider {
    /// Creates a provider for the given master seed.
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    /// Id of the `index`-th initial server.
    pub fn server_id(&self, index: u64) -> AgentId {
        AgentId::from_seed(self.derive(SERVER_SALT, index))
    }

    /// Id of the `index`-th initial client.
    pub fn client_id(&self, index: u64) -> AgentId {
        AgentId::from_seed(self.derive(CLIENT_SALT, index))
    }

    /// Id of the `index`-th token.
    pub fn token_id(&self, index: u64) -> TokenId {
        TokenId::from_seed(self.derive(TOKEN_SALT, index))
    }

    /// `master_seed * golden + index * salt`
    fn derive(&self, salt: u64, index: u64) -> u64 {
        self.master_seed
            .wrapping_mul(0x9e3779b97f4a7c15)
            .wrapping_add(index.wrapping_add(1).wrapping_mul(salt))
    }
}
