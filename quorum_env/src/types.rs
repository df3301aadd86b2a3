//! Common types for the quorum token simulator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for an agent.
///
/// The id survives role changes: the same agent keeps it while switching
/// between CLIENT and SERVER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Creates a deterministic AgentId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        Self(uuid_from_seed(seed, 0x517cc1b727220a95))
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    /// Creates a deterministic TokenId from a seed.
    ///
    /// Uses a different mixing constant than [`AgentId::from_seed`] so the
    /// two id spaces never collide for equal seeds.
    pub fn from_seed(seed: u64) -> Self {
        Self(uuid_from_seed(seed, 0x3c6ef372fe94f82b))
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

fn uuid_from_seed(seed: u64, salt: u64) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..16].copy_from_slice(&seed.wrapping_mul(salt).to_le_bytes());
    Uuid::from_bytes(bytes)
}

/// The role an agent currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    /// Requester: owns tokens and issues PAY / GET_TOKENS.
    Client,
    /// Replica holder.
    Server,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Client => write!(f, "client"),
            AgentRole::Server => write!(f, "server"),
        }
    }
}

/// A versioned ownership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier
    pub id: TokenId,

    /// Version, bumped by every accepted transfer
    pub version: u64,

    /// Current owner (None until allocated)
    pub owner: Option<AgentId>,
}

impl Token {
    /// Creates an unowned token at version 0.
    pub fn new(id: TokenId) -> Self {
        Self {
            id,
            version: 0,
            owner: None,
        }
    }

    /// Creates a token owned by `owner` at version 0.
    pub fn owned_by(id: TokenId, owner: AgentId) -> Self {
        Self {
            id,
            version: 0,
            owner: Some(owner),
        }
    }
}

/// A replica of the token database.
///
/// Ordered by token id so that iteration and serialization are stable
/// across runs. Serialized as a plain list of tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Token>", into = "Vec<Token>")]
pub struct TokenDb {
    tokens: BTreeMap<TokenId, Token>,
}

impl TokenDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one token using last-writer-wins by version.
    ///
    /// Ties keep the local value. Returns true if the local copy changed.
    pub fn merge_token(&mut self, token: Token) -> bool {
        match self.tokens.get_mut(&token.id) {
            Some(local) if token.version > local.version => {
                *local = token;
                true
            }
            Some(_) => false,
            None => {
                self.tokens.insert(token.id, token);
                true
            }
        }
    }

    /// Merges every token from `tokens`, returning how many entries changed.
    pub fn merge_all<I>(&mut self, tokens: I) -> usize
    where
        I: IntoIterator<Item = Token>,
    {
        tokens
            .into_iter()
            .map(|t| self.merge_token(t))
            .filter(|changed| *changed)
            .count()
    }

    /// Overwrites a token unconditionally.
    pub fn insert(&mut self, token: Token) {
        self.tokens.insert(token.id, token);
    }

    /// Removes and returns a token.
    pub fn remove(&mut self, id: &TokenId) -> Option<Token> {
        self.tokens.remove(id)
    }

    /// Returns the stored token, if any.
    pub fn get(&self, id: &TokenId) -> Option<&Token> {
        self.tokens.get(id)
    }

    /// Returns an owned copy of every token, ordered by id.
    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.values().cloned().collect()
    }

    /// Iterates the stored tokens in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    /// Returns the tokens currently owned by `agent`.
    pub fn owned_by(&self, agent: AgentId) -> Vec<Token> {
        self.tokens
            .values()
            .filter(|t| t.owner == Some(agent))
            .cloned()
            .collect()
    }

    /// Number of tokens stored.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if no token is stored.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<Vec<Token>> for TokenDb {
    fn from(tokens: Vec<Token>) -> Self {
        tokens.into_iter().collect()
    }
}

impl From<TokenDb> for Vec<Token> {
    fn from(db: TokenDb) -> Self {
        db.tokens.into_values().collect()
    }
}

impl FromIterator<Token> for TokenDb {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        let mut db = TokenDb::new();
        db.merge_all(iter);
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_deterministic() {
        assert_eq!(AgentId::from_seed(7), AgentId::from_seed(7));
        assert_ne!(AgentId::from_seed(7), AgentId::from_seed(8));
        assert_ne!(AgentId::from_seed(7).0, TokenId::from_seed(7).0);
    }

    #[test]
    fn test_merge_keeps_higher_version() {
        let id = TokenId::from_seed(1);
        let alice = AgentId::from_seed(1);
        let bob = AgentId::from_seed(2);

        let mut db = TokenDb::new();
        assert!(db.merge_token(Token { id, version: 2, owner: Some(alice) }));

        // Older version loses
        assert!(!db.merge_token(Token { id, version: 1, owner: Some(bob) }));
        assert_eq!(db.get(&id).unwrap().owner, Some(alice));

        // Tie keeps the local value
        assert!(!db.merge_token(Token { id, version: 2, owner: Some(bob) }));
        assert_eq!(db.get(&id).unwrap().owner, Some(alice));

        assert!(db.merge_token(Token { id, version: 3, owner: Some(bob) }));
        assert_eq!(db.get(&id).unwrap().owner, Some(bob));
    }

    #[test]
    fn test_owned_by_filters() {
        let alice = AgentId::from_seed(1);
        let bob = AgentId::from_seed(2);
        let db: TokenDb = (0..4)
            .map(|i| {
                let owner = if i % 2 == 0 { alice } else { bob };
                Token::owned_by(TokenId::from_seed(i), owner)
            })
            .collect();

        assert_eq!(db.len(), 4);
        assert_eq!(db.owned_by(alice).len(), 2);
        assert!(db.owned_by(alice).iter().all(|t| t.owner == Some(alice)));
    }

    #[test]
    fn test_db_serialization_is_stable() {
        let a: TokenDb = (0..3).map(|i| Token::new(TokenId::from_seed(i))).collect();
        let b: TokenDb = (0..3).rev().map(|i| Token::new(TokenId::from_seed(i))).collect();

        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
