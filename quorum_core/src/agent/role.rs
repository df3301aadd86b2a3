//! Role state as a tagged variant.
//!
//! A transform consumes one variant and produces the other. The token
//! view travels with the agent: a client's snapshot becomes the replica
//! it serves, and a server's replica becomes the snapshot it reads from.

use quorum_env::{AgentRole, TokenDb};

/// State held only while the agent is a client.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    /// Last merged view of the replicated database
    pub snapshot: TokenDb,
}

/// State held only while the agent is a server.
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    /// Authoritative replica served to readers
    pub replica: TokenDb,
}

impl ClientState {
    /// Turns this client state into a server state.
    pub fn into_server(self) -> ServerState {
        ServerState {
            replica: self.snapshot,
        }
    }
}

impl ServerState {
    /// Turns this server state into a client state.
    pub fn into_client(self) -> ClientState {
        ClientState {
            snapshot: self.replica,
        }
    }
}

/// Current role of an agent with its role-specific state.
#[derive(Debug, Clone)]
pub enum RoleState {
    Client(ClientState),
    Server(ServerState),
}

impl RoleState {
    /// Role label.
    pub fn role(&self) -> AgentRole {
        match self {
            RoleState::Client(_) => AgentRole::Client,
            RoleState::Server(_) => AgentRole::Server,
        }
    }

    /// The agent's token view (snapshot or replica).
    pub fn tokens(&self) -> &TokenDb {
        match self {
            RoleState::Client(state) => &state.snapshot,
            RoleState::Server(state) => &state.replica,
        }
    }

    /// Mutable token view.
    pub fn tokens_mut(&mut self) -> &mut TokenDb {
        match self {
            RoleState::Client(state) => &mut state.snapshot,
            RoleState::Server(state) => &mut state.replica,
        }
    }

    /// CLIENT -> SERVER. A server stays a server.
    pub fn promote(self) -> Self {
        match self {
            RoleState::Client(state) => RoleState::Server(state.into_server()),
            server => server,
        }
    }

    /// SERVER -> CLIENT. A client stays a client.
    pub fn demote(self) -> Self {
        match self {
            RoleState::Server(state) => RoleState::Client(state.into_client()),
            client => client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_env::{AgentId, Token, TokenId};

    #[test]
    fn test_view_survives_round_trip() {
        let mut snapshot = TokenDb::new();
        snapshot.insert(Token::owned_by(TokenId::from_seed(1), AgentId::from_seed(1)));

        let role = RoleState::Client(ClientState { snapshot });
        let role = role.promote();
        assert_eq!(role.role(), AgentRole::Server);
        assert_eq!(role.tokens().len(), 1);

        let role = role.demote();
        assert_eq!(role.role(), AgentRole::Client);
        assert_eq!(role.tokens().len(), 1);
    }

    #[test]
    fn test_promote_is_noop_for_servers() {
        let role = RoleState::Server(ServerState::default()).promote();
        assert_eq!(role.role(), AgentRole::Server);
    }
}
