//! Addressed protocol messages exchanged between agents.
//!
//! # Message Flow
//!
//! ```text
//! Client                     Simulator                    Servers
//!   |                           |                            |
//!   |-- PAY (to SERVERS) ------>|-- expand to members ------>|
//!   |                           |                            |-- apply
//!   |<---------------------------------------- ACK_PAY ------|
//! ```
//!
//! Broadcast recipients are resolved by the simulator when the message is
//! enqueued, not when the agent produced it.

use crate::types::{AgentId, Token, TokenId};
use serde::{Deserialize, Serialize};

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Pay,
    AckPay,
    GetTokens,
    AckGetTokens,
    DbUpdate,
    AckDbUpdate,
    TurnedToClient,
    TurnedToServer,
}

impl MessageType {
    /// Returns the protocol name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Pay => "PAY",
            MessageType::AckPay => "ACK_PAY",
            MessageType::GetTokens => "GET_TOKENS",
            MessageType::AckGetTokens => "ACK_GET_TOKENS",
            MessageType::DbUpdate => "DB_UPDATE",
            MessageType::AckDbUpdate => "ACK_DB_UPDATE",
            MessageType::TurnedToClient => "TURNED_TO_CLIENT",
            MessageType::TurnedToServer => "TURNED_TO_SERVER",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// A single agent
    Agent(AgentId),
    /// Every agent
    All,
    /// Every current server
    Servers,
    /// Every current client
    Clients,
}

impl Recipient {
    /// True for the broadcast classes.
    pub fn is_broadcast(&self) -> bool {
        !matches!(self, Recipient::Agent(_))
    }
}

/// Type-specific message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Transfer `token` to `recipient` at `version`.
    Pay {
        token: TokenId,
        recipient: AgentId,
        version: u64,
    },
    /// A server applied (or already holds) the transfer.
    AckPay { token: TokenId, version: u64 },
    /// Request a full replica snapshot.
    GetTokens { request: u64 },
    /// Snapshot answer to a GET_TOKENS.
    AckGetTokens { request: u64, tokens: Vec<Token> },
    /// Push a replica to peers before leaving the server set.
    DbUpdate { request: u64, tokens: Vec<Token> },
    /// A peer merged a DB_UPDATE.
    AckDbUpdate { request: u64 },
    /// The sender just became a client.
    TurnedToClient,
    /// The sender just became a server.
    TurnedToServer,
}

/// An addressed protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sending agent
    pub sender: AgentId,

    /// Target agent or broadcast class
    pub receiver: Recipient,

    /// Message content
    pub payload: Payload,
}

impl Message {
    /// Creates a message.
    pub fn new(sender: AgentId, receiver: Recipient, payload: Payload) -> Self {
        Self {
            sender,
            receiver,
            payload,
        }
    }

    /// PAY request broadcast to all servers.
    pub fn pay(sender: AgentId, token: TokenId, recipient: AgentId, version: u64) -> Self {
        Self::new(
            sender,
            Recipient::Servers,
            Payload::Pay {
                token,
                recipient,
                version,
            },
        )
    }

    /// GET_TOKENS request broadcast to all servers.
    pub fn get_tokens(sender: AgentId, request: u64) -> Self {
        Self::new(sender, Recipient::Servers, Payload::GetTokens { request })
    }

    /// Returns the message type derived from the payload.
    pub fn kind(&self) -> MessageType {
        match &self.payload {
            Payload::Pay { .. } => MessageType::Pay,
            Payload::AckPay { .. } => MessageType::AckPay,
            Payload::GetTokens { .. } => MessageType::GetTokens,
            Payload::AckGetTokens { .. } => MessageType::AckGetTokens,
            Payload::DbUpdate { .. } => MessageType::DbUpdate,
            Payload::AckDbUpdate { .. } => MessageType::AckDbUpdate,
            Payload::TurnedToClient => MessageType::TurnedToClient,
            Payload::TurnedToServer => MessageType::TurnedToServer,
        }
    }

    /// Returns the request number carried by the payload, if any.
    pub fn request(&self) -> Option<u64> {
        match &self.payload {
            Payload::GetTokens { request }
            | Payload::AckGetTokens { request, .. }
            | Payload::DbUpdate { request, .. }
            | Payload::AckDbUpdate { request } => Some(*request),
            _ => None,
        }
    }

    /// Returns a copy addressed to a single agent.
    ///
    /// The payload is cloned, so each recipient owns its content.
    pub fn addressed_to(&self, target: AgentId) -> Self {
        Self {
            sender: self.sender,
            receiver: Recipient::Agent(target),
            payload: self.payload.clone(),
        }
    }

    /// Returns the concrete target, or None for a broadcast.
    pub fn target(&self) -> Option<AgentId> {
        match self.receiver {
            Recipient::Agent(id) => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.receiver {
            Recipient::Agent(id) => write!(f, "{} {} -> {}", self.kind(), self.sender, id),
            class => write!(f, "{} {} -> {:?}", self.kind(), self.sender, class),
        }
    }
}
