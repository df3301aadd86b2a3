//! Quorum Environment - shared data model
//!
//! Leaf types used by both the protocol engine (`quorum_core`) and the
//! simulation harness (`quorum_sim`):
//! - **Identity**: `AgentId` / `TokenId`, deterministic when derived from a seed
//! - **State**: `Token` ownership records and `TokenDb` replicas
//! - **Wire**: addressed `Message`s with typed payloads
//!
//! Nothing in here performs I/O or draws randomness.

mod error;
mod message;
mod types;

pub use error::SimError;
pub use message::{Message, MessageType, Payload, Recipient};
pub use types::{AgentId, AgentRole, Token, TokenDb, TokenId};
