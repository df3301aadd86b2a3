//! Quorum Core - Reconfigurable Quorum-Replicated Token Ownership Protocol
//!
//! Agents hold versioned tokens and move them between each other through a
//! replicated token database kept by a changing set of servers:
//! 1. **Quorum writes and reads**: PAY is acknowledged by `n - f` servers,
//!    reads collect `n - f` replicas, so every read overlaps the last write
//! 2. **Dynamic membership**: clients and servers switch roles at runtime
//!    while quorum sizes follow the live server count
//! 3. **Omission faults**: up to `f = n / 2` servers may drop messages
//! 4. **Deterministic replay**: an action log re-runs the same schedule of
//!    client operations under a different fault configuration

pub mod action_log;
pub mod agent;
pub mod config;
pub mod context;
pub mod continuation;
pub mod quorum;

// Re-export key types for convenience
pub use action_log::{ActionKind, ActionLog, ActionRecord, LinearizationTracker, ReplayCursor};
pub use agent::{Agent, ClientState, RoleState, ServerState};
pub use config::{OmissionPolicy, ProtocolConfig};
pub use context::{Membership, ProtocolMetrics, SimulationContext};
pub use continuation::{Continuation, ContinuationRegistry, OpId, Offer, ReadPurpose, ReplyFilter, Resume};
pub use quorum::{max_faulty, read_quorum, write_quorum, Quota};
