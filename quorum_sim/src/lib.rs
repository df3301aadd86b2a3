//! Deterministic simulation harness for the quorum token protocol.
//!
//! Every source of non-determinism is owned by the harness:
//! - **Identity**: agent and token ids derived from the master seed
//! - **Network**: a shuffled, capped, lossy delivery queue
//! - **Randomness**: behaviour and scheduling draw from seeded generators
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Simulator                         │
//! │  ┌─────────┐   ┌─────────┐   ┌─────────┐                 │
//! │  │ Server  │   │ Server  │   │ Client  │   ...           │
//! │  └────▲────┘   └────▲────┘   └────▲────┘                 │
//! │       └─────────────┼─────────────┘                      │
//! │               ┌─────┴──────┐    ┌───────────────────┐    │
//! │               │ SimNetwork │    │ SimulationContext │    │
//! │               └────────────┘    └───────────────────┘    │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Oracle (final replica, conservation, liveness)     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use quorum_core::ProtocolConfig;
//! use quorum_sim::{SimConfig, Simulator};
//!
//! # fn main() -> Result<(), quorum_env::SimError> {
//! let config = SimConfig::default().with_protocol(ProtocolConfig::lossy(0.2, 0.3));
//! let recorded = Simulator::new(config.clone())?.run()?;
//!
//! let replayed = Simulator::new(config.replaying(recorded.log.clone()))?.run()?;
//! assert_eq!(recorded.final_db, replayed.final_db);
//! # Ok(())
//! # }
//! ```

mod exporter;
mod identity;
mod network;
mod oracle;
mod runner;
pub mod scenarios;
mod simulator;

pub use exporter::{read_action_log, write_action_log, RunCounters, RunExport};
pub use identity::DeterministicIdProvider;
pub use network::{NetworkStats, SimNetwork};
pub use oracle::{Divergence, LivenessReport, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use simulator::{RunReport, Schedule, SimConfig, Simulator};
