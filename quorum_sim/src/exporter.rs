//! JSON exporter for run summaries and action logs.
//!
//! A recorded action log written here can be fed back with `--replay`.

use crate::oracle::LivenessReport;
use crate::simulator::RunReport;

use quorum_core::{ActionKind, ActionLog};
use quorum_env::{SimError, Token};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Counters of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub messages_submitted: u64,
    pub messages_delivered: u64,
    pub omitted_inbound: u64,
    pub omitted_outbound: u64,
    pub resends: u64,
    pub stale_writes: u64,
    pub operations_started: u64,
    pub operations_finished: u64,
    pub unscheduled_events: u64,
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExport {
    /// Seed used
    pub seed: u64,

    /// Steps executed
    pub total_steps: u64,

    /// The run reached quiescence
    pub drained: bool,

    /// Servers and clients at the end
    pub servers: usize,
    pub clients: usize,

    /// PAY operations finished
    pub pays_finished: usize,

    /// Union of the server replicas
    pub final_db: Vec<Token>,

    /// Unfinished operations
    pub liveness: LivenessReport,

    pub counters: RunCounters,

    /// Recorded events, omitted from summaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<ActionLog>,
}

impl RunExport {
    /// Builds an export from a finished run. The log is left out.
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            seed: report.seed,
            total_steps: report.total_steps,
            drained: report.drained,
            servers: report.servers,
            clients: report.clients,
            pays_finished: report.log.count(ActionKind::PayFinish),
            final_db: report.final_db.tokens(),
            liveness: report.liveness.clone(),
            counters: RunCounters {
                messages_submitted: report.network.submitted,
                messages_delivered: report.network.delivered,
                omitted_inbound: report.metrics.omitted_inbound,
                omitted_outbound: report.metrics.omitted_outbound,
                resends: report.metrics.resends,
                stale_writes: report.metrics.stale_writes,
                operations_started: report.metrics.operations_started,
                operations_finished: report.metrics.operations_finished,
                unscheduled_events: report.metrics.unscheduled_events,
            },
            log: None,
        }
    }

    /// Attaches the action log.
    pub fn with_log(mut self, log: ActionLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> Result<String, SimError> {
        serde_json::to_string_pretty(self).map_err(SimError::persistence)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        write_file(path.as_ref(), &self.to_json()?)
    }
}

/// Writes an action log as JSON.
pub fn write_action_log(log: &ActionLog, path: impl AsRef<Path>) -> Result<(), SimError> {
    write_file(path.as_ref(), &log.to_json()?)
}

/// Reads an action log written by [`write_action_log`].
pub fn read_action_log(path: impl AsRef<Path>) -> Result<ActionLog, SimError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| SimError::persistence(format!("{}: {e}", path.display())))?;
    ActionLog::from_json(&json)
}

fn write_file(path: &Path, contents: &str) -> Result<(), SimError> {
    let mut file = File::create(path)
        .map_err(|e| SimError::persistence(format!("{}: {e}", path.display())))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| SimError::persistence(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimConfig, Simulator};
    use quorum_core::ActionRecord;
    use quorum_env::{AgentId, Message};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("quorum-sim-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_action_log_file_round_trip() {
        let agent = AgentId::from_seed(3);
        let log: ActionLog = vec![ActionRecord {
            agent,
            step: 4,
            kind: ActionKind::GetTokensStart,
            message: Some(Message::get_tokens(agent, 9)),
        }]
        .into_iter()
        .collect();

        let path = temp_path("log.json");
        write_action_log(&log, &path).unwrap();
        let back = read_action_log(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(back, log);
    }

    #[test]
    fn test_missing_log_is_persistence_error() {
        let err = read_action_log(temp_path("missing.json")).unwrap_err();
        assert!(matches!(err, SimError::Persistence(_)));
    }

    #[test]
    fn test_export_from_report() {
        let config = SimConfig::default().with_population(3, 2).with_steps(60);
        let report = Simulator::new(config).unwrap().run().unwrap();

        let export = RunExport::from_report(&report);
        assert_eq!(export.final_db.len(), report.final_db.len());
        assert!(export.log.is_none());

        let json = export.with_log(report.log.clone()).to_json().unwrap();
        let parsed: RunExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.log, Some(report.log));
    }
}
