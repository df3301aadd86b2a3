//! Named simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// No faults: every client finishes and no token is lost
    Baseline,

    /// Record under omission, replay clean, compare replicas
    OmissionSafety,

    /// Frequent role transforms under omission, replay clean, compare
    MembershipChurn,

    /// Two clean replays of one log give identical replicas
    ReplayIdempotence,

    /// A read racing a PAY gives the same state in either finish order
    LinearizationOrder,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Baseline,
            ScenarioId::OmissionSafety,
            ScenarioId::MembershipChurn,
            ScenarioId::ReplayIdempotence,
            ScenarioId::LinearizationOrder,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "baseline",
            ScenarioId::OmissionSafety => "omission_safety",
            ScenarioId::MembershipChurn => "membership_churn",
            ScenarioId::ReplayIdempotence => "replay_idempotence",
            ScenarioId::LinearizationOrder => "linearization_order",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "Fault-free run, verify liveness and token conservation",
            ScenarioId::OmissionSafety => {
                "Faulty servers and clients drop messages; a clean replay must agree"
            }
            ScenarioId::MembershipChurn => {
                "High transform rates under omission; a clean replay must agree"
            }
            ScenarioId::ReplayIdempotence => "Replay one log twice, compare the serialized replicas",
            ScenarioId::LinearizationOrder => {
                "GET finishing before or after a concurrent PAY yields one state"
            }
        }
    }

    /// Returns true if the scenario injects faults.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ScenarioId::OmissionSafety | ScenarioId::MembershipChurn)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" => Ok(ScenarioId::Baseline),
            "omission_safety" | "safety" => Ok(ScenarioId::OmissionSafety),
            "membership_churn" | "churn" => Ok(ScenarioId::MembershipChurn),
            "replay_idempotence" | "idempotence" => Ok(ScenarioId::ReplayIdempotence),
            "linearization_order" | "linearization" => Ok(ScenarioId::LinearizationOrder),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
