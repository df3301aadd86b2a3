//! Protocol configuration: membership bounds, behaviour rates and fault model.

use quorum_env::SimError;

/// Whether self-initiated messages are subject to outgoing omission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OmissionPolicy {
    /// Replies and notifications may be dropped; operation messages
    /// (starts, chained requests, resends, replica pushes) always leave.
    #[default]
    ExemptOperationStarts,
    /// Every outbound message of a faulty agent may be dropped.
    AllOutgoing,
}

/// Configuration for agent behaviour inside a simulation.
///
/// All rates are probabilities drawn once per idle tick (transform, action)
/// or once per message edge (omission).
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Lower bound on the server count
    pub min_servers: usize,

    /// Upper bound on the server count
    pub max_servers: usize,

    /// Weight of starting a PAY on an idle client tick
    pub client_pay_rate: f64,

    /// Weight of starting a standalone GET_TOKENS on an idle client tick
    pub client_get_rate: f64,

    /// Chance per idle tick that a client starts turning into a server
    pub client_transform_rate: f64,

    /// Chance per idle tick that a server starts turning into a client
    pub server_transform_rate: f64,

    /// Omission probability of a faulty client
    pub client_omission_rate: f64,

    /// Omission probability of a faulty server
    pub server_omission_rate: f64,

    /// Master switch for fault injection
    pub allow_faulty: bool,

    /// Number of initial clients that start out faulty
    pub faulty_clients: usize,

    /// Steps without progress before the last request is resent
    pub action_timeout: u64,

    /// Outgoing omission policy
    pub omission_policy: OmissionPolicy,

    /// A PAY first reads the token's latest version from a read quorum
    pub pay_reads_first: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_servers: 3,
            max_servers: 7,
            client_pay_rate: 0.3,
            client_get_rate: 0.0,
            client_transform_rate: 0.1,
            server_transform_rate: 0.1,
            client_omission_rate: 0.0,
            server_omission_rate: 0.0,
            allow_faulty: false,
            faulty_clients: 0,
            action_timeout: 30,
            omission_policy: OmissionPolicy::default(),
            pay_reads_first: true,
        }
    }
}

impl ProtocolConfig {
    /// No faults at all.
    pub fn fault_free() -> Self {
        Self::default()
    }

    /// Faulty servers and clients with the given omission rates.
    pub fn lossy(client_omission_rate: f64, server_omission_rate: f64) -> Self {
        Self {
            allow_faulty: true,
            faulty_clients: 1,
            client_omission_rate,
            server_omission_rate,
            ..Self::default()
        }
    }

    /// Same behaviour, but every fault switched off.
    ///
    /// Used to replay a schedule recorded under faults.
    pub fn without_faults(&self) -> Self {
        Self {
            allow_faulty: false,
            faulty_clients: 0,
            client_omission_rate: 0.0,
            server_omission_rate: 0.0,
            ..self.clone()
        }
    }

    /// Stops new self-initiated work: every start probability becomes zero.
    ///
    /// In-flight operations and transforms keep running to completion.
    pub fn close(&mut self) {
        self.client_pay_rate = 0.0;
        self.client_get_rate = 0.0;
        self.client_transform_rate = 0.0;
        self.server_transform_rate = 0.0;
    }

    /// True once [`close`](Self::close) zeroed every start probability.
    pub fn is_closed(&self) -> bool {
        self.client_pay_rate == 0.0
            && self.client_get_rate == 0.0
            && self.client_transform_rate == 0.0
            && self.server_transform_rate == 0.0
    }

    /// Checks bounds and probability ranges.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.min_servers == 0 {
            return Err(SimError::config("min_servers must be at least 1"));
        }
        if self.min_servers > self.max_servers {
            return Err(SimError::config(format!(
                "min_servers {} exceeds max_servers {}",
                self.min_servers, self.max_servers
            )));
        }

        let rates = [
            ("client_pay_rate", self.client_pay_rate),
            ("client_get_rate", self.client_get_rate),
            ("client_transform_rate", self.client_transform_rate),
            ("server_transform_rate", self.server_transform_rate),
            ("client_omission_rate", self.client_omission_rate),
            ("server_omission_rate", self.server_omission_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(SimError::config(format!("{name} = {rate} is not a probability")));
            }
        }
        if self.client_pay_rate + self.client_get_rate > 1.0 {
            return Err(SimError::config("client_pay_rate + client_get_rate exceeds 1"));
        }
        if self.action_timeout == 0 {
            return Err(SimError::config("action_timeout must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ProtocolConfig::default().validate().is_ok());
        assert!(ProtocolConfig::lossy(0.3, 0.8).validate().is_ok());
    }

    #[test]
    fn test_close_zeroes_start_rates() {
        let mut config = ProtocolConfig::lossy(0.3, 0.8);
        assert!(!config.is_closed());

        config.close();

        assert!(config.is_closed());
        // Fault model is untouched
        assert_eq!(config.server_omission_rate, 0.8);
    }

    #[test]
    fn test_without_faults_keeps_behaviour() {
        let lossy = ProtocolConfig::lossy(0.3, 0.8);
        let clean = lossy.without_faults();

        assert!(!clean.allow_faulty);
        assert_eq!(clean.client_omission_rate, 0.0);
        assert_eq!(clean.client_pay_rate, lossy.client_pay_rate);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ProtocolConfig {
            min_servers: 5,
            max_servers: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));

        let config = ProtocolConfig {
            server_omission_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProtocolConfig {
            client_pay_rate: 0.7,
            client_get_rate: 0.7,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
