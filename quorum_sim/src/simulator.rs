//! Simulator - the transport and scheduler driving every agent.

use crate::identity::DeterministicIdProvider;
use crate::network::{expand, NetworkStats, SimNetwork};
use crate::oracle::{LivenessReport, Oracle};

use quorum_core::{ActionLog, Agent, ProtocolConfig, ProtocolMetrics, SimulationContext};
use quorum_env::{AgentId, AgentRole, Message, SimError, Token, TokenDb};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// Where client-initiated starts come from.
#[derive(Debug, Clone, Default)]
pub enum Schedule {
    /// Draw starts from the seeded generator and record them
    #[default]
    Record,
    /// Re-issue the starts of a recorded log, in order
    Replay(ActionLog),
}

impl Schedule {
    /// True for [`Schedule::Replay`].
    pub fn is_replay(&self) -> bool {
        matches!(self, Schedule::Replay(_))
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Clients at start
    pub num_start_clients: usize,

    /// Servers at start
    pub num_start_servers: usize,

    /// Tokens allocated to each initial client
    pub tokens_per_client: usize,

    /// Delivery cap per step
    pub max_messages_per_step: usize,

    /// Chance that a selected message is delivered this step
    pub delivery_probability: f64,

    /// Steps before new operations are stopped
    pub steps_until_close: u64,

    /// Steps allowed for draining after close
    pub drain_step_ceiling: u64,

    /// Agent behaviour and fault model
    pub protocol: ProtocolConfig,

    /// Record or replay
    pub schedule: Schedule,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_start_clients: 5,
            num_start_servers: 5,
            tokens_per_client: 3,
            max_messages_per_step: 25,
            delivery_probability: 0.9,
            steps_until_close: 300,
            drain_step_ceiling: 20_000,
            protocol: ProtocolConfig::default(),
            schedule: Schedule::Record,
        }
    }
}

impl SimConfig {
    /// Sets the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the initial population.
    pub fn with_population(mut self, servers: usize, clients: usize) -> Self {
        self.num_start_servers = servers;
        self.num_start_clients = clients;
        self
    }

    /// Sets the number of tokens per initial client.
    pub fn with_tokens_per_client(mut self, tokens: usize) -> Self {
        self.tokens_per_client = tokens;
        self
    }

    /// Sets the steps before close.
    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps_until_close = steps;
        self
    }

    /// Sets the protocol configuration.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the schedule.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Replays `log` with every fault switched off.
    pub fn replaying(&self, log: ActionLog) -> Self {
        Self {
            protocol: self.protocol.without_faults(),
            schedule: Schedule::Replay(log),
            ..self.clone()
        }
    }

    /// Checks population bounds and probabilities.
    pub fn validate(&self) -> Result<(), SimError> {
        self.protocol.validate()?;

        let (min, max) = (self.protocol.min_servers, self.protocol.max_servers);
        if !(min..=max).contains(&self.num_start_servers) {
            return Err(SimError::config(format!(
                "num_start_servers {} outside [{min}, {max}]",
                self.num_start_servers
            )));
        }
        if self.num_start_clients == 0 {
            return Err(SimError::config("at least one client is required"));
        }
        if self.max_messages_per_step == 0 {
            return Err(SimError::config("max_messages_per_step must be positive"));
        }
        if !(self.delivery_probability > 0.0 && self.delivery_probability <= 1.0) {
            return Err(SimError::config(format!(
                "delivery_probability {} must be in (0, 1]",
                self.delivery_probability
            )));
        }
        if self.drain_step_ceiling == 0 {
            return Err(SimError::config("drain_step_ceiling must be positive"));
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Seed used
    pub seed: u64,

    /// Steps executed, including draining
    pub total_steps: u64,

    /// The run reached a quiescent state
    pub drained: bool,

    /// Union of the server replicas
    pub final_db: TokenDb,

    /// Events recorded during the run
    pub log: ActionLog,

    /// Protocol counters
    pub metrics: ProtocolMetrics,

    /// Transport counters
    pub network: NetworkStats,

    /// Unfinished operations
    pub liveness: LivenessReport,

    /// Server count at the end
    pub servers: usize,

    /// Client count at the end
    pub clients: usize,

    /// Faulty server count at the end
    pub faulty_servers: usize,
}

/// The simulator: owns agents, context and transport.
pub struct Simulator {
    config: SimConfig,
    ctx: SimulationContext,
    agents: BTreeMap<AgentId, Agent>,
    network: SimNetwork,
    oracle: Oracle,

    /// Delivery selection and agent ordering
    scheduler_rng: ChaCha8Rng,
}

impl Simulator {
    /// Builds the initial population.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;

        // Derive separate seeds for different subsystems
        let behaviour_seed = config.seed;
        let scheduler_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let ids = DeterministicIdProvider::new(config.seed);

        let mut ctx = match &config.schedule {
            Schedule::Record => SimulationContext::new(config.protocol.clone(), behaviour_seed),
            Schedule::Replay(log) => {
                SimulationContext::replaying(config.protocol.clone(), behaviour_seed, log.clone())
            }
        };

        let server_ids: Vec<AgentId> = (0..config.num_start_servers as u64)
            .map(|i| ids.server_id(i))
            .collect();
        let client_ids: Vec<AgentId> = (0..config.num_start_clients as u64)
            .map(|i| ids.client_id(i))
            .collect();

        let genesis: TokenDb = client_ids
            .iter()
            .enumerate()
            .flat_map(|(c, owner)| {
                (0..config.tokens_per_client).map(move |k| {
                    let index = (c * config.tokens_per_client + k) as u64;
                    Token::owned_by(ids.token_id(index), *owner)
                })
            })
            .collect();

        let mut agents = BTreeMap::new();
        for id in &server_ids {
            ctx.membership_mut().add_server(*id);
            agents.insert(*id, Agent::server(*id, genesis.clone()));
        }
        for id in &client_ids {
            ctx.membership_mut().add_client(*id);
            agents.insert(*id, Agent::client(*id, genesis.clone()));
        }

        if config.protocol.allow_faulty {
            for id in &server_ids {
                if !ctx.can_add_faulty_server() {
                    break;
                }
                ctx.add_faulty_server();
                if let Some(agent) = agents.get_mut(id) {
                    agent.make_faulty(config.protocol.server_omission_rate);
                }
            }
            for id in client_ids.iter().take(config.protocol.faulty_clients) {
                if let Some(agent) = agents.get_mut(id) {
                    agent.make_faulty(config.protocol.client_omission_rate);
                }
            }
        }

        info!(
            seed = config.seed,
            servers = server_ids.len(),
            clients = client_ids.len(),
            tokens = genesis.len(),
            faulty_servers = ctx.faulty_count(),
            replay = config.schedule.is_replay(),
            "simulation initialized"
        );

        Ok(Self {
            network: SimNetwork::new(config.max_messages_per_step, config.delivery_probability),
            scheduler_rng: ChaCha8Rng::seed_from_u64(scheduler_seed),
            oracle: Oracle::new(genesis),
            config,
            ctx,
            agents,
        })
    }

    /// Runs one tick: deliveries, then one idle tick per agent, then
    /// broadcast expansion. Returns the new step number.
    pub fn step(&mut self) -> u64 {
        let step = self.ctx.advance_step();

        for msg in self.network.select(&mut self.scheduler_rng) {
            let Some(target) = msg.target() else {
                continue;
            };
            let Some(agent) = self.agents.get_mut(&target) else {
                trace!(%target, "message for unknown agent dropped");
                continue;
            };
            trace!(step, %msg, "deliver");
            if let Some(out) = agent.step(Some(msg), &mut self.ctx) {
                self.network.submit(out);
            }
            self.apply_handoffs();
        }

        let mut order: Vec<AgentId> = self.agents.keys().copied().collect();
        order.shuffle(&mut self.scheduler_rng);
        for id in order {
            if let Some(agent) = self.agents.get_mut(&id) {
                if let Some(out) = agent.step(None, &mut self.ctx) {
                    self.network.submit(out);
                }
            }
            self.apply_handoffs();
        }

        self.network.flush(self.ctx.membership());
        step
    }

    /// Gives one agent an idle tick outside the scheduler.
    ///
    /// The outbound message is returned instead of queued.
    pub fn tick_agent(&mut self, id: AgentId) -> Result<Option<Message>, SimError> {
        let agent = self.agents.get_mut(&id).ok_or_else(|| SimError::unknown_agent(id))?;
        let out = agent.step(None, &mut self.ctx);
        self.apply_handoffs();
        Ok(out)
    }

    /// Hands an addressed message straight to its target, bypassing the
    /// transport. The reply is returned instead of queued.
    pub fn deliver(&mut self, msg: Message) -> Result<Option<Message>, SimError> {
        let target = msg
            .target()
            .ok_or_else(|| SimError::config(format!("{msg} is not addressed to one agent")))?;
        let agent = self
            .agents
            .get_mut(&target)
            .ok_or_else(|| SimError::unknown_agent(target))?;
        trace!(step = self.ctx.step(), %msg, "direct delivery");
        let out = agent.step(Some(msg), &mut self.ctx);
        self.apply_handoffs();
        Ok(out)
    }

    /// Copies of `msg`, one per current recipient, sender excluded.
    pub fn fan_out(&self, msg: &Message) -> Vec<Message> {
        if msg.receiver.is_broadcast() {
            expand(msg, self.ctx.membership())
        } else {
            vec![msg.clone()]
        }
    }

    fn apply_handoffs(&mut self) {
        for (recipient, token) in self.ctx.take_handoffs() {
            match self.agents.get_mut(&recipient) {
                Some(agent) => agent.receive_token(token),
                None => warn!(%recipient, token = %token.id, "handoff to unknown agent"),
            }
        }
    }

    /// Stops new self-initiated operations; in-flight ones keep going.
    pub fn close(&mut self) {
        info!(step = self.ctx.step(), "closing communications");
        self.ctx.close();
    }

    /// True when nothing is queued, nobody is mid-operation and the
    /// replay schedule (if any) is exhausted.
    pub fn is_quiescent(&self) -> bool {
        self.network.is_idle()
            && self.agents.values().all(|a| !a.during_action())
            && self.ctx.replay_drained()
    }

    /// Steps until quiescent.
    ///
    /// Returns `Ok(false)` if a recorded run hits the ceiling, and
    /// [`SimError::RunawayReplay`] if a replay does.
    pub fn drain(&mut self) -> Result<bool, SimError> {
        let ceiling = self.config.drain_step_ceiling;
        let mut steps = 0;

        while !self.is_quiescent() {
            if steps >= ceiling {
                let remaining = self.ctx.replay_remaining();
                if self.ctx.is_replaying() {
                    warn!(steps, remaining, "replay did not drain");
                    return Err(SimError::RunawayReplay { steps, remaining });
                }
                warn!(steps, pending = self.network.pending().len(), "run did not drain");
                return Ok(false);
            }
            self.step();
            steps += 1;
        }

        debug!(steps, "drained");
        Ok(true)
    }

    /// Runs until close, then drains.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        for _ in 0..self.config.steps_until_close {
            if self.ctx.is_replaying() && self.is_quiescent() {
                break;
            }
            self.step();
        }
        self.close();
        let drained = self.drain()?;

        let report = self.report(drained);
        info!(
            seed = report.seed,
            steps = report.total_steps,
            drained,
            actions = report.log.len(),
            servers = report.servers,
            "run finished"
        );
        Ok(report)
    }

    /// Snapshot of the current state as a report.
    pub fn report(&self, drained: bool) -> RunReport {
        RunReport {
            seed: self.config.seed,
            total_steps: self.ctx.step(),
            drained,
            final_db: self.final_db(),
            log: self.ctx.log().clone(),
            metrics: self.ctx.metrics().clone(),
            network: self.network.stats(),
            liveness: Oracle::liveness(self.agents.values()),
            servers: self.ctx.server_count(),
            clients: self.ctx.membership().client_count(),
            faulty_servers: self.ctx.faulty_count(),
        }
    }

    /// Union of the current server replicas.
    pub fn final_db(&self) -> TokenDb {
        Oracle::final_db(self.agents.values())
    }

    /// Looks up an agent.
    pub fn agent(&self, id: AgentId) -> Result<&Agent, SimError> {
        self.agents.get(&id).ok_or_else(|| SimError::unknown_agent(id))
    }

    /// All agents, ordered by id.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Agents currently in `role`.
    pub fn agents_in(&self, role: AgentRole) -> impl Iterator<Item = &Agent> {
        self.agents.values().filter(move |a| a.role() == role)
    }

    /// Shared context.
    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    /// Transport.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Oracle for the initial allocation.
    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    /// Run configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}
