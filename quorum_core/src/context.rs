//! Simulation context shared by every agent and the simulator.
//!
//! There is no ambient global state: the simulator owns one
//! `SimulationContext` and passes it by `&mut` into every agent step.
//! It holds the membership registries, fault and transform counters,
//! the seeded RNG, and the action log (plus the replay cursor in replay
//! mode).

use crate::action_log::{ActionKind, ActionLog, ActionRecord, LinearizationTracker, ReplayCursor};
use crate::config::ProtocolConfig;
use crate::quorum;
use quorum_env::{AgentId, AgentRole, Message, Token, TokenId};
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Current role partition of agent ids.
///
/// Every id is in exactly one of the two sets.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    servers: BTreeSet<AgentId>,
    clients: BTreeSet<AgentId>,
}

impl Membership {
    /// Registers a new server.
    pub fn add_server(&mut self, id: AgentId) {
        self.clients.remove(&id);
        self.servers.insert(id);
    }

    /// Registers a new client.
    pub fn add_client(&mut self, id: AgentId) {
        self.servers.remove(&id);
        self.clients.insert(id);
    }

    /// Moves a client into the server set.
    pub fn promote(&mut self, id: AgentId) {
        self.add_server(id);
    }

    /// Moves a server into the client set.
    pub fn demote(&mut self, id: AgentId) {
        self.add_client(id);
    }

    /// Returns the role of `id`, if registered.
    pub fn role_of(&self, id: AgentId) -> Option<AgentRole> {
        if self.servers.contains(&id) {
            Some(AgentRole::Server)
        } else if self.clients.contains(&id) {
            Some(AgentRole::Client)
        } else {
            None
        }
    }

    /// Current servers, ordered.
    pub fn servers(&self) -> &BTreeSet<AgentId> {
        &self.servers
    }

    /// Current clients, ordered.
    pub fn clients(&self) -> &BTreeSet<AgentId> {
        &self.clients
    }

    /// Every registered agent, servers first.
    pub fn all(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.servers.iter().chain(self.clients.iter()).copied()
    }

    /// Number of servers.
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Number of clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Counters collected while the protocol runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolMetrics {
    /// Inbound messages dropped by faulty agents
    pub omitted_inbound: u64,

    /// Outbound messages dropped by faulty agents
    pub omitted_outbound: u64,

    /// Timeout-driven resends of a pending request
    pub resends: u64,

    /// Stale PAY requests ignored by servers
    pub stale_writes: u64,

    /// Operations (PAY, GET_TOKENS, transforms) started
    pub operations_started: u64,

    /// Operations finished
    pub operations_finished: u64,

    /// Replayed events with no matching entry in the schedule
    pub unscheduled_events: u64,
}

/// Process-wide mutable registry for one simulation run.
pub struct SimulationContext {
    /// Behaviour and fault configuration
    config: ProtocolConfig,

    /// Role partition
    membership: Membership,

    /// A server is currently turning into a client
    server_transforming: bool,

    /// A client is currently turning into a server
    client_transforming: bool,

    /// Number of faulty servers
    faulty_count: usize,

    /// Monotonic step counter
    step: u64,

    /// Next run-unique request number
    next_request: u64,

    /// Deterministic RNG for every behavioural decision
    rng: ChaCha8Rng,

    /// Events recorded during this run
    log: ActionLog,

    /// Recorded schedule driving this run (replay mode)
    replay: Option<ReplayCursor>,

    /// Linearization point detection for PAY
    linearization: LinearizationTracker,

    /// Tokens handed over by finished PAYs, applied by the simulator
    handoffs: Vec<(AgentId, Token)>,

    /// Counters
    metrics: ProtocolMetrics,
}

impl SimulationContext {
    /// Creates a context that records a fresh schedule.
    pub fn new(config: ProtocolConfig, seed: u64) -> Self {
        Self {
            config,
            membership: Membership::default(),
            server_transforming: false,
            client_transforming: false,
            faulty_count: 0,
            step: 0,
            next_request: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            log: ActionLog::new(),
            replay: None,
            linearization: LinearizationTracker::default(),
            handoffs: Vec::new(),
            metrics: ProtocolMetrics::default(),
        }
    }

    /// Creates a context that replays `schedule`.
    ///
    /// Request numbers continue above the highest logged one so that
    /// requests issued internally never collide with replayed ones.
    pub fn replaying(config: ProtocolConfig, seed: u64, schedule: ActionLog) -> Self {
        let mut ctx = Self::new(config, seed);
        ctx.next_request = schedule.max_request().map_or(0, |r| r + 1);
        ctx.replay = Some(ReplayCursor::new(schedule));
        ctx
    }

    // ------------------------------------------------------------------
    // Configuration & clock
    // ------------------------------------------------------------------

    /// Active configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Stops new self-initiated operations and transforms.
    pub fn close(&mut self) {
        self.config.close();
    }

    /// Current step.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Advances the step counter.
    pub fn advance_step(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    /// Returns a fresh request number.
    pub fn next_request(&mut self) -> u64 {
        let request = self.next_request;
        self.next_request += 1;
        request
    }

    // ------------------------------------------------------------------
    // Randomness
    // ------------------------------------------------------------------

    /// Mutable access to the seeded RNG.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Returns true with probability `p`.
    ///
    /// Draws nothing when `p` is zero so that fault-free runs do not
    /// consume randomness on fault checks.
    pub fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.gen::<f64>() < p
    }

    /// Picks a uniformly random registered agent.
    pub fn random_agent(&mut self) -> Option<AgentId> {
        let Self { membership, rng, .. } = self;
        membership.all().choose(rng)
    }

    // ------------------------------------------------------------------
    // Membership & quorums
    // ------------------------------------------------------------------

    /// Role registries.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Mutable role registries.
    pub fn membership_mut(&mut self) -> &mut Membership {
        &mut self.membership
    }

    /// Current server count.
    pub fn server_count(&self) -> usize {
        self.membership.server_count()
    }

    /// Read quorum for the current membership.
    pub fn read_quorum(&self) -> usize {
        quorum::read_quorum(self.server_count())
    }

    /// Write quorum for the current membership.
    pub fn write_quorum(&self) -> usize {
        quorum::write_quorum(self.server_count())
    }

    /// Server count once in-flight transforms complete.
    fn projected_servers(&self) -> usize {
        (self.server_count() + usize::from(self.client_transforming))
            .saturating_sub(usize::from(self.server_transforming))
    }

    /// A client may start turning into a server.
    pub fn can_add_server(&self) -> bool {
        !self.client_transforming && self.projected_servers() < self.config.max_servers
    }

    /// A server may start turning into a client.
    pub fn can_remove_server(&self) -> bool {
        !self.server_transforming && self.projected_servers() > self.config.min_servers
    }

    /// Another server may become faulty without breaking `f = n / 2`.
    pub fn can_add_faulty_server(&self) -> bool {
        self.config.allow_faulty && self.faulty_count < quorum::max_faulty(self.server_count())
    }

    /// A non-faulty server may leave without breaking the faulty bound.
    pub fn faulty_bound_holds_without_one(&self) -> bool {
        self.faulty_count <= quorum::max_faulty(self.server_count().saturating_sub(1))
    }

    /// Number of faulty servers.
    pub fn faulty_count(&self) -> usize {
        self.faulty_count
    }

    /// Counts a newly faulty server.
    pub fn add_faulty_server(&mut self) {
        self.faulty_count += 1;
    }

    /// Uncounts a faulty server that left the server set.
    pub fn remove_faulty_server(&mut self) {
        self.faulty_count = self.faulty_count.saturating_sub(1);
    }

    /// True while a client-to-server transform is in flight.
    pub fn client_transforming(&self) -> bool {
        self.client_transforming
    }

    /// True while a server-to-client transform is in flight.
    pub fn server_transforming(&self) -> bool {
        self.server_transforming
    }

    /// Sets the client-to-server transform lock.
    pub fn set_client_transforming(&mut self, on: bool) {
        self.client_transforming = on;
    }

    /// Sets the server-to-client transform lock.
    pub fn set_server_transforming(&mut self, on: bool) {
        self.server_transforming = on;
    }

    // ------------------------------------------------------------------
    // Action log & replay
    // ------------------------------------------------------------------

    /// Appends an event to the log and advances the replay cursor.
    pub fn record(&mut self, agent: AgentId, kind: ActionKind, message: Option<Message>) {
        debug!(step = self.step, %agent, ?kind, "action");

        if kind.is_start() {
            self.metrics.operations_started += 1;
        } else if kind != ActionKind::PayLinearized {
            self.metrics.operations_finished += 1;
        }

        if let Some(cursor) = self.replay.as_mut() {
            if !cursor.observe(agent, kind) {
                self.metrics.unscheduled_events += 1;
                if kind.is_start() {
                    warn!(step = self.step, %agent, ?kind, "start missing from replayed schedule");
                } else {
                    // e.g. a faulty client's operation that never finished when recorded
                    trace!(step = self.step, %agent, ?kind, "event missing from replayed schedule");
                }
            }
        }
        self.log.push(ActionRecord {
            agent,
            step: self.step,
            kind,
            message,
        });
    }

    /// Log recorded so far.
    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Takes the recorded log, leaving an empty one.
    pub fn take_log(&mut self) -> ActionLog {
        std::mem::take(&mut self.log)
    }

    /// True when this run is driven by a recorded schedule.
    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// The next logged start addressed to `agent`, if it is due.
    pub fn due_replay_start(&self, agent: AgentId) -> Option<ActionRecord> {
        self.replay
            .as_ref()
            .and_then(|cursor| cursor.next_start_for(agent))
            .cloned()
    }

    /// True if there is no schedule or every gating entry was observed.
    pub fn replay_drained(&self) -> bool {
        self.replay.as_ref().map_or(true, ReplayCursor::is_drained)
    }

    /// Gating entries still waiting to be observed.
    pub fn replay_remaining(&self) -> usize {
        self.replay.as_ref().map_or(0, ReplayCursor::remaining)
    }

    /// Starts linearization tracking for a PAY.
    pub fn note_pay_started(&mut self, payer: AgentId, token: TokenId, version: u64) {
        self.linearization.start(payer, token, version);
    }

    /// A server applied a PAY; logs the linearization point at write quorum.
    pub fn note_pay_accepted(&mut self, server: AgentId, payer: AgentId, token: TokenId, version: u64) {
        let quorum = self.write_quorum();
        if self.linearization.accept(payer, server, token, version, quorum) {
            self.record(payer, ActionKind::PayLinearized, None);
        }
    }

    // ------------------------------------------------------------------
    // Token handoffs & metrics
    // ------------------------------------------------------------------

    /// Queues a token for delivery into `recipient`'s ledger.
    pub fn hand_over(&mut self, recipient: AgentId, token: Token) {
        trace!(%recipient, token = %token.id, version = token.version, "handoff");
        self.handoffs.push((recipient, token));
    }

    /// Drains queued handoffs.
    pub fn take_handoffs(&mut self) -> Vec<(AgentId, Token)> {
        std::mem::take(&mut self.handoffs)
    }

    /// Counters.
    pub fn metrics(&self) -> &ProtocolMetrics {
        &self.metrics
    }

    /// Mutable counters.
    pub fn metrics_mut(&mut self) -> &mut ProtocolMetrics {
        &mut self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(servers: u64, clients: u64) -> SimulationContext {
        let mut ctx = SimulationContext::new(ProtocolConfig::default(), 42);
        for i in 0..servers {
            ctx.membership_mut().add_server(AgentId::from_seed(i));
        }
        for i in 0..clients {
            ctx.membership_mut().add_client(AgentId::from_seed(100 + i));
        }
        ctx
    }

    #[test]
    fn test_membership_partition() {
        let mut ctx = context_with(3, 2);
        let c = AgentId::from_seed(100);

        assert_eq!(ctx.membership().role_of(c), Some(AgentRole::Client));
        ctx.membership_mut().promote(c);
        assert_eq!(ctx.membership().role_of(c), Some(AgentRole::Server));
        assert_eq!(ctx.server_count(), 4);
        assert_eq!(ctx.membership().client_count(), 1);
        assert_eq!(ctx.membership().all().count(), 5);
    }

    #[test]
    fn test_quorums_follow_membership() {
        let mut ctx = context_with(5, 2);
        assert_eq!((ctx.read_quorum(), ctx.write_quorum()), (3, 3));

        ctx.membership_mut().promote(AgentId::from_seed(100));
        ctx.membership_mut().promote(AgentId::from_seed(101));
        assert_eq!((ctx.read_quorum(), ctx.write_quorum()), (4, 4));
    }

    #[test]
    fn test_transform_bounds_respect_locks() {
        // default bounds: 3..=7
        let mut ctx = context_with(7, 2);
        assert!(!ctx.can_add_server());
        assert!(ctx.can_remove_server());

        ctx.set_server_transforming(true);
        assert!(ctx.can_add_server());
        assert!(!ctx.can_remove_server());

        let mut ctx = context_with(3, 2);
        assert!(!ctx.can_remove_server());
        ctx.set_client_transforming(true);
        assert!(!ctx.can_add_server());
    }

    #[test]
    fn test_faulty_bound() {
        let mut ctx = SimulationContext::new(ProtocolConfig::lossy(0.1, 0.5), 1);
        for i in 0..5 {
            ctx.membership_mut().add_server(AgentId::from_seed(i));
        }

        assert!(ctx.can_add_faulty_server());
        ctx.add_faulty_server();
        ctx.add_faulty_server();
        assert!(!ctx.can_add_faulty_server());

        // 2 faulty out of 4 still respects f = 2
        assert!(ctx.faulty_bound_holds_without_one());
        ctx.add_faulty_server();
        assert!(!ctx.faulty_bound_holds_without_one());
    }

    #[test]
    fn test_chance_is_deterministic() {
        let mut a = SimulationContext::new(ProtocolConfig::default(), 9);
        let mut b = SimulationContext::new(ProtocolConfig::default(), 9);

        let draws_a: Vec<bool> = (0..32).map(|_| a.chance(0.5)).collect();
        let draws_b: Vec<bool> = (0..32).map(|_| b.chance(0.5)).collect();

        assert_eq!(draws_a, draws_b);
        assert!(!a.chance(0.0));
    }

    #[test]
    fn test_linearization_is_logged_at_write_quorum() {
        let mut ctx = context_with(3, 1);
        let payer = AgentId::from_seed(100);
        let token = TokenId::from_seed(1);

        ctx.note_pay_started(payer, token, 1);
        ctx.note_pay_accepted(AgentId::from_seed(0), payer, token, 1);
        assert_eq!(ctx.log().count(ActionKind::PayLinearized), 0);

        ctx.note_pay_accepted(AgentId::from_seed(1), payer, token, 1);
        assert_eq!(ctx.log().count(ActionKind::PayLinearized), 1);
        assert_eq!(ctx.log().entries()[0].agent, payer);
    }

    #[test]
    fn test_replay_request_numbers_skip_logged_ones() {
        let a = AgentId::from_seed(1);
        let log: ActionLog = vec![ActionRecord {
            agent: a,
            step: 1,
            kind: ActionKind::GetTokensStart,
            message: Some(Message::get_tokens(a, 41)),
        }]
        .into_iter()
        .collect();

        let mut ctx = SimulationContext::replaying(ProtocolConfig::default(), 1, log);

        assert_eq!(ctx.next_request(), 42);
        assert!(ctx.due_replay_start(a).is_some());
        assert!(!ctx.replay_drained());
    }

    #[test]
    fn test_replay_counts_unscheduled_events() {
        let a = AgentId::from_seed(1);
        let b = AgentId::from_seed(2);
        let log: ActionLog = vec![ActionRecord {
            agent: a,
            step: 1,
            kind: ActionKind::GetTokensStart,
            message: Some(Message::get_tokens(a, 0)),
        }]
        .into_iter()
        .collect();
        let mut ctx = SimulationContext::replaying(ProtocolConfig::default(), 1, log);

        // Not in the schedule
        ctx.record(b, ActionKind::PayFinish, None);
        assert_eq!(ctx.metrics().unscheduled_events, 1);
        assert!(!ctx.replay_drained());

        ctx.record(a, ActionKind::GetTokensStart, Some(Message::get_tokens(a, 0)));
        assert_eq!(ctx.metrics().unscheduled_events, 1);
        assert!(ctx.replay_drained());
        assert_eq!(ctx.log().len(), 2);
    }

    #[test]
    fn test_recording_never_counts_unscheduled_events() {
        let mut ctx = SimulationContext::new(ProtocolConfig::default(), 1);
        ctx.record(AgentId::from_seed(1), ActionKind::PayFinish, None);
        assert_eq!(ctx.metrics().unscheduled_events, 0);
    }
}
