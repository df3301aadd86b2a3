//! The protocol state machine.
//!
//! Each tick an [`Agent`] either handles one delivered message or gets an
//! idle tick, and produces at most one outbound message. Multi-step
//! operations suspend through the continuation registry and resume when
//! enough replies arrive.
//!
//! The role-specific parts live in submodules:
//! - [`client`]: PAY and GET_TOKENS
//! - [`server`]: replica maintenance
//! - [`transform`]: CLIENT <-> SERVER role changes

mod client;
mod role;
mod server;
mod transform;

pub use role::{ClientState, RoleState, ServerState};

use crate::action_log::ActionKind;
use crate::config::OmissionPolicy;
use crate::context::SimulationContext;
use crate::continuation::{Continuation, ContinuationRegistry, Offer, Resume};
use quorum_env::{AgentId, AgentRole, Message, Payload, Recipient, Token, TokenDb};
use tracing::{trace, warn};

/// An outbound message tagged with how it relates to the agent's work.
#[derive(Debug)]
enum Outbound {
    /// Answer to a request
    Reply(Message),
    /// Membership notification
    Notify(Message),
    /// Request of the agent's own operation; becomes the resend candidate
    Request(Message),
    /// Copy of the in-flight request sent to a newly joined server
    Forward(Message),
}

/// A protocol participant.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Stable identity across role changes
    id: AgentId,

    /// Role with its token view
    role: RoleState,

    /// Drop probability per message edge, effective only when faulty
    omission_rate: f64,

    /// Subject to omission
    is_faulty: bool,

    /// Ownership ledger: tokens this agent currently owns
    my_tokens: TokenDb,

    /// Pending continuations
    continuations: ContinuationRegistry,

    /// An operation or transform is in flight
    during_action: bool,

    /// Last request sent, resent on timeout
    last_action: Option<Message>,

    /// Step at which `last_action` was last sent
    last_action_step: u64,
}

impl Agent {
    /// Creates a client with its own copy of the token database.
    pub fn client(id: AgentId, tokens: TokenDb) -> Self {
        Self::with_role(id, RoleState::Client(ClientState { snapshot: tokens }))
    }

    /// Creates a server with its own copy of the token database.
    pub fn server(id: AgentId, tokens: TokenDb) -> Self {
        Self::with_role(id, RoleState::Server(ServerState { replica: tokens }))
    }

    fn with_role(id: AgentId, role: RoleState) -> Self {
        let my_tokens = role.tokens().owned_by(id).into_iter().collect();
        Self {
            id,
            role,
            omission_rate: 0.0,
            is_faulty: false,
            my_tokens,
            continuations: ContinuationRegistry::new(),
            during_action: false,
            last_action: None,
            last_action_step: 0,
        }
    }

    /// Agent id.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> AgentRole {
        self.role.role()
    }

    /// Role state.
    pub fn role_state(&self) -> &RoleState {
        &self.role
    }

    /// Snapshot (client) or replica (server).
    pub fn tokens(&self) -> &TokenDb {
        self.role.tokens()
    }

    /// Replica, if the agent is a server.
    pub fn replica(&self) -> Option<&TokenDb> {
        match &self.role {
            RoleState::Server(state) => Some(&state.replica),
            RoleState::Client(_) => None,
        }
    }

    /// Ownership ledger.
    pub fn my_tokens(&self) -> &TokenDb {
        &self.my_tokens
    }

    /// True while an operation or transform is in flight.
    pub fn during_action(&self) -> bool {
        self.during_action
    }

    /// True if this agent may drop messages.
    pub fn is_faulty(&self) -> bool {
        self.is_faulty
    }

    /// Per-edge omission probability.
    pub fn omission_rate(&self) -> f64 {
        self.omission_rate
    }

    /// Makes this agent omission-faulty.
    pub fn make_faulty(&mut self, omission_rate: f64) {
        self.is_faulty = true;
        self.omission_rate = omission_rate;
    }

    /// Last request sent by the in-flight operation.
    pub fn last_action(&self) -> Option<&Message> {
        self.last_action.as_ref()
    }

    /// Number of continuations waiting for replies.
    pub fn pending_continuations(&self) -> usize {
        self.continuations.len()
    }

    /// Receives a token paid to this agent.
    pub fn receive_token(&mut self, token: Token) {
        if let RoleState::Client(state) = &mut self.role {
            state.snapshot.merge_token(token.clone());
        }
        self.my_tokens.merge_token(token);
    }

    /// Runs one step: handles `incoming` or, if none, takes an idle tick.
    ///
    /// Returns at most one outbound message; broadcasts are expanded by the
    /// caller.
    pub fn step(&mut self, incoming: Option<Message>, ctx: &mut SimulationContext) -> Option<Message> {
        let outbound = match incoming {
            Some(msg) => {
                if self.omits(ctx) {
                    trace!(agent = %self.id, %msg, "inbound omitted");
                    ctx.metrics_mut().omitted_inbound += 1;
                    return None;
                }
                self.handle_incoming(msg, ctx)
            }
            None => self.idle(ctx),
        };

        outbound.and_then(|out| self.emit(out, ctx))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn omits(&self, ctx: &mut SimulationContext) -> bool {
        self.is_faulty && ctx.chance(self.omission_rate)
    }

    fn handle_incoming(&mut self, msg: Message, ctx: &mut SimulationContext) -> Option<Outbound> {
        match self.continuations.offer(&msg, ctx.server_count()) {
            Offer::Fired(continuation) => self.resume(continuation, ctx),
            Offer::Absorbed => None,
            Offer::Unmatched => match self.role.role() {
                AgentRole::Client => self.handle_as_client(msg, ctx),
                AgentRole::Server => self.handle_as_server(msg, ctx),
            },
        }
    }

    fn resume(&mut self, continuation: Continuation, ctx: &mut SimulationContext) -> Option<Outbound> {
        match continuation.resume {
            Resume::FinishRead { purpose } => {
                self.finish_read(purpose, continuation.into_replies(), ctx)
            }
            Resume::FinishPay {
                token,
                recipient,
                version,
            } => self.finish_pay(token, recipient, version, ctx),
            Resume::FinishDemotion => self.finish_demotion(ctx),
        }
    }

    /// Fires a continuation whose quota dropped below its reply count.
    fn reevaluate(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let continuation = self.continuations.take_ready(ctx.server_count())?;
        self.resume(continuation, ctx)
    }

    /// Sends the in-flight request to a server that joined mid-operation.
    fn forward_pending(&self, new_server: AgentId) -> Option<Outbound> {
        if !self.during_action || new_server == self.id {
            return None;
        }
        self.last_action
            .as_ref()
            .filter(|msg| msg.receiver == Recipient::Servers)
            .map(|msg| Outbound::Forward(msg.addressed_to(new_server)))
    }

    fn idle(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        if self.during_action {
            if let Some(out) = self.reevaluate(ctx) {
                return Some(out);
            }
            return self.resend_if_due(ctx);
        }

        if ctx.is_replaying() {
            return self.replay_next(ctx);
        }

        if self.should_transform(ctx) {
            return self.begin_transform(ctx);
        }

        match self.role.role() {
            AgentRole::Client => self.create_action(ctx),
            AgentRole::Server => None,
        }
    }

    fn resend_if_due(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let msg = self.last_action.as_ref()?;
        if ctx.step().saturating_sub(self.last_action_step) < ctx.config().action_timeout {
            return None;
        }

        trace!(agent = %self.id, %msg, "resend");
        ctx.metrics_mut().resends += 1;
        Some(Outbound::Request(msg.clone()))
    }

    /// Issues the next logged start addressed to this agent, if it is due.
    fn replay_next(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let record = ctx.due_replay_start(self.id)?;

        match (record.kind, record.message) {
            (ActionKind::PayStart, Some(msg)) if matches!(msg.payload, Payload::Pay { .. }) => {
                self.begin_pay(msg, ctx)
            }
            (ActionKind::GetTokensStart, Some(msg)) => match msg.payload {
                Payload::GetTokens { request } => self.begin_get_tokens(request, ctx),
                _ => None,
            },
            (ActionKind::ClientTransformStart, _) if self.role() == AgentRole::Client => {
                self.begin_promotion(ctx)
            }
            (ActionKind::ServerTransformStart, _) if self.role() == AgentRole::Server => {
                self.begin_demotion(ctx)
            }
            (kind, _) => {
                warn!(agent = %self.id, ?kind, role = %self.role(), "logged start cannot be issued");
                None
            }
        }
    }

    /// Applies outgoing omission and tracks the resend candidate.
    fn emit(&mut self, out: Outbound, ctx: &mut SimulationContext) -> Option<Message> {
        let (msg, operation) = match out {
            Outbound::Request(msg) => {
                self.last_action = Some(msg.clone());
                self.last_action_step = ctx.step();
                (msg, true)
            }
            Outbound::Forward(msg) => (msg, true),
            Outbound::Reply(msg) | Outbound::Notify(msg) => (msg, false),
        };

        let subject = !operation || ctx.config().omission_policy == OmissionPolicy::AllOutgoing;
        if subject && self.omits(ctx) {
            trace!(agent = %self.id, %msg, "outbound omitted");
            ctx.metrics_mut().omitted_outbound += 1;
            return None;
        }
        Some(msg)
    }

    /// Ends the in-flight operation.
    fn release(&mut self) {
        self.during_action = false;
        self.last_action = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use quorum_env::{MessageType, TokenId};

    pub(super) fn initial_db(owner: AgentId, tokens: u64) -> TokenDb {
        (0..tokens)
            .map(|i| Token::owned_by(TokenId::from_seed(i), owner))
            .collect()
    }

    pub(super) fn cluster(servers: u64, config: ProtocolConfig) -> (SimulationContext, Vec<Agent>) {
        let mut ctx = SimulationContext::new(config, 7);
        let owner = AgentId::from_seed(100);
        let db = initial_db(owner, 2);
        let agents = (0..servers)
            .map(|i| {
                let id = AgentId::from_seed(i);
                ctx.membership_mut().add_server(id);
                Agent::server(id, db.clone())
            })
            .collect();
        ctx.membership_mut().add_client(owner);
        (ctx, agents)
    }

    #[test]
    fn test_client_ledger_comes_from_initial_db() {
        let me = AgentId::from_seed(100);
        let agent = Agent::client(me, initial_db(me, 3));

        assert_eq!(agent.my_tokens().len(), 3);
        assert_eq!(agent.role(), AgentRole::Client);
        assert!(agent.replica().is_none());
    }

    #[test]
    fn test_faulty_agent_with_full_omission_drops_everything() {
        let (mut ctx, mut agents) = cluster(3, ProtocolConfig::lossy(1.0, 1.0));
        let server = &mut agents[0];
        server.make_faulty(1.0);

        let get = Message::get_tokens(AgentId::from_seed(100), 1).addressed_to(server.id());
        assert!(server.step(Some(get), &mut ctx).is_none());
        assert_eq!(ctx.metrics().omitted_inbound, 1);
    }

    #[test]
    fn test_resend_after_timeout() {
        let config = ProtocolConfig {
            client_pay_rate: 0.0,
            client_get_rate: 1.0,
            client_transform_rate: 0.0,
            action_timeout: 5,
            ..Default::default()
        };
        let (mut ctx, _) = cluster(3, config);
        let me = AgentId::from_seed(100);
        let mut client = Agent::client(me, initial_db(me, 1));

        let sent = client.step(None, &mut ctx).expect("get starts");
        assert_eq!(sent.kind(), MessageType::GetTokens);

        for _ in 0..4 {
            ctx.advance_step();
            assert!(client.step(None, &mut ctx).is_none());
        }
        ctx.advance_step();
        assert_eq!(client.step(None, &mut ctx), Some(sent));
        assert_eq!(ctx.metrics().resends, 1);
    }

    fn faulty_payer(policy: OmissionPolicy) -> (SimulationContext, Agent) {
        let config = ProtocolConfig {
            client_pay_rate: 1.0,
            client_get_rate: 0.0,
            client_transform_rate: 0.0,
            pay_reads_first: false,
            action_timeout: 3,
            omission_policy: policy,
            ..ProtocolConfig::lossy(1.0, 0.0)
        };
        let (ctx, _) = cluster(3, config);
        let me = AgentId::from_seed(100);
        let mut client = Agent::client(me, initial_db(me, 1));
        client.make_faulty(1.0);
        (ctx, client)
    }

    #[test]
    fn test_operation_start_exempt_by_default() {
        let (mut ctx, mut client) = faulty_payer(OmissionPolicy::ExemptOperationStarts);

        let pay = client.step(None, &mut ctx).expect("start is never dropped");
        assert_eq!(pay.kind(), MessageType::Pay);
        assert_eq!(ctx.metrics().omitted_outbound, 0);
    }

    #[test]
    fn test_all_outgoing_drops_start_but_keeps_resend_candidate() {
        let (mut ctx, mut client) = faulty_payer(OmissionPolicy::AllOutgoing);

        assert!(client.step(None, &mut ctx).is_none());
        assert_eq!(ctx.metrics().omitted_outbound, 1);
        assert!(client.during_action());
        assert_eq!(ctx.log().count(ActionKind::PayStart), 1);
        let pending = client.last_action().cloned().expect("kept for resend");
        assert_eq!(pending.kind(), MessageType::Pay);

        // The resend is dropped as well
        for _ in 0..3 {
            ctx.advance_step();
            assert!(client.step(None, &mut ctx).is_none());
        }
        assert_eq!(ctx.metrics().resends, 1);
        assert_eq!(ctx.metrics().omitted_outbound, 2);
        assert_eq!(client.last_action(), Some(&pending));

        // Once the link recovers the same PAY goes out on the next timeout
        client.make_faulty(0.0);
        for _ in 0..2 {
            ctx.advance_step();
            assert!(client.step(None, &mut ctx).is_none());
        }
        ctx.advance_step();
        assert_eq!(client.step(None, &mut ctx), Some(pending));
        assert_eq!(ctx.metrics().resends, 2);
    }

    #[test]
    fn test_forward_on_new_server() {
        let config = ProtocolConfig {
            client_pay_rate: 0.0,
            client_get_rate: 1.0,
            client_transform_rate: 0.0,
            ..Default::default()
        };
        let (mut ctx, _) = cluster(3, config);
        let me = AgentId::from_seed(100);
        let mut client = Agent::client(me, initial_db(me, 1));
        client.step(None, &mut ctx);

        let joined = AgentId::from_seed(50);
        let notice = Message::new(joined, Recipient::Agent(me), Payload::TurnedToServer);
        let forwarded = client.step(Some(notice), &mut ctx).expect("forwarded");

        assert_eq!(forwarded.target(), Some(joined));
        assert_eq!(forwarded.kind(), MessageType::GetTokens);
    }
}
