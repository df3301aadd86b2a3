//! Role transforms.
//!
//! CLIENT -> SERVER refreshes the local view from a read quorum before the
//! agent starts serving it. SERVER -> CLIENT pushes the replica to a write
//! quorum of peers before the agent leaves. Each direction holds a lock in
//! the context so at most one transform per direction is in flight.

use super::{Agent, ClientState, Outbound, RoleState};
use crate::action_log::ActionKind;
use crate::context::SimulationContext;
use crate::continuation::{ReadPurpose, ReplyFilter, Resume};
use crate::quorum::Quota;
use quorum_env::{AgentRole, Message, Payload, Recipient, TokenId};
use tracing::{debug, info};

impl Agent {
    /// Draws whether to start a transform, within membership and fault bounds.
    pub(super) fn should_transform(&self, ctx: &mut SimulationContext) -> bool {
        match self.role.role() {
            AgentRole::Client => {
                let rate = ctx.config().client_transform_rate;
                ctx.can_add_server() && ctx.chance(rate)
            }
            AgentRole::Server => {
                let rate = ctx.config().server_transform_rate;
                ctx.can_remove_server()
                    && (self.is_faulty || ctx.faulty_bound_holds_without_one())
                    && ctx.chance(rate)
            }
        }
    }

    pub(super) fn begin_transform(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        match self.role.role() {
            AgentRole::Client => self.begin_promotion(ctx),
            AgentRole::Server => self.begin_demotion(ctx),
        }
    }

    /// CLIENT -> SERVER, phase one: read the latest state.
    pub(super) fn begin_promotion(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        ctx.set_client_transforming(true);
        ctx.record(self.id, ActionKind::ClientTransformStart, None);
        info!(agent = %self.id, step = ctx.step(), "client -> server started");

        let request = ctx.next_request();
        self.begin_read(request, ReadPurpose::Promotion)
    }

    /// CLIENT -> SERVER, phase two: start serving the refreshed view.
    pub(super) fn finish_promotion(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let role = std::mem::replace(&mut self.role, RoleState::Client(ClientState::default()));
        self.role = role.promote();
        ctx.membership_mut().promote(self.id);
        ctx.set_client_transforming(false);

        if ctx.can_add_faulty_server() {
            ctx.add_faulty_server();
            let rate = ctx.config().server_omission_rate;
            self.make_faulty(rate);
        } else if self.is_faulty {
            // No faulty slot left among the servers
            self.is_faulty = false;
            self.omission_rate = 0.0;
        }

        ctx.record(self.id, ActionKind::ClientTransformFinish, None);
        info!(
            agent = %self.id,
            servers = ctx.server_count(),
            faulty = self.is_faulty,
            "client -> server finished"
        );
        self.release();

        Some(Outbound::Notify(Message::new(
            self.id,
            Recipient::Clients,
            Payload::TurnedToServer,
        )))
    }

    /// SERVER -> CLIENT, phase one: push the replica to the other servers.
    pub(super) fn begin_demotion(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        ctx.set_server_transforming(true);
        ctx.record(self.id, ActionKind::ServerTransformStart, None);
        info!(agent = %self.id, step = ctx.step(), "server -> client started");

        let request = ctx.next_request();
        self.continuations.register(
            ReplyFilter::AckDbUpdate { request },
            Quota::Write,
            Resume::FinishDemotion,
        );
        self.during_action = true;

        let tokens = self.role.tokens().tokens();
        Some(Outbound::Request(Message::new(
            self.id,
            Recipient::Servers,
            Payload::DbUpdate { request, tokens },
        )))
    }

    /// SERVER -> CLIENT, phase two: leave the server set.
    pub(super) fn finish_demotion(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let role = std::mem::replace(&mut self.role, RoleState::Client(ClientState::default()));
        self.role = role.demote();
        ctx.membership_mut().demote(self.id);
        ctx.set_server_transforming(false);

        if self.is_faulty {
            ctx.remove_faulty_server();
            self.omission_rate = ctx.config().client_omission_rate;
        }
        self.refresh_ledger();

        ctx.record(self.id, ActionKind::ServerTransformFinish, None);
        info!(
            agent = %self.id,
            servers = ctx.server_count(),
            owned = self.my_tokens.len(),
            "server -> client finished"
        );
        self.release();

        Some(Outbound::Notify(Message::new(
            self.id,
            Recipient::All,
            Payload::TurnedToClient,
        )))
    }

    /// Reconciles the ownership ledger with the view kept as a server.
    fn refresh_ledger(&mut self) {
        let view = self.role.tokens();
        for token in view.owned_by(self.id) {
            self.my_tokens.merge_token(token);
        }

        let moved: Vec<TokenId> = self
            .my_tokens
            .iter()
            .filter(|mine| {
                view.get(&mine.id)
                    .is_some_and(|t| t.version > mine.version && t.owner != Some(self.id))
            })
            .map(|mine| mine.id)
            .collect();
        for id in moved {
            debug!(agent = %self.id, token = %id, "dropping token paid away");
            self.my_tokens.remove(&id);
        }
    }
}
