//! Client operations: PAY and GET_TOKENS.

use super::{Agent, Outbound, RoleState};
use crate::action_log::ActionKind;
use crate::context::SimulationContext;
use crate::continuation::{ReadPurpose, ReplyFilter, Resume};
use crate::quorum::Quota;
use quorum_env::{AgentId, Message, Payload, Token, TokenId};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

/// What an idle client decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientAction {
    Pay,
    GetTokens,
    Nothing,
}

const CLIENT_ACTIONS: [ClientAction; 3] = [
    ClientAction::Pay,
    ClientAction::GetTokens,
    ClientAction::Nothing,
];

impl Agent {
    /// Unsolicited messages reaching a client.
    pub(super) fn handle_as_client(
        &mut self,
        msg: Message,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        match msg.payload {
            Payload::TurnedToClient => self.reevaluate(ctx),
            Payload::TurnedToServer => self.forward_pending(msg.sender),
            _ => None,
        }
    }

    /// Draws PAY, GET_TOKENS or nothing by the configured weights.
    pub(super) fn create_action(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let config = ctx.config();
        let weights = [
            config.client_pay_rate,
            config.client_get_rate,
            (1.0 - config.client_pay_rate - config.client_get_rate).max(0.0),
        ];
        let dist = WeightedIndex::new(weights).ok()?;

        match CLIENT_ACTIONS[dist.sample(ctx.rng())] {
            ClientAction::Pay if !self.my_tokens.is_empty() => self.start_pay(ctx),
            ClientAction::GetTokens => {
                let request = ctx.next_request();
                self.begin_get_tokens(request, ctx)
            }
            _ => None,
        }
    }

    /// Picks an owned token and a random recipient.
    fn start_pay(&mut self, ctx: &mut SimulationContext) -> Option<Outbound> {
        let index = ctx.rng().gen_range(0..self.my_tokens.len());
        let token = self.my_tokens.iter().nth(index)?.clone();
        let recipient = ctx.random_agent()?;

        if ctx.config().pay_reads_first {
            let request = ctx.next_request();
            return self.begin_read(
                request,
                ReadPurpose::ThenPay {
                    token: token.id,
                    recipient,
                },
            );
        }

        let msg = Message::pay(self.id, token.id, recipient, token.version + 1);
        self.begin_pay(msg, ctx)
    }

    /// Starts a standalone GET_TOKENS with the given request number.
    pub(super) fn begin_get_tokens(
        &mut self,
        request: u64,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        let msg = Message::get_tokens(self.id, request);
        ctx.record(self.id, ActionKind::GetTokensStart, Some(msg.clone()));
        self.begin_read(request, ReadPurpose::Standalone)
    }

    /// Broadcasts GET_TOKENS and waits for a read quorum.
    pub(super) fn begin_read(&mut self, request: u64, purpose: ReadPurpose) -> Option<Outbound> {
        self.continuations.register(
            ReplyFilter::AckGetTokens { request },
            Quota::Read,
            Resume::FinishRead { purpose },
        );
        self.during_action = true;
        debug!(agent = %self.id, request, ?purpose, "read started");
        Some(Outbound::Request(Message::get_tokens(self.id, request)))
    }

    /// Broadcasts a PAY and waits for a read quorum of matching acks.
    pub(super) fn begin_pay(&mut self, msg: Message, ctx: &mut SimulationContext) -> Option<Outbound> {
        let Payload::Pay {
            token,
            recipient,
            version,
        } = msg.payload
        else {
            return None;
        };

        self.continuations.register(
            ReplyFilter::AckPay { token, version },
            Quota::Read,
            Resume::FinishPay {
                token,
                recipient,
                version,
            },
        );
        ctx.note_pay_started(self.id, token, version);
        ctx.record(self.id, ActionKind::PayStart, Some(msg.clone()));
        self.during_action = true;
        Some(Outbound::Request(msg))
    }

    /// Merges the collected snapshots and acts on why the read was issued.
    pub(super) fn finish_read(
        &mut self,
        purpose: ReadPurpose,
        replies: Vec<Message>,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        let view = self.role.tokens_mut();
        for reply in replies {
            if let Payload::AckGetTokens { tokens, .. } = reply.payload {
                view.merge_all(tokens);
            }
        }

        match purpose {
            ReadPurpose::Standalone => {
                ctx.record(self.id, ActionKind::GetTokensFinish, None);
                self.release();
                None
            }
            ReadPurpose::ThenPay { token, recipient } => self.pay_after_read(token, recipient, ctx),
            ReadPurpose::Promotion => self.finish_promotion(ctx),
        }
    }

    /// Second phase of get-then-pay: propose a version above everything read.
    fn pay_after_read(
        &mut self,
        token: TokenId,
        recipient: AgentId,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        let Some(local) = self.my_tokens.get(&token).map(|t| t.version) else {
            self.release();
            return None;
        };

        let read = self.role.tokens().get(&token).cloned();
        if let Some(read) = &read {
            if read.version > local && read.owner != Some(self.id) {
                // Ownership moved on without us noticing
                debug!(agent = %self.id, %token, "pay aborted: token no longer owned");
                self.my_tokens.remove(&token);
                self.release();
                return None;
            }
        }

        let version = local.max(read.map_or(0, |t| t.version)) + 1;
        self.begin_pay(Message::pay(self.id, token, recipient, version), ctx)
    }

    /// Completes a PAY once a read quorum acknowledged it.
    pub(super) fn finish_pay(
        &mut self,
        token: TokenId,
        recipient: AgentId,
        version: u64,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        let paid = Token {
            id: token,
            version,
            owner: Some(recipient),
        };

        if let RoleState::Client(state) = &mut self.role {
            state.snapshot.merge_token(paid.clone());
        }
        self.my_tokens.remove(&token);
        ctx.hand_over(recipient, paid);

        ctx.record(self.id, ActionKind::PayFinish, None);
        debug!(agent = %self.id, %token, %recipient, version, "pay finished");
        self.release();
        None
    }
}
