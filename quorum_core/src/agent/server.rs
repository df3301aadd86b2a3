//! Server handlers: replica writes, reads and replica pushes.

use super::{Agent, Outbound, RoleState};
use crate::context::SimulationContext;
use quorum_env::{AgentId, Message, Payload, Recipient, Token, TokenId};
use tracing::trace;

impl Agent {
    /// Unsolicited messages reaching a server.
    pub(super) fn handle_as_server(
        &mut self,
        msg: Message,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        match msg.payload {
            Payload::Pay {
                token,
                recipient,
                version,
            } => self.apply_pay(msg.sender, token, recipient, version, ctx),
            Payload::GetTokens { request } => {
                let tokens = self.role.tokens().tokens();
                Some(self.reply_to(msg.sender, Payload::AckGetTokens { request, tokens }))
            }
            Payload::DbUpdate { request, tokens } => {
                let merged = self.role.tokens_mut().merge_all(tokens);
                trace!(server = %self.id, from = %msg.sender, merged, "db update");
                Some(self.reply_to(msg.sender, Payload::AckDbUpdate { request }))
            }
            // A demoting server waits on write quorum too
            Payload::TurnedToClient => self.reevaluate(ctx),
            Payload::TurnedToServer => self.forward_pending(msg.sender),
            _ => None,
        }
    }

    /// Applies a strictly newer PAY; re-acknowledges an identical one.
    fn apply_pay(
        &mut self,
        payer: AgentId,
        token: TokenId,
        recipient: AgentId,
        version: u64,
        ctx: &mut SimulationContext,
    ) -> Option<Outbound> {
        let RoleState::Server(state) = &mut self.role else {
            return None;
        };

        let stored = state.replica.get(&token);
        let stored_version = stored.map_or(0, |t| t.version);
        let is_retry = stored.is_some_and(|t| t.version == version && t.owner == Some(recipient));

        if version > stored_version || stored.is_none() {
            state.replica.insert(Token {
                id: token,
                version,
                owner: Some(recipient),
            });
            ctx.note_pay_accepted(self.id, payer, token, version);
        } else if !is_retry {
            trace!(server = %self.id, %token, version, stored_version, "stale pay ignored");
            ctx.metrics_mut().stale_writes += 1;
            return None;
        }

        Some(self.reply_to(payer, Payload::AckPay { token, version }))
    }

    fn reply_to(&self, target: AgentId, payload: Payload) -> Outbound {
        Outbound::Reply(Message::new(self.id, Recipient::Agent(target), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{cluster, initial_db};
    use super::*;
    use crate::config::ProtocolConfig;
    use proptest::prelude::*;
    use quorum_env::{MessageType, TokenDb};

    fn payer() -> AgentId {
        AgentId::from_seed(100)
    }

    fn pay_to(server: AgentId, token: TokenId, recipient: AgentId, version: u64) -> Message {
        Message::pay(payer(), token, recipient, version).addressed_to(server)
    }

    #[test]
    fn test_newer_pay_is_applied_and_acked() {
        let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
        let server = &mut servers[0];
        let token = TokenId::from_seed(0);
        let buyer = AgentId::from_seed(101);

        let ack = server
            .step(Some(pay_to(server.id(), token, buyer, 1)), &mut ctx)
            .expect("ack");

        assert_eq!(ack.kind(), MessageType::AckPay);
        assert_eq!(ack.target(), Some(payer()));
        let stored = server.tokens().get(&token).cloned().unwrap();
        assert_eq!((stored.version, stored.owner), (1, Some(buyer)));
    }

    #[test]
    fn test_identical_pay_is_reacked_without_reapplying() {
        let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
        let server = &mut servers[0];
        let token = TokenId::from_seed(0);
        let buyer = AgentId::from_seed(101);

        ctx.note_pay_started(payer(), token, 1);
        server.step(Some(pay_to(server.id(), token, buyer, 1)), &mut ctx);
        let again = server.step(Some(pay_to(server.id(), token, buyer, 1)), &mut ctx);

        assert!(again.is_some());
        assert_eq!(server.tokens().get(&token).map(|t| t.version), Some(1));
        assert_eq!(ctx.metrics().stale_writes, 0);
    }

    #[test]
    fn test_stale_pay_is_ignored() {
        let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
        let server = &mut servers[0];
        let token = TokenId::from_seed(0);

        server.step(Some(pay_to(server.id(), token, AgentId::from_seed(101), 3)), &mut ctx);
        let stale = server.step(Some(pay_to(server.id(), token, AgentId::from_seed(102), 2)), &mut ctx);
        let conflicting =
            server.step(Some(pay_to(server.id(), token, AgentId::from_seed(102), 3)), &mut ctx);

        assert!(stale.is_none());
        assert!(conflicting.is_none());
        assert_eq!(ctx.metrics().stale_writes, 2);
        assert_eq!(
            server.tokens().get(&token).and_then(|t| t.owner),
            Some(AgentId::from_seed(101))
        );
    }

    #[test]
    fn test_get_tokens_returns_full_replica() {
        let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
        let server = &mut servers[0];

        let reply = server
            .step(Some(Message::get_tokens(payer(), 7).addressed_to(server.id())), &mut ctx)
            .expect("reply");

        match reply.payload {
            Payload::AckGetTokens { request, tokens } => {
                assert_eq!(request, 7);
                assert_eq!(tokens.len(), 2);
            }
            other => panic!("expected ACK_GET_TOKENS, got {other:?}"),
        }
    }

    #[test]
    fn test_db_update_merges_by_version() {
        let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
        let server = &mut servers[0];
        let pusher = AgentId::from_seed(1);
        let newer = Token {
            id: TokenId::from_seed(0),
            version: 5,
            owner: Some(pusher),
        };
        let older = Token {
            id: TokenId::from_seed(9),
            version: 0,
            owner: None,
        };

        let update = Message::new(
            pusher,
            Recipient::Agent(server.id()),
            Payload::DbUpdate {
                request: 3,
                tokens: vec![newer.clone(), older],
            },
        );
        let reply = server.step(Some(update), &mut ctx).expect("ack");

        assert_eq!(reply.request(), Some(3));
        assert_eq!(server.tokens().get(&newer.id), Some(&newer));
        assert_eq!(server.tokens().len(), 3);
    }

    #[test]
    fn test_server_ledger_stays_dormant() {
        let me = AgentId::from_seed(0);
        let mut server = Agent::server(me, initial_db(me, 2));
        server.receive_token(Token::owned_by(TokenId::from_seed(5), me));

        assert_eq!(server.my_tokens().len(), 3);
        // The replica only changes through PAY
        assert_eq!(server.tokens().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_stored_version_never_decreases(versions in proptest::collection::vec(0u64..20, 1..40)) {
            let (mut ctx, mut servers) = cluster(3, ProtocolConfig::default());
            let server = &mut servers[0];
            let token = TokenId::from_seed(0);
            let buyer = AgentId::from_seed(101);

            let mut previous = 0;
            for version in versions {
                let acked = server
                    .step(Some(pay_to(server.id(), token, buyer, version)), &mut ctx)
                    .is_some();
                let stored = server.tokens().get(&token).map_or(0, |t| t.version);

                prop_assert!(stored >= previous);
                if acked && version > previous {
                    prop_assert_eq!(stored, version);
                }
                if !acked {
                    prop_assert_eq!(stored, previous);
                }
                previous = stored;
            }
        }

        #[test]
        fn prop_merge_is_order_independent(updates in proptest::collection::vec((0u64..4, 0u64..10), 0..30)) {
            let owner = AgentId::from_seed(1);
            let tokens: Vec<Token> = updates
                .iter()
                .map(|&(id, version)| Token { id: TokenId::from_seed(id), version, owner: Some(owner) })
                .collect();

            let mut forward = TokenDb::new();
            forward.merge_all(tokens.clone());
            let mut backward = TokenDb::new();
            backward.merge_all(tokens.into_iter().rev());

            let versions = |db: &TokenDb| db.iter().map(|t| (t.id, t.version)).collect::<Vec<_>>();
            prop_assert_eq!(versions(&forward), versions(&backward));
        }
    }
}
