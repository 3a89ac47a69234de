use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use log::{debug, info, warn};

use super::{HolePuncher, PunchContext};
use crate::transport::{Dispatcher, Message, MessageType};

/// Inbound entry point of a peer.
///
/// Offers start a responder session, punch packets mark their sender
/// reachable, and everything else goes to the application dispatcher.
/// Responder channels are routed back through this same dispatcher.
pub struct HolePunchRpc {
    context: PunchContext,
    application: Option<Arc<dyn Dispatcher>>,
    me: Weak<HolePunchRpc>,
}

impl HolePunchRpc {
    pub fn new(context: PunchContext, application: Option<Arc<dyn Dispatcher>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            context,
            application,
            me: me.clone(),
        })
    }

    pub fn context(&self) -> &PunchContext {
        &self.context
    }

    fn responder_context(&self) -> Option<PunchContext> {
        let me: Arc<dyn Dispatcher> = self.me.upgrade()?;
        let mut context = self.context.clone();
        context.dispatcher = Some(me);
        Some(context)
    }

    async fn handle_offer(&self, offer: Message) -> Option<Message> {
        let holes = offer.int_list.len().min(self.context.config.max_holes);
        if holes == 0 {
            warn!("offer {} from {} lists no ports", offer.message_id, offer.sender.peer_id);
            return Some(offer.response(MessageType::Denied, self.context.local_peer.clone()));
        }
        if holes < offer.int_list.len() {
            debug!("offer {} lists {} ports, capping at {}", offer.message_id, offer.int_list.len(), holes);
        }

        let fallback = offer.response(MessageType::Exception, self.context.local_peer.clone());
        let Some(context) = self.responder_context() else {
            warn!("offer {} from {} arrived while shutting down", offer.message_id, offer.sender.peer_id);
            return Some(fallback);
        };
        match HolePuncher::responder(context, holes, offer).reply().await {
            Ok(reply) => Some(reply),
            Err(_) => Some(fallback),
        }
    }
}

#[async_trait]
impl Dispatcher for HolePunchRpc {
    async fn dispatch(&self, message: Message, source: SocketAddr) -> Option<Message> {
        let fire_and_forget = message.fire_and_forget;

        let response = if message.command.is_hole_punch() {
            match message.message_type {
                MessageType::OFFER => self.handle_offer(message).await,
                MessageType::PUNCH => {
                    info!("punch from {} arrived via {}", message.sender.peer_id, source);
                    self.context
                        .reachability
                        .peer_found(&message.sender, &message.sender, None)
                        .await;
                    None
                }
                other => {
                    debug!("ignoring hole punch message of type {} from {}", other, source);
                    None
                }
            }
        } else if let Some(application) = &self.application {
            application.dispatch(message, source).await
        } else {
            debug!("no application handler for {} from {}", message, source);
            None
        };

        if fire_and_forget { None } else { response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use crate::config::HolePunchConfig;
    use crate::transport::holepunch::scheduler::TokioPunchScheduler;
    use crate::transport::{Command, PeerAddress, ReachablePeers, UdpChannelFactory, UdpMessenger};

    #[tokio::test]
    async fn test_offer_after_shutdown_gets_exception() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let factory = Arc::new(UdpChannelFactory::localhost());
        let bob = PeerAddress::new("bob", localhost, 4100, 4101);
        let rpc = HolePunchRpc {
            context: PunchContext {
                local_peer: bob.clone(),
                channel_factory: factory.clone(),
                messenger: Arc::new(UdpMessenger::new(factory)),
                dispatcher: None,
                reachability: Arc::new(ReachablePeers::new()),
                scheduler: Arc::new(TokioPunchScheduler::new()),
                config: HolePunchConfig::default(),
            },
            application: None,
            me: Weak::new(),
        };

        let alice = PeerAddress::new("alice", localhost, 4000, 4001);
        let mut offer = Message::new(Command::HOLE_PUNCH, MessageType::OFFER, alice.clone(), bob);
        offer.int_list = vec![5000, 5001];
        offer.requester = Some(alice);

        let reply = rpc.dispatch(offer.clone(), SocketAddr::new(localhost, 7001)).await.unwrap();
        assert_eq!(reply.message_type, MessageType::Exception);
        assert_eq!(reply.message_id, offer.message_id);
    }
}
