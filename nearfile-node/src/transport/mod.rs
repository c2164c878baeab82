//! Transport channels: uniform send/receive over the datagram and radio links.
//!
//! Each channel owns its sockets (or radio link) exclusively. Inbound traffic
//! is decoded by the channel and delivered as [`Inbound`] on the sender handed
//! to [`TransportChannel::on_receive`]; the session dispatches from there.

pub mod datagram;
pub mod radio;

use std::net::SocketAddr;

use async_trait::async_trait;
use nearfile_core::{LinkKind, Message, Peer, TransportError};
use tokio::sync::mpsc;

pub use datagram::DatagramChannel;
pub use radio::{RadioChannel, RadioLink, RadioNotification};

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Datagram(SocketAddr),
    /// The radio link is point-to-point; there is nothing to address.
    Radio,
}

impl Origin {
    pub fn link(&self) -> LinkKind {
        match self {
            Origin::Datagram(_) => LinkKind::Datagram,
            Origin::Radio => LinkKind::Radio,
        }
    }

    /// Whether traffic from here belongs to `peer`: its radio link, or one of
    /// its sockets. While either port is still unknown the address alone decides.
    pub fn is_from(&self, peer: &Peer) -> bool {
        match self {
            Origin::Radio => peer.link == LinkKind::Radio,
            Origin::Datagram(addr) => {
                if peer.address != Some(addr.ip()) {
                    return false;
                }
                let known = [peer.control_port, peer.data_port];
                known.contains(&None) || known.contains(&Some(addr.port()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Message { origin: Origin, message: Message },
    /// The underlying link dropped (radio disconnect notification).
    LinkDropped(LinkKind),
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;

#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn link(&self) -> LinkKind;

    /// False once the underlying link is known to be down.
    fn is_up(&self) -> bool {
        true
    }

    /// Send one message to `peer`.
    async fn send(&self, peer: &Peer, message: &Message) -> Result<(), TransportError>;

    /// Send back to wherever an inbound message came from.
    async fn reply(&self, origin: &Origin, message: &Message) -> Result<(), TransportError>;

    /// Reply with whatever redundancy the link needs. `peer` is the known
    /// sender, when there is one. Succeeds if any copy went out.
    async fn reply_redundant(
        &self,
        origin: &Origin,
        _peer: Option<&Peer>,
        message: &Message,
    ) -> Result<(), TransportError> {
        self.reply(origin, message).await
    }

    /// Start delivering inbound traffic to `handler`. Replaces any previous handler.
    fn on_receive(&self, handler: InboundSender);

    /// Stop receiving and release the link.
    async fn close(&self);
}
