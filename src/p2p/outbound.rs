//! Outbound message primitives
//!
//! The gossip handler pushes replies and relays through [`PeerNetwork`];
//! the connection layer drains the queue and does the actual I/O.

use tokio::sync::mpsc;
use tracing::trace;

use super::{InvItem, Message, PeerId};

/// Send primitive the gossip layer depends on
pub trait PeerNetwork: Send + Sync {
    /// Queue a message for one peer
    fn send(&self, peer: &PeerId, message: Message);

    /// Announce an inventory item to every connected peer
    fn relay_inv(&self, item: InvItem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: Target,
    pub message: Message,
}

/// Unbounded queue of outbound messages
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::UnboundedSender<Outbound>,
}

impl OutboundQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn push(&self, outbound: Outbound) {
        trace!("Queueing {} for {:?}", outbound.message.command(), outbound.target);
        // Receiver gone means the node is shutting down
        let _ = self.sender.send(outbound);
    }
}

impl PeerNetwork for OutboundQueue {
    fn send(&self, peer: &PeerId, message: Message) {
        self.push(Outbound {
            target: Target::Peer(*peer),
            message,
        });
    }

    fn relay_inv(&self, item: InvItem) {
        self.push(Outbound {
            target: Target::All,
            message: Message::Inv(vec![item]),
        });
    }
}
