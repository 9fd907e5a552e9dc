//! Addressable views of cluster nodes, bound to the outbound side of
//! the transport.

use std::hash::{Hash, Hasher};

use swim_messages::{GossipPayload, Incarnation, Message, Node, PingResponse, SeqNum};
use tokio::sync::mpsc;

use crate::QueueFull;

/// A wire message addressed to a node, ready for the transport to
/// encode and send.
#[derive(Clone, Debug, PartialEq)]
pub struct Datagram {
    pub to: Node,
    pub message: Message,
}

/// Cloneable sender half of the outbound datagram queue. The UDP
/// transport owns the receiver half.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    tx: mpsc::Sender<Datagram>,
}

impl ChannelHandle {
    pub fn new(tx: mpsc::Sender<Datagram>) -> Self {
        Self { tx }
    }

    pub fn send(&self, to: Node, message: Message) -> Result<(), QueueFull> {
        Ok(self.tx.try_send(Datagram { to, message })?)
    }
}

/// A node identity bound to the transport channel. Peers are cheap
/// views, not owned resources: any peer for the same node is
/// interchangeable for send operations.
#[derive(Clone, Debug)]
pub struct Peer {
    node: Node,
    channel: ChannelHandle,
}

impl Peer {
    pub fn new(node: Node, channel: ChannelHandle) -> Self {
        Self { node, channel }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Probe this peer. The response (or its absence) is correlated by
    /// `seq`.
    pub fn ping(&self, payload: GossipPayload, from: &Node, seq: SeqNum) -> Result<(), QueueFull> {
        self.channel.send(
            self.node.clone(),
            Message::Ping {
                reply_to: from.clone(),
                payload,
                seq,
            },
        )
    }

    /// Ask this peer to probe `target` on our behalf.
    pub fn ping_request(
        &self,
        target: Node,
        payload: GossipPayload,
        from: &Node,
        seq: SeqNum,
    ) -> Result<(), QueueFull> {
        self.channel.send(
            self.node.clone(),
            Message::PingRequest {
                target,
                reply_to: from.clone(),
                payload,
                seq,
            },
        )
    }

    /// Acknowledge a probe of `target` (positively).
    pub fn ack(
        &self,
        seq: SeqNum,
        target: Node,
        incarnation: Incarnation,
        payload: GossipPayload,
    ) -> Result<(), QueueFull> {
        self.channel.send(
            self.node.clone(),
            Message::Response(PingResponse::Ack {
                target,
                incarnation,
                payload,
                seq,
            }),
        )
    }

    /// Tell the ping-request origin that we could not reach `target`.
    pub fn nack(&self, seq: SeqNum, target: Node) -> Result<(), QueueFull> {
        self.channel.send(
            self.node.clone(),
            Message::Response(PingResponse::Nack { target, seq }),
        )
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
    }
}
