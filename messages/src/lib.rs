//! Protocol data model shared between the membership shell and the wire
//! codec: node identities, member statuses, gossip payloads and the
//! messages exchanged between cluster nodes.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Counter a node attaches to its own status to defeat stale rumors.
pub type Incarnation = u64;

/// Correlates a probe with its response or timeout.
pub type SeqNum = u64;

/// Stable logical identity of a cluster node.
///
/// The UID distinguishes a node from a different process that later
/// binds the same address. A `Node` without UID is an address-only
/// identity, used when the UID is not (yet) known.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub addr: SocketAddr,
    pub uid: Option<u64>,
}

impl Node {
    pub fn new(addr: SocketAddr, uid: Option<u64>) -> Self {
        Self { addr, uid }
    }

    /// The address-only form of this identity.
    pub fn without_uid(&self) -> Self {
        Self {
            addr: self.addr,
            uid: None,
        }
    }

    /// Whether both nodes bind the same address, regardless of UID.
    pub fn same_address(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uid {
            Some(uid) => write!(f, "{}#{}", self.addr, uid),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    /// Parses `host:port` or `host:port#uid`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, uid) = match s.split_once('#') {
            Some((addr, uid)) => {
                let uid = uid
                    .parse()
                    .map_err(|_| NodeParseError::InvalidUid(uid.to_string()))?;
                (addr, Some(uid))
            }
            None => (s, None),
        };
        let addr = addr
            .parse()
            .map_err(|_| NodeParseError::InvalidAddress(addr.to_string()))?;
        Ok(Self { addr, uid })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeParseError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
    #[error("Invalid node UID: {0}")]
    InvalidUid(String),
}

/// Membership status of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Alive {
        incarnation: Incarnation,
    },
    /// Failed a probe; escalates after the suspicion timeout.
    Suspect {
        incarnation: Incarnation,
        suspected_by: BTreeSet<Node>,
    },
    Unreachable {
        incarnation: Incarnation,
    },
    Dead,
}

impl Status {
    pub fn incarnation(&self) -> Option<Incarnation> {
        match self {
            Self::Alive { incarnation }
            | Self::Suspect { incarnation, .. }
            | Self::Unreachable { incarnation } => Some(*incarnation),
            Self::Dead => None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Alive { .. } | Self::Suspect { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        !self.is_reachable()
    }

    pub fn is_suspect(&self) -> bool {
        matches!(self, Self::Suspect { .. })
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// A cluster node together with its currently known status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub node: Node,
    pub status: Status,
    /// Local bookkeeping only, never gossiped: when this node started
    /// suspecting the member.
    #[serde(skip)]
    pub suspicion_started_at: Option<Instant>,
}

impl Member {
    pub fn new(node: Node, status: Status) -> Self {
        Self {
            node,
            status,
            suspicion_started_at: None,
        }
    }

    pub fn alive(node: Node, incarnation: Incarnation) -> Self {
        Self::new(node, Status::Alive { incarnation })
    }

    pub fn incarnation(&self) -> Option<Incarnation> {
        self.status.incarnation()
    }
}

/// Status change of a cluster member, as delivered to the embedder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberStatusChange {
    /// `None` when the member is seen for the first time.
    pub previous_status: Option<Status>,
    pub member: Member,
}

impl MemberStatusChange {
    pub fn status(&self) -> &Status {
        &self.member.status
    }

    /// Whether the transition crosses the reachable (alive/suspect) vs.
    /// unreachable (unreachable/dead) boundary. A member seen for the
    /// first time always counts as crossing it.
    pub fn is_reachability_change(&self) -> bool {
        match &self.previous_status {
            Some(previous) => previous.is_reachable() != self.member.status.is_reachable(),
            None => true,
        }
    }
}

impl fmt::Display for MemberStatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:?} -> {:?}",
            self.member.node, self.previous_status, self.member.status
        )
    }
}

/// Membership rumors piggybacked on protocol messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum GossipPayload {
    #[default]
    None,
    Membership(Vec<Member>),
}

impl GossipPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A protocol message exchanged between cluster nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Ping {
        reply_to: Node,
        payload: GossipPayload,
        seq: SeqNum,
    },
    /// Ask the receiver to probe `target` on behalf of `reply_to`.
    PingRequest {
        target: Node,
        reply_to: Node,
        payload: GossipPayload,
        seq: SeqNum,
    },
    Response(PingResponse),
}

/// Outcome of a probe. `Timeout` never travels on the wire; it is
/// fabricated locally when a probe goes unanswered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PingResponse {
    Ack {
        target: Node,
        incarnation: Incarnation,
        payload: GossipPayload,
        seq: SeqNum,
    },
    Nack {
        target: Node,
        seq: SeqNum,
    },
    Timeout {
        target: Node,
        ping_request_origin: Option<Node>,
        timeout: Duration,
        seq: SeqNum,
    },
}

impl PingResponse {
    pub fn seq(&self) -> SeqNum {
        match self {
            Self::Ack { seq, .. } | Self::Nack { seq, .. } | Self::Timeout { seq, .. } => *seq,
        }
    }

    pub fn target(&self) -> &Node {
        match self {
            Self::Ack { target, .. }
            | Self::Nack { target, .. }
            | Self::Timeout { target, .. } => target,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}
