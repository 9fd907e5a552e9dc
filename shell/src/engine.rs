//! Interface to the protocol-logic engine driven by the shell.
//!
//! The engine is the pure decision core of the failure detector:
//! probability-of-suspect calculus, gossip selection, incarnation
//! handling, local-health-multiplier adjustments. The shell never
//! reaches into it; it calls the methods below from the protocol loop
//! and executes the returned directives. Adding a directive variant is
//! a breaking change on purpose: every dispatcher match is exhaustive.

use std::time::Duration;

use swim_messages::{
    GossipPayload, Incarnation, Member, MemberStatusChange, Node, PingResponse, SeqNum, Status,
};

/// Whether timed-out suspects escalate to `unreachable` (requiring an
/// explicit [`Engine::confirm_dead`]) instead of directly to `dead`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Unreachability {
    Enabled,
    #[default]
    Disabled,
}

impl Unreachability {
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// Engine settings the shell needs to read back.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SwimSettings {
    pub unreachability: Unreachability,
}

/// Outcome of processing a piece of gossip carried by a message.
#[derive(Clone, Debug)]
pub enum GossipOutcome {
    /// Nothing changed; optionally log why at the given level.
    Ignored {
        level: Option<log::Level>,
        message: Option<String>,
    },
    Applied {
        change: Option<MemberStatusChange>,
    },
}

/// What to do after an inbound ping was handed to the engine.
#[derive(Clone, Debug)]
pub enum PingDirective {
    GossipProcessed(GossipOutcome),
    /// Acknowledge to `origin` that `target` (the local node) is alive.
    SendAck {
        origin: Node,
        target: Node,
        incarnation: Incarnation,
        payload: GossipPayload,
        seq: SeqNum,
    },
}

/// What to do after an inbound ping request was handed to the engine.
#[derive(Clone, Debug)]
pub enum PingRequestDirective {
    GossipProcessed(GossipOutcome),
    /// Probe `target` on behalf of `ping_request_origin`.
    SendPing {
        target: Node,
        ping_request_origin: Node,
        timeout: Duration,
        seq: SeqNum,
    },
    Ignore,
}

/// What to do after a probe of ours resolved (ack, nack or timeout).
#[derive(Clone, Debug)]
pub enum PingResponseDirective {
    GossipProcessed(GossipOutcome),
    SendAck {
        origin: Node,
        target: Node,
        incarnation: Incarnation,
        payload: GossipPayload,
        seq: SeqNum,
    },
    SendNack {
        origin: Node,
        target: Node,
        seq: SeqNum,
    },
    SendPingRequests(PingRequestFanout),
    Ignore,
}

/// Indirect probe of `target` through a set of relay members.
#[derive(Clone, Debug)]
pub struct PingRequestFanout {
    pub target: Node,
    /// The engine's current dynamic ping timeout; bounds every relay
    /// probe as well as the fan-out as a whole.
    pub timeout: Duration,
    pub requests: Vec<RelayRequest>,
}

/// One relay of a ping-request fan-out.
#[derive(Clone, Debug)]
pub struct RelayRequest {
    pub relay: Node,
    pub payload: GossipPayload,
    pub seq: SeqNum,
}

/// What to do after the decisive outcome of a ping-request fan-out.
#[derive(Clone, Debug)]
pub enum PingRequestResponseDirective {
    GossipProcessed(GossipOutcome),
    /// The target proved alive; `previous_status` is what we believed
    /// before.
    Alive { previous_status: Status },
    NewlySuspect {
        previous_status: Option<Status>,
        suspect: Member,
    },
    NackReceived,
    Ignore,
}

/// What to do on a protocol-period tick.
#[derive(Clone, Debug)]
pub enum TickDirective {
    Ignore,
    SendPing {
        target: Node,
        timeout: Duration,
        seq: SeqNum,
    },
}

/// Result of [`Engine::mark`].
#[derive(Clone, Debug)]
pub enum MarkResult {
    Applied {
        previous_status: Option<Status>,
        member: Member,
    },
    IgnoredDueToOlderStatus,
}

/// Result of [`Engine::confirm_dead`].
#[derive(Clone, Debug)]
pub enum ConfirmDeadResult {
    Applied { change: MemberStatusChange },
    Ignored,
}

/// The protocol-logic engine. Implementations are mutated exclusively
/// from the protocol loop, so none of the methods need interior
/// synchronization.
pub trait Engine: Send + 'static {
    /// An inbound ping from `origin` arrived.
    fn on_ping(
        &mut self,
        origin: Node,
        payload: GossipPayload,
        seq: SeqNum,
    ) -> Vec<PingDirective>;

    /// An inbound request to probe `target` on behalf of `origin` arrived.
    fn on_ping_request(
        &mut self,
        target: Node,
        origin: Node,
        payload: GossipPayload,
        seq: SeqNum,
    ) -> Vec<PingRequestDirective>;

    /// A ping of ours resolved. `ping_request_origin` is set when the
    /// ping was sent on behalf of another node's ping request.
    fn on_ping_response(
        &mut self,
        response: PingResponse,
        ping_request_origin: Option<Node>,
    ) -> Vec<PingResponseDirective>;

    /// Every single relay outcome of a ping-request fan-out, win or
    /// lose. Used for local-health bookkeeping only.
    fn on_every_ping_request_response(&mut self, response: PingResponse, target: Node);

    /// The decisive outcome of a ping-request fan-out: the first ack,
    /// or one aggregated timeout. The sequence number of an aggregated
    /// timeout carries no meaning and must not be correlated on.
    fn on_ping_request_response(
        &mut self,
        response: PingResponse,
        target: Node,
    ) -> Vec<PingRequestResponseDirective>;

    /// One protocol period elapsed; usually answers with the next
    /// random-member probe.
    fn on_periodic_ping_tick(&mut self) -> TickDirective;

    /// Transition a member to `status`, unless the engine already knows
    /// something newer.
    fn mark(&mut self, node: Node, status: Status) -> MarkResult;

    /// Move an unreachable member to `dead`.
    fn confirm_dead(&mut self, node: Node) -> ConfirmDeadResult;

    /// Select membership rumors to piggyback on a message to `to`.
    fn make_gossip_payload(&mut self, to: &Node) -> GossipPayload;

    fn next_sequence_number(&mut self) -> SeqNum;

    /// Members currently in `suspect` status, with their local
    /// suspicion start times.
    fn suspects(&self) -> Vec<Member>;

    fn all_members(&self) -> Vec<Member>;

    fn other_member_count(&self) -> usize;

    fn member_for(&self, node: &Node) -> Option<Member>;

    fn is_member(&self, node: &Node, ignore_uid: bool) -> bool;

    /// How long a member stays suspect before escalation, given how
    /// many nodes independently suspect it.
    fn suspicion_timeout(&self, suspected_by: usize) -> Duration;

    /// The configured base protocol period.
    fn protocol_period(&self) -> Duration;

    /// Protocol period stretched by the current local health multiplier.
    fn dynamic_lhm_protocol_interval(&self) -> Duration;

    /// Ping timeout stretched by the current local health multiplier.
    fn dynamic_lhm_ping_timeout(&self) -> Duration;

    fn settings(&self) -> &SwimSettings;
}
