//! The protocol loop: a single task owning the engine and all shell
//! state, driving it from inbound messages, in-process requests and
//! timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use swim_messages::{
    GossipPayload, Member, MemberStatusChange, Message, Node, PingResponse, SeqNum, Status,
};

use crate::engine::{
    ConfirmDeadResult, Engine, GossipOutcome, MarkResult, PingDirective, PingRequestDirective,
    PingRequestFanout, PingRequestResponseDirective, PingResponseDirective, RelayRequest,
    TickDirective,
};
use crate::peer::{ChannelHandle, Peer};
use crate::timer::TimerHandle;
use crate::task_manager::TaskManager;
use crate::QueueFull;

/// Timeout for the one-shot pings sent to initial contact points.
const MONITOR_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the internal queue carrying timer fires back into the
/// loop.
const LOOP_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub local_node: Node,
    /// Cluster nodes probed on startup to join the membership.
    pub initial_contact_points: Vec<Node>,
    pub start_periodic_pings: bool,
    /// How long to wait before re-probing an unresponsive contact point.
    pub monitor_retry_interval: Duration,
    /// `None` keeps probing unresponsive contact points forever.
    pub monitor_max_attempts: Option<u32>,
    pub commands_queue_size: usize,
    pub events_queue_size: usize,
    pub shutdown_timeout: Duration,
}

impl ShellConfig {
    pub fn new(local_node: Node) -> Self {
        Self {
            local_node,
            initial_contact_points: Vec::new(),
            start_periodic_pings: true,
            monitor_retry_interval: Duration::from_secs(5),
            monitor_max_attempts: None,
            commands_queue_size: 100,
            events_queue_size: 100,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// In-process requests accepted by the loop.
#[derive(Debug)]
enum Command {
    Monitor(Node),
    ConfirmDead(Node),
}

/// Timer fires and synthesized completions re-entering the loop.
#[derive(Debug)]
enum LoopEvent {
    PeriodicTick,
    ProbeTimeout { seq: SeqNum },
    FanoutTimeout { id: FanoutId },
    RetryMonitor { node: Node, attempt: u32 },
}

type FanoutId = u64;

enum ProbeKind {
    /// A ping sent by us, possibly on behalf of a ping-request origin.
    Direct {
        target: Node,
        ping_request_origin: Option<Node>,
    },
    /// A one-shot ping probing an initial contact point.
    Monitor { node: Node, attempt: u32 },
    /// A ping request relayed through another member.
    Relayed { target: Node, fanout: FanoutId },
}

struct PendingProbe {
    kind: ProbeKind,
    timeout: Duration,
    timer: TimerHandle,
}

/// A ping-request fan-out awaiting its decisive outcome: the first ack
/// wins; otherwise the fan-out timer fires one aggregated timeout.
struct Fanout {
    target: Node,
    timeout: Duration,
    timer: TimerHandle,
}

/// Cloneable handle to the protocol loop. The loop stops when the last
/// clone is dropped.
#[derive(Clone)]
pub struct ShellHandle {
    commands_tx: mpsc::Sender<Command>,
    _task_manager: Arc<TaskManager>, // ensures the loop is stopped when the last handle is dropped
}

impl ShellHandle {
    /// Start monitoring `node`: probe it and, once it answers, let the
    /// engine take it from there. Monitoring the local node is a no-op.
    pub fn start_monitoring(&self, node: Node) -> Result<(), QueueFull> {
        log::debug!("Queueing monitor request for {node}");
        Ok(self.commands_tx.try_send(Command::Monitor(node))?)
    }

    /// Declare an unreachable member dead. Requires the unreachability
    /// extension to be enabled in the engine settings.
    pub fn confirm_dead(&self, node: Node) -> Result<(), QueueFull> {
        log::debug!("Queueing confirm-dead request for {node}");
        Ok(self.commands_tx.try_send(Command::ConfirmDead(node))?)
    }
}

/// Spawn the protocol loop. Returns the stream of membership change
/// notifications and a handle for in-process requests.
///
/// `channel` carries outbound datagrams to the transport; `inbound_rx`
/// delivers decoded inbound messages from it.
pub fn start_shell<E: Engine>(
    engine: E,
    config: ShellConfig,
    channel: ChannelHandle,
    inbound_rx: mpsc::Receiver<Message>,
) -> (
    impl Stream<Item = MemberStatusChange> + Send + Unpin + 'static,
    ShellHandle,
) {
    let (commands_tx, commands_rx) = mpsc::channel(config.commands_queue_size);
    let (events_tx, events_rx) = mpsc::channel(config.events_queue_size);
    let (loop_tx, loop_rx) = mpsc::channel(LOOP_QUEUE_SIZE);
    let shutdown_timeout = config.shutdown_timeout;

    let shell = Shell {
        engine,
        local: Peer::new(config.local_node.clone(), channel.clone()),
        channel,
        config,
        commands_rx,
        inbound_rx,
        loop_tx,
        loop_rx,
        events_tx,
        pending_probes: HashMap::new(),
        fanouts: HashMap::new(),
        next_fanout_id: 0,
        next_tick: None,
    };

    let mut task_manager = TaskManager::new(shutdown_timeout);
    task_manager.spawn(|c| shell.run(c));
    let handle = ShellHandle {
        commands_tx,
        _task_manager: Arc::new(task_manager),
    };
    let events = ReceiverStream::new(events_rx).map(|event| {
        #[cfg(feature = "metrics")]
        crate::metrics::EVENTS_QUEUE_SIZE.dec();
        event
    });
    (events, handle)
}

struct Shell<E> {
    engine: E,
    local: Peer,
    channel: ChannelHandle,
    config: ShellConfig,
    commands_rx: mpsc::Receiver<Command>,
    inbound_rx: mpsc::Receiver<Message>,
    loop_tx: mpsc::Sender<LoopEvent>,
    loop_rx: mpsc::Receiver<LoopEvent>,
    events_tx: mpsc::Sender<MemberStatusChange>,
    pending_probes: HashMap<SeqNum, PendingProbe>,
    fanouts: HashMap<FanoutId, Fanout>,
    next_fanout_id: FanoutId,
    next_tick: Option<TimerHandle>,
}

impl<E: Engine> Shell<E> {
    async fn run(mut self, cancel_token: CancellationToken) {
        log::info!("Protocol loop starting for {}", self.local.node());
        self.announce_startup();
        let contacts = std::mem::take(&mut self.config.initial_contact_points);
        for node in contacts {
            self.handle_monitor(node, 1);
        }
        if self.config.start_periodic_pings {
            self.handle_periodic_tick();
        }

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                Some(command) = self.commands_rx.recv() => self.handle_command(command),
                Some(message) = self.inbound_rx.recv() => self.handle_inbound(message),
                Some(event) = self.loop_rx.recv() => self.handle_loop_event(event),
            }
        }

        if let Some(tick) = self.next_tick.take() {
            tick.cancel();
        }
        log::info!("Protocol loop for {} shutting down", self.local.node());
    }

    /// The local node is announced alive exactly once, before anything
    /// else is reported.
    fn announce_startup(&mut self) {
        let member = self
            .engine
            .member_for(self.local.node())
            .unwrap_or_else(|| Member::alive(self.local.node().clone(), 0));
        self.announce(MemberStatusChange {
            previous_status: None,
            member,
        });
    }

    fn handle_command(&mut self, command: Command) {
        log::trace!("Handling command: {command:?}");
        match command {
            Command::Monitor(node) => self.handle_monitor(node, 1),
            Command::ConfirmDead(node) => self.handle_confirm_dead(node),
        }
    }

    fn handle_loop_event(&mut self, event: LoopEvent) {
        log::trace!("Handling loop event: {event:?}");
        match event {
            LoopEvent::PeriodicTick => self.handle_periodic_tick(),
            LoopEvent::ProbeTimeout { seq } => self.handle_probe_timeout(seq),
            LoopEvent::FanoutTimeout { id } => self.handle_fanout_timeout(id),
            LoopEvent::RetryMonitor { node, attempt } => self.handle_monitor(node, attempt),
        }
    }

    fn handle_inbound(&mut self, message: Message) {
        log::trace!("Handling inbound message: {message:?}");
        match message {
            Message::Ping {
                reply_to,
                payload,
                seq,
            } => {
                let directives = self.engine.on_ping(reply_to, payload, seq);
                for directive in directives {
                    match directive {
                        PingDirective::GossipProcessed(outcome) => {
                            self.handle_gossip_outcome(outcome)
                        }
                        PingDirective::SendAck {
                            origin,
                            target,
                            incarnation,
                            payload,
                            seq,
                        } => {
                            debug_assert_eq!(
                                &target,
                                self.local.node(),
                                "the acknowledged target must be the local node"
                            );
                            self.peer(&origin)
                                .ack(seq, target, incarnation, payload)
                                .unwrap_or_else(|e| {
                                    log::debug!("Cannot ack ping {seq} to {origin}: {e}")
                                });
                        }
                    }
                }
            }
            Message::PingRequest {
                target,
                reply_to,
                payload,
                seq,
            } => {
                let directives = self.engine.on_ping_request(target, reply_to, payload, seq);
                for directive in directives {
                    match directive {
                        PingRequestDirective::GossipProcessed(outcome) => {
                            self.handle_gossip_outcome(outcome)
                        }
                        PingRequestDirective::SendPing {
                            target,
                            ping_request_origin,
                            timeout,
                            seq,
                        } => self.send_ping(target, Some(ping_request_origin), timeout, seq),
                        PingRequestDirective::Ignore => log::trace!("Ignoring ping request"),
                    }
                }
            }
            Message::Response(response) => self.handle_response(response),
        }
    }

    /// Resolve a pending probe with an inbound ack or nack.
    fn handle_response(&mut self, response: PingResponse) {
        let seq = response.seq();
        let Some(probe) = self.pending_probes.remove(&seq) else {
            log::warn!("Response for unknown sequence number {seq}: {response:?}");
            return;
        };
        #[cfg(feature = "metrics")]
        crate::metrics::PENDING_PROBES.dec();
        probe.timer.cancel();

        match probe.kind {
            ProbeKind::Direct {
                ping_request_origin,
                ..
            } => {
                let directives = self.engine.on_ping_response(response, ping_request_origin);
                self.dispatch_ping_response_directives(directives);
            }
            ProbeKind::Monitor { node, .. } => {
                log::debug!("Initial contact point {node} answered");
                let directives = self.engine.on_ping_response(response, None);
                self.dispatch_ping_response_directives(directives);
            }
            ProbeKind::Relayed { target, fanout } => {
                self.engine
                    .on_every_ping_request_response(response.clone(), target.clone());
                if !response.is_ack() {
                    return;
                }
                // the first ack wins the fan-out; later acks only feed
                // the every-response stream
                match self.fanouts.remove(&fanout) {
                    Some(decided) => {
                        #[cfg(feature = "metrics")]
                        crate::metrics::FANOUTS_IN_FLIGHT.dec();
                        decided.timer.cancel();
                        let directives =
                            self.engine.on_ping_request_response(response, target.clone());
                        self.dispatch_ping_request_response_directives(directives, &target);
                    }
                    None => {
                        log::trace!("Ack for an already decided ping-request fan-out for {target}")
                    }
                }
            }
        }
    }

    fn handle_probe_timeout(&mut self, seq: SeqNum) {
        let Some(probe) = self.pending_probes.remove(&seq) else {
            log::trace!("Timeout for already resolved probe {seq}");
            return;
        };
        #[cfg(feature = "metrics")]
        crate::metrics::PENDING_PROBES.dec();
        probe.timer.cancel();

        match probe.kind {
            ProbeKind::Direct {
                target,
                ping_request_origin,
            } => {
                let response = PingResponse::Timeout {
                    target,
                    ping_request_origin: ping_request_origin.clone(),
                    timeout: probe.timeout,
                    seq,
                };
                let directives = self.engine.on_ping_response(response, ping_request_origin);
                self.dispatch_ping_response_directives(directives);
            }
            ProbeKind::Monitor { node, attempt } => self.retry_monitor(node, attempt),
            ProbeKind::Relayed { target, .. } => {
                // only the fan-out timer produces the decisive outcome
                let response = PingResponse::Timeout {
                    target: target.clone(),
                    ping_request_origin: None,
                    timeout: probe.timeout,
                    seq,
                };
                self.engine.on_every_ping_request_response(response, target);
            }
        }
    }

    fn handle_fanout_timeout(&mut self, id: FanoutId) {
        let Some(fanout) = self.fanouts.remove(&id) else {
            log::trace!("Fan-out {id} already decided");
            return;
        };
        #[cfg(feature = "metrics")]
        crate::metrics::FANOUTS_IN_FLIGHT.dec();
        log::debug!(
            "No ack for the ping request to {} within {:?}",
            fanout.target,
            fanout.timeout
        );
        // the sequence number of an aggregated timeout carries no meaning
        let response = PingResponse::Timeout {
            target: fanout.target.clone(),
            ping_request_origin: None,
            timeout: fanout.timeout,
            seq: 0,
        };
        let directives = self
            .engine
            .on_ping_request_response(response, fanout.target.clone());
        self.dispatch_ping_request_response_directives(directives, &fanout.target);
    }

    fn dispatch_ping_response_directives(&mut self, directives: Vec<PingResponseDirective>) {
        for directive in directives {
            match directive {
                PingResponseDirective::GossipProcessed(outcome) => {
                    self.handle_gossip_outcome(outcome)
                }
                PingResponseDirective::SendAck {
                    origin,
                    target,
                    incarnation,
                    payload,
                    seq,
                } => {
                    self.peer(&origin)
                        .ack(seq, target, incarnation, payload)
                        .unwrap_or_else(|e| log::debug!("Cannot ack to {origin}: {e}"));
                }
                PingResponseDirective::SendNack { origin, target, seq } => {
                    self.peer(&origin)
                        .nack(seq, target)
                        .unwrap_or_else(|e| log::debug!("Cannot nack to {origin}: {e}"));
                }
                PingResponseDirective::SendPingRequests(fanout) => {
                    self.send_ping_requests(fanout)
                }
                PingResponseDirective::Ignore => log::trace!("Ignoring ping response"),
            }
        }
    }

    fn dispatch_ping_request_response_directives(
        &mut self,
        directives: Vec<PingRequestResponseDirective>,
        target: &Node,
    ) {
        for directive in directives {
            match directive {
                PingRequestResponseDirective::GossipProcessed(outcome) => {
                    self.handle_gossip_outcome(outcome)
                }
                PingRequestResponseDirective::Alive { previous_status } => {
                    if !previous_status.is_unreachable() {
                        continue;
                    }
                    match self.engine.member_for(target) {
                        Some(member) => self.try_announce(Some(MemberStatusChange {
                            previous_status: Some(previous_status),
                            member,
                        })),
                        None => log::debug!("{target} is alive again but no longer a member"),
                    }
                }
                PingRequestResponseDirective::NewlySuspect {
                    previous_status,
                    suspect,
                } => {
                    log::debug!("{} is now suspect", suspect.node);
                    self.try_announce(Some(MemberStatusChange {
                        previous_status,
                        member: suspect,
                    }));
                }
                PingRequestResponseDirective::NackReceived => {
                    log::debug!("Nack received for the ping request to {target}")
                }
                PingRequestResponseDirective::Ignore => {
                    log::trace!("Ignoring ping request response")
                }
            }
        }
    }

    fn handle_gossip_outcome(&mut self, outcome: GossipOutcome) {
        match outcome {
            GossipOutcome::Applied { change } => self.try_announce(change),
            GossipOutcome::Ignored { level, message } => {
                if let (Some(level), Some(message)) = (level, message) {
                    log::log!(level, "{message}");
                }
            }
        }
    }

    /// Send a direct probe and arm its timeout. A transport error is
    /// absorbed as an immediate timeout.
    fn send_ping(
        &mut self,
        target: Node,
        ping_request_origin: Option<Node>,
        timeout: Duration,
        seq: SeqNum,
    ) {
        let payload = self.engine.make_gossip_payload(&target);
        log::debug!("Pinging {target} (seq {seq})");
        self.register_probe(
            seq,
            ProbeKind::Direct {
                target: target.clone(),
                ping_request_origin,
            },
            timeout,
        );
        if let Err(e) = self.peer(&target).ping(payload, self.local.node(), seq) {
            log::debug!("Cannot ping {target}: {e}");
            let _ = self.loop_tx.try_send(LoopEvent::ProbeTimeout { seq });
        }
    }

    fn send_ping_requests(&mut self, fanout: PingRequestFanout) {
        let PingRequestFanout {
            target,
            timeout,
            requests,
        } = fanout;
        if requests.is_empty() {
            log::debug!("No members to relay a ping request for {target} through");
            return;
        }
        let id = self.next_fanout_id;
        self.next_fanout_id += 1;
        log::debug!(
            "Relaying a ping request for {target} through {} members",
            requests.len()
        );

        for request in requests {
            let RelayRequest {
                relay,
                payload,
                seq,
            } = request;
            self.register_probe(
                seq,
                ProbeKind::Relayed {
                    target: target.clone(),
                    fanout: id,
                },
                timeout,
            );
            if let Err(e) =
                self.peer(&relay)
                    .ping_request(target.clone(), payload, self.local.node(), seq)
            {
                log::debug!("Cannot send a ping request through {relay}: {e}");
                let _ = self.loop_tx.try_send(LoopEvent::ProbeTimeout { seq });
            }
        }

        let loop_tx = self.loop_tx.clone();
        let timer = TimerHandle::spawn(timeout, async move {
            let _ = loop_tx.send(LoopEvent::FanoutTimeout { id }).await;
        });
        self.fanouts.insert(
            id,
            Fanout {
                target,
                timeout,
                timer,
            },
        );
        #[cfg(feature = "metrics")]
        crate::metrics::FANOUTS_IN_FLIGHT.inc();
    }

    fn register_probe(&mut self, seq: SeqNum, kind: ProbeKind, timeout: Duration) {
        let loop_tx = self.loop_tx.clone();
        let timer = TimerHandle::spawn(timeout, async move {
            let _ = loop_tx.send(LoopEvent::ProbeTimeout { seq }).await;
        });
        if let Some(previous) = self.pending_probes.insert(seq, PendingProbe { kind, timeout, timer })
        {
            log::warn!("Replacing a pending probe with duplicate sequence number {seq}");
            previous.timer.cancel();
        } else {
            #[cfg(feature = "metrics")]
            crate::metrics::PENDING_PROBES.inc();
        }
    }

    /// One tick of the protocol period: escalate overdue suspects, let
    /// the engine probe the next member, re-arm the tick timer.
    fn handle_periodic_tick(&mut self) {
        self.check_suspicion_timeouts();
        match self.engine.on_periodic_ping_tick() {
            TickDirective::SendPing {
                target,
                timeout,
                seq,
            } => self.send_ping(target, None, timeout, seq),
            TickDirective::Ignore => log::trace!("Nothing to ping this protocol period"),
        }
        self.schedule_next_tick();
    }

    /// At most one tick is ever scheduled; re-arming replaces the
    /// previous one.
    fn schedule_next_tick(&mut self) {
        let delay = self.engine.dynamic_lhm_protocol_interval();
        if let Some(previous) = self.next_tick.take() {
            previous.cancel();
        }
        let loop_tx = self.loop_tx.clone();
        self.next_tick = Some(TimerHandle::spawn(delay, async move {
            let _ = loop_tx.send(LoopEvent::PeriodicTick).await;
        }));
    }

    fn check_suspicion_timeouts(&mut self) {
        let now = Instant::now();
        for suspect in self.engine.suspects() {
            let Status::Suspect {
                incarnation,
                ref suspected_by,
            } = suspect.status
            else {
                // already dead, awaiting reaping
                continue;
            };
            let Some(started_at) = suspect.suspicion_started_at else {
                continue;
            };
            if started_at + self.engine.suspicion_timeout(suspected_by.len()) > now {
                continue;
            }

            let status = if self.engine.settings().unreachability.is_enabled() {
                Status::Unreachable { incarnation }
            } else {
                Status::Dead
            };
            log::debug!(
                "Suspicion timeout for {} expired. Marking {status:?}",
                suspect.node
            );
            match self.engine.mark(suspect.node.clone(), status) {
                MarkResult::Applied {
                    previous_status,
                    member,
                } => self.try_announce(Some(MemberStatusChange {
                    previous_status,
                    member,
                })),
                MarkResult::IgnoredDueToOlderStatus => {
                    log::trace!("Status of {} is already newer", suspect.node)
                }
            }
        }
    }

    fn handle_monitor(&mut self, node: Node, attempt: u32) {
        if node.same_address(self.local.node()) {
            log::trace!("Not monitoring the local address {node}");
            return;
        }
        if self.engine.is_member(&node, true) {
            log::trace!("{node} is already a member");
            return;
        }
        log::debug!("Sending the first ping to {node} (attempt {attempt})");
        let seq = self.engine.next_sequence_number();
        self.register_probe(
            seq,
            ProbeKind::Monitor {
                node: node.clone(),
                attempt,
            },
            MONITOR_PING_TIMEOUT,
        );
        if let Err(e) = self
            .peer(&node)
            .ping(GossipPayload::None, self.local.node(), seq)
        {
            log::debug!("Cannot ping the contact point {node}: {e}");
            let _ = self.loop_tx.try_send(LoopEvent::ProbeTimeout { seq });
        }
    }

    fn retry_monitor(&mut self, node: Node, attempt: u32) {
        if let Some(max) = self.config.monitor_max_attempts {
            if attempt >= max {
                log::warn!("Giving up on the contact point {node} after {attempt} attempts");
                return;
            }
        }
        log::debug!(
            "Contact point {node} did not answer. Retrying in {:?}",
            self.config.monitor_retry_interval
        );
        let loop_tx = self.loop_tx.clone();
        let next = attempt + 1;
        // fire and forget; membership is re-checked when it fires
        let _ = TimerHandle::spawn(self.config.monitor_retry_interval, async move {
            let _ = loop_tx
                .send(LoopEvent::RetryMonitor {
                    node,
                    attempt: next,
                })
                .await;
        });
    }

    fn handle_confirm_dead(&mut self, node: Node) {
        if !self.engine.settings().unreachability.is_enabled() {
            log::warn!("Ignoring confirm-dead for {node}: the unreachability extension is disabled");
            return;
        }
        let Some(member) = self.engine.member_for(&node) else {
            log::warn!("Cannot confirm dead: {node} is not a member");
            return;
        };
        match self.engine.confirm_dead(member.node) {
            ConfirmDeadResult::Applied { change } => {
                log::debug!("Confirmed dead: {}", change.member.node);
                self.try_announce(Some(change));
            }
            ConfirmDeadResult::Ignored => log::trace!("Confirming {node} dead had no effect"),
        }
    }

    /// Deliver a change to the embedder iff it crosses the
    /// reachable/unreachable boundary; everything else has already been
    /// seen in an earlier announcement.
    fn try_announce(&mut self, change: Option<MemberStatusChange>) {
        let Some(change) = change else { return };
        if !change.is_reachability_change() {
            return;
        }
        self.announce(change);
    }

    fn announce(&mut self, change: MemberStatusChange) {
        log::debug!("Membership changed: {change}");
        match self.events_tx.try_send(change) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                crate::metrics::EVENTS_QUEUE_SIZE.inc();
            }
            Err(e) => log::error!("Membership events queue full. Event dropped: {e:?}"),
        }
    }

    fn peer(&self, node: &Node) -> Peer {
        Peer::new(node.clone(), self.channel.clone())
    }
}
