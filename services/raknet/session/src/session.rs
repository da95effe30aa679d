//! Per-peer session state machine.
//!
//! A [`Session`] owns every piece of mutable reliability state for one remote
//! address: sequence counters, the recovery buffer, the receive window, the
//! split table and the send queues. It performs no I/O. Inbound bytes go in
//! through [`Session::handle_datagram`], time advances through
//! [`Session::tick`], and whatever must be written to the socket accumulates
//! in an outbox drained by the caller together with the emitted events.

use crate::error::SessionError;
use crate::fragment::{split_payload, FragmentAssembler, SPLIT_OVERHEAD};
use crate::keepalive::{build_ping, build_pong, millis_at, rtt_from_pong};
use crate::ordering::{MessageDedup, OrderingChannels, OutboundIndices, ORDER_CHANNELS};
use crate::queue::{pack, Priority, SendQueues};
use crate::receive_window::{ReceiveWindow, Submit};
use crate::recovery::RecoveryBuffer;
use bytes::Bytes;
use raknet_wire::{
    AckKind, AckPacket, ConnectionAccept, ConnectionRequest, Datagram, DatagramKind, Frame,
    NewIncomingConnection, OrderInfo, Packet, PacketId, Reliability, SplitInfo, WireError,
    DATAGRAM_OVERHEAD, MAX_SEQUENCE,
};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Configuration for a RakNet session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Identifier of the local endpoint, sent in the connection request of a client session
    pub local_id: u64,
    /// Inactivity after which the session is dropped
    pub timeout: Duration,
    /// Ticks between connected pings once connected (0 disables)
    pub ping_interval_ticks: u64,
    /// Incomplete split sets kept per session
    pub max_split_sets: usize,
    /// Largest accepted split count
    pub max_split_parts: u32,
    /// Age after which an incomplete split set is evicted
    pub split_timeout: Duration,
    /// Ticks a closing session waits for outstanding acknowledgements
    pub closing_drain_ticks: u32,
    /// Receive window size in datagrams
    pub window_limit: u32,
    /// Whether gaps in the receive window are NAKed every tick
    pub nak_gaps: bool,
    /// Age after which an unacknowledged datagram is resent
    pub resend_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            timeout: Duration::from_secs(6),
            ping_interval_ticks: 100,
            max_split_sets: 16,
            max_split_parts: 512,
            split_timeout: Duration::from_secs(30),
            closing_drain_ticks: 40,
            window_limit: 2048,
            nak_gaps: true,
            resend_timeout: Duration::from_secs(1),
        }
    }
}

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing received yet
    Unseen,
    /// Open connection request 1 exchanged
    MtuDiscovering,
    /// MTU agreed, open connection request 2 in flight
    MtuConfirmed,
    /// Session created, waiting for the online handshake to finish
    AwaitingIncoming,
    /// Online handshake complete
    Connected,
    /// Draining outstanding acknowledgements before removal
    Closing,
    /// Finished; removed on the next tick
    Gone,
}

/// Which side of the handshake the session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted from a remote client
    Server,
    /// Opened towards a remote server
    Client,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No traffic for the timeout interval
    Timeout,
    /// The peer sent a disconnect notification
    PeerDisconnected,
    /// Closed by the local application
    LocalDisconnect,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::PeerDisconnected => write!(f, "peer disconnected"),
            DisconnectReason::LocalDisconnect => write!(f, "local disconnect"),
        }
    }
}

/// Events emitted by sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Online handshake completed
    Connected {
        /// Peer socket address
        peer: SocketAddr,
        /// Identifier the peer supplied
        client_id: u64,
    },
    /// Session removed
    Disconnected {
        /// Peer socket address
        peer: SocketAddr,
        /// Why it ended
        reason: DisconnectReason,
    },
    /// Connected pong with RTT measurement
    Pong {
        /// Peer socket address
        peer: SocketAddr,
        /// Round-trip time
        rtt: Duration,
    },
    /// Application payload, reassembled and in order
    MessageReceived {
        /// Peer socket address
        peer: SocketAddr,
        /// Payload bytes
        payload: Bytes,
    },
    /// Unrecognized packet from an address without a session
    RawPacket {
        /// Sender address
        peer: SocketAddr,
        /// Whole UDP payload
        payload: Bytes,
    },
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Data datagrams received
    pub datagrams_in: u64,
    /// Data datagrams sealed and sent
    pub datagrams_out: u64,
    /// Datagrams sent again after a NAK or resend timeout
    pub datagrams_resent: u64,
    /// Sent datagrams retired by an ACK
    pub datagrams_acked: u64,
    /// Datagrams or reliable messages received more than once
    pub duplicates: u64,
    /// Application messages delivered
    pub messages_in: u64,
    /// Application messages accepted for sending
    pub messages_out: u64,
}

/// One remote peer
pub struct Session {
    peer: SocketAddr,
    role: Role,
    config: SessionConfig,
    mtu: u16,
    remote_id: u64,
    state: SessionState,
    close_reason: Option<DisconnectReason>,
    rtt: Option<Duration>,
    last_activity: Instant,
    ticks: u64,
    closing_ticks: u32,
    send_sequence: u32,
    indices: OutboundIndices,
    queues: SendQueues,
    recovery: RecoveryBuffer,
    window: ReceiveWindow<Datagram>,
    fragments: FragmentAssembler,
    dedup: MessageDedup,
    ordering: OrderingChannels,
    open_reply: Option<Bytes>,
    stats: SessionStats,
    outbox: Vec<Bytes>,
    events: Vec<SessionEvent>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("mtu", &self.mtu)
            .field("send_sequence", &self.send_sequence)
            .field("unacked", &self.recovery.len())
            .finish()
    }
}

impl Session {
    /// Create a session after the offline handshake.
    ///
    /// Server sessions start in [`SessionState::AwaitingIncoming`]; client
    /// sessions start in [`SessionState::MtuConfirmed`] until
    /// [`Session::request_connection`] is called.
    pub fn new(
        peer: SocketAddr,
        role: Role,
        mtu: u16,
        remote_id: u64,
        config: SessionConfig,
        now: Instant,
    ) -> Self {
        let fragments = FragmentAssembler::new(
            config.max_split_sets,
            config.max_split_parts,
            config.split_timeout,
        );
        let window = ReceiveWindow::new(config.window_limit);
        let state = match role {
            Role::Server => SessionState::AwaitingIncoming,
            Role::Client => SessionState::MtuConfirmed,
        };
        Self {
            peer,
            role,
            mtu,
            remote_id,
            state,
            close_reason: None,
            rtt: None,
            last_activity: now,
            ticks: 0,
            closing_ticks: 0,
            send_sequence: 0,
            indices: OutboundIndices::default(),
            queues: SendQueues::new(),
            recovery: RecoveryBuffer::new(),
            window,
            fragments,
            dedup: MessageDedup::new(config.window_limit),
            ordering: OrderingChannels::new(config.window_limit),
            open_reply: None,
            stats: SessionStats::default(),
            outbox: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    /// Peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Handshake role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the online handshake has completed and the session is not closing
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Negotiated MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Identifier supplied by the peer
    pub fn remote_id(&self) -> u64 {
        self.remote_id
    }

    /// Latest RTT estimate
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Time of the last inbound packet
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Sent datagrams not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.recovery.len()
    }

    /// Take everything that must be written to the socket, in order
    pub fn drain_outbox(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the events emitted since the last call
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Keep the open connection reply so a retransmitted request 2 can be answered again
    pub fn remember_open_reply(&mut self, reply: Bytes) {
        self.open_reply = Some(reply);
    }

    /// Handle an offline packet from the peer after the session exists
    pub fn handle_offline(&mut self, packet: &Packet, now: Instant) {
        let reply = match (packet, self.state) {
            (Packet::OpenConnectionRequest2(_), SessionState::AwaitingIncoming) => {
                self.open_reply.clone()
            }
            _ => None,
        };
        match reply {
            Some(reply) => {
                debug!("Resending open connection reply 2: peer={}", self.peer);
                self.last_activity = now;
                self.push_out(reply);
            }
            None => debug!(
                "Ignoring offline {:?} for established session: peer={}",
                packet.id(),
                self.peer
            ),
        }
    }

    /// Queue an application payload
    pub fn send(
        &mut self,
        payload: Bytes,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
        now: Instant,
    ) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Closing | SessionState::Gone) {
            return Err(SessionError::Closed);
        }
        if payload.is_empty() {
            return Err(WireError::EmptyPayload.into());
        }
        self.enqueue(payload, reliability, priority, channel, now);
        self.stats.messages_out += 1;
        Ok(())
    }

    /// Queue a control packet, bypassing the closed check
    pub fn send_packet(
        &mut self,
        packet: &Packet,
        reliability: Reliability,
        priority: Priority,
        now: Instant,
    ) {
        trace!("Queue {:?}: peer={}", packet.id(), self.peer);
        self.enqueue(packet.to_bytes(), reliability, priority, 0, now);
    }

    /// Queue the connection request of a client session and wait for the accept
    pub fn request_connection(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.role != Role::Client || self.state != SessionState::MtuConfirmed {
            return Err(SessionError::InvalidState(self.state));
        }
        let request = ConnectionRequest {
            client_id: self.config.local_id,
            ping_time: millis_at(now),
        };
        debug!("Sent ConnectionRequest: peer={}, client_id={}", self.peer, request.client_id);
        self.send_packet(
            &Packet::ConnectionRequest(request),
            Reliability::ReliableOrdered,
            Priority::Immediate,
            now,
        );
        self.state = SessionState::AwaitingIncoming;
        Ok(())
    }

    /// Send a disconnect notification and start closing
    pub fn disconnect(&mut self, now: Instant) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Closing | SessionState::Gone) {
            return Err(SessionError::Closed);
        }
        info!("Disconnecting session: peer={}", self.peer);
        self.send_packet(
            &Packet::DisconnectNotification,
            Reliability::ReliableOrdered,
            Priority::Immediate,
            now,
        );
        self.begin_closing(DisconnectReason::LocalDisconnect);
        Ok(())
    }

    /// Process one UDP payload from the peer
    pub fn handle_datagram(&mut self, mut bytes: Bytes, now: Instant) {
        if self.state == SessionState::Gone {
            return;
        }
        let Some(&first) = bytes.first() else {
            return;
        };
        self.last_activity = now;
        self.stats.bytes_in += bytes.len() as u64;

        match DatagramKind::classify(first) {
            DatagramKind::Ack => match AckPacket::decode(&mut bytes) {
                Ok(ack) => {
                    let retired = self.recovery.on_ack(&ack.sequences);
                    self.stats.datagrams_acked += retired as u64;
                }
                Err(e) => debug!("Dropping malformed ACK: peer={}, error={}", self.peer, e),
            },
            DatagramKind::Nak => match AckPacket::decode(&mut bytes) {
                Ok(nak) => {
                    let resend = self.recovery.on_nak(&nak.sequences, now);
                    debug!(
                        "Received NAK: peer={}, missing={}, resending={}",
                        self.peer,
                        nak.sequences.len(),
                        resend.len()
                    );
                    self.stats.datagrams_resent += resend.len() as u64;
                    for datagram in resend {
                        self.push_out(datagram);
                    }
                }
                Err(e) => debug!("Dropping malformed NAK: peer={}, error={}", self.peer, e),
            },
            DatagramKind::Data => self.handle_data(bytes, now),
            DatagramKind::Offline => {
                debug!("Ignoring offline packet on session: peer={}", self.peer)
            }
        }
    }

    fn handle_data(&mut self, mut bytes: Bytes, now: Instant) {
        let datagram = match Datagram::decode(&mut bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Dropping malformed datagram: peer={}, error={}", self.peer, e);
                return;
            }
        };
        self.stats.datagrams_in += 1;

        let sequence = datagram.sequence;
        match self.window.submit(sequence, datagram) {
            Submit::Accepted => self.send_ack(sequence),
            Submit::Duplicate => {
                self.stats.duplicates += 1;
                self.send_ack(sequence);
            }
            Submit::OutOfWindow => {
                debug!(
                    "Dropping datagram outside receive window: peer={}, seq={}, expected={}",
                    self.peer,
                    sequence,
                    self.window.expected()
                );
                return;
            }
        }

        self.process_released(now);
    }

    fn send_ack(&mut self, sequence: u32) {
        let ack = AckPacket::new(AckKind::Ack, vec![sequence]);
        self.push_out(ack.to_bytes());
    }

    fn process_released(&mut self, now: Instant) {
        for datagram in self.window.release() {
            for frame in datagram.frames {
                self.handle_frame(frame, now);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        if let (true, Some(index)) = (frame.reliability.is_reliable(), frame.message_index) {
            if !self.dedup.insert(index) {
                self.stats.duplicates += 1;
                return;
            }
        }

        let frame = match frame.split {
            Some(split) => match self.fragments.insert(split, frame.payload.clone(), now) {
                Ok(Some(whole)) => Frame {
                    split: None,
                    payload: whole,
                    ..frame
                },
                Ok(None) => return,
                Err(e) => {
                    debug!("Dropping fragment: peer={}, error={}", self.peer, e);
                    return;
                }
            },
            None => frame,
        };

        let order = frame.order.unwrap_or_default();
        if frame.reliability.is_sequenced() {
            let sequence = frame.sequence_index.unwrap_or(0);
            if self
                .ordering
                .accept_sequenced(order.channel, order.index, sequence)
            {
                self.handle_message(frame.payload, now);
            } else {
                trace!("Discarding stale sequenced message: peer={}", self.peer);
            }
        } else if frame.reliability.is_sequenced_or_ordered() {
            for payload in self.ordering.order(order.channel, order.index, frame.payload) {
                self.handle_message(payload, now);
            }
        } else {
            self.handle_message(frame.payload, now);
        }
    }

    fn handle_message(&mut self, payload: Bytes, now: Instant) {
        let Some(&id) = payload.first() else {
            return;
        };
        if PacketId::try_from(id).is_err() {
            self.stats.messages_in += 1;
            self.events.push(SessionEvent::MessageReceived {
                peer: self.peer,
                payload,
            });
            return;
        }

        match Packet::decode(&mut payload.clone()) {
            Ok(packet) => self.handle_control(packet, now),
            Err(e) => debug!(
                "Dropping malformed control packet: peer={}, id={:#04x}, error={}",
                self.peer, id, e
            ),
        }
    }

    fn handle_control(&mut self, packet: Packet, now: Instant) {
        match (packet, self.role) {
            (Packet::ConnectedPing(_), _)
                if matches!(self.state, SessionState::Closing | SessionState::Gone) =>
            {
                trace!("Not answering ping while closing: peer={}", self.peer);
            }
            (Packet::ConnectedPing(ping), _) => {
                let pong = build_pong(ping.ping_time, now);
                self.enqueue(pong, Reliability::Unreliable, Priority::Immediate, 0, now);
            }
            (Packet::ConnectedPong(pong), _) => {
                if let Some(rtt) = rtt_from_pong(&pong, now) {
                    trace!("Received pong: peer={}, rtt={:?}", self.peer, rtt);
                    self.rtt = Some(rtt);
                    self.events.push(SessionEvent::Pong {
                        peer: self.peer,
                        rtt,
                    });
                }
            }
            (Packet::ConnectionRequest(request), Role::Server) => {
                if self.state != SessionState::AwaitingIncoming {
                    debug!("Ignoring repeated connection request: peer={}", self.peer);
                    return;
                }
                self.remote_id = request.client_id;
                let accept = ConnectionAccept::new(self.peer, request.ping_time, millis_at(now));
                debug!("Sent ConnectionAccept: peer={}", self.peer);
                self.send_packet(
                    &Packet::ConnectionAccept(accept),
                    Reliability::ReliableOrdered,
                    Priority::Immediate,
                    now,
                );
            }
            (Packet::NewIncomingConnection(_), Role::Server) => {
                if self.state == SessionState::AwaitingIncoming {
                    self.mark_connected();
                }
            }
            (Packet::ConnectionAccept(accept), Role::Client) => {
                if self.state != SessionState::AwaitingIncoming {
                    return;
                }
                let incoming = NewIncomingConnection::new(self.peer, accept.pong_time, millis_at(now));
                self.send_packet(
                    &Packet::NewIncomingConnection(incoming),
                    Reliability::ReliableOrdered,
                    Priority::Immediate,
                    now,
                );
                self.mark_connected();
            }
            (Packet::DisconnectNotification, _) => {
                info!("Peer sent disconnect notification: peer={}", self.peer);
                self.begin_closing(DisconnectReason::PeerDisconnected);
            }
            (other, role) => debug!(
                "Unexpected {:?} for {:?} session: peer={}",
                other.id(),
                role,
                self.peer
            ),
        }
    }

    fn mark_connected(&mut self) {
        self.state = SessionState::Connected;
        info!(
            "Session connected: peer={}, remote_id={}, mtu={}",
            self.peer, self.remote_id, self.mtu
        );
        self.events.push(SessionEvent::Connected {
            peer: self.peer,
            client_id: self.remote_id,
        });
    }

    /// Advance time: flush due queues, NAK gaps, resend, ping and time out
    pub fn tick(&mut self, now: Instant) {
        if self.state == SessionState::Gone {
            return;
        }
        self.ticks += 1;

        if now.saturating_duration_since(self.last_activity) >= self.config.timeout {
            info!(
                "Session timed out: peer={}, idle={:?}",
                self.peer,
                now.saturating_duration_since(self.last_activity)
            );
            self.finish(DisconnectReason::Timeout);
            return;
        }

        self.process_released(now);

        if self.config.nak_gaps {
            let missing = self.window.missing();
            if !missing.is_empty() {
                debug!("Sent NAK: peer={}, missing={}", self.peer, missing.len());
                for nak in AckPacket::batches(AckKind::Nak, missing, self.datagram_budget()) {
                    self.push_out(nak.to_bytes());
                }
            }
        }

        let due = if self.state == SessionState::Closing {
            self.queues.drain_all()
        } else {
            self.queues.drain_due(self.ticks)
        };
        if !due.is_empty() {
            self.send_frames(due, now);
        }

        let stale = self.recovery.take_stale(now, self.config.resend_timeout);
        if !stale.is_empty() {
            debug!("Resending unacknowledged datagrams: peer={}, count={}", self.peer, stale.len());
            self.stats.datagrams_resent += stale.len() as u64;
            for datagram in stale {
                self.push_out(datagram);
            }
        }

        if self.state == SessionState::Connected
            && self.config.ping_interval_ticks > 0
            && self.ticks % self.config.ping_interval_ticks == 0
        {
            self.enqueue(build_ping(now), Reliability::Unreliable, Priority::Immediate, 0, now);
        }

        self.fragments.evict_stale(now);

        if self.state == SessionState::Closing {
            self.closing_ticks += 1;
            let drained = self.recovery.is_empty() && self.queues.is_empty();
            if drained || self.closing_ticks >= self.config.closing_drain_ticks {
                let reason = self.close_reason.unwrap_or(DisconnectReason::LocalDisconnect);
                self.finish(reason);
            }
        }
    }

    fn begin_closing(&mut self, reason: DisconnectReason) {
        if matches!(self.state, SessionState::Closing | SessionState::Gone) {
            return;
        }
        self.state = SessionState::Closing;
        self.close_reason = Some(reason);
        self.closing_ticks = 0;
    }

    fn finish(&mut self, reason: DisconnectReason) {
        if self.state == SessionState::Gone {
            return;
        }
        self.state = SessionState::Gone;
        self.recovery.clear();
        self.queues.drain_all();
        info!("Session closed: peer={}, reason={}", self.peer, reason);
        self.events.push(SessionEvent::Disconnected {
            peer: self.peer,
            reason,
        });
    }

    /// Largest encoded datagram this session writes
    fn datagram_budget(&self) -> usize {
        (self.mtu as usize).saturating_sub(DATAGRAM_OVERHEAD)
    }

    /// Largest encoded frame before a payload is split
    fn max_frame_size(&self) -> usize {
        (self.mtu as usize).saturating_sub(SPLIT_OVERHEAD)
    }

    fn enqueue(
        &mut self,
        payload: Bytes,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
        now: Instant,
    ) {
        let frames = self.build_frames(payload, reliability, channel);
        if let Some(frames) = self.queues.push(priority, frames) {
            self.send_frames(frames, now);
        }
    }

    fn build_frames(&mut self, payload: Bytes, reliability: Reliability, channel: u8) -> Vec<Frame> {
        let channel = channel % ORDER_CHANNELS as u8;
        let max_frame = self.max_frame_size();

        if Frame::header_size(reliability, false) + payload.len() <= max_frame {
            let (sequence_index, order) = self.order_fields(reliability, channel);
            let message_index = if reliability.is_reliable() {
                Some(self.indices.next_message())
            } else {
                None
            };
            return vec![Frame {
                reliability,
                message_index,
                sequence_index,
                order,
                split: None,
                payload,
            }];
        }

        // Losing one fragment loses the whole message
        let reliability = match reliability {
            Reliability::Unreliable => Reliability::Reliable,
            Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
            Reliability::UnreliableWithAck => Reliability::ReliableWithAck,
            other => other,
        };
        let (sequence_index, order) = self.order_fields(reliability, channel);
        let chunk_size = max_frame
            .saturating_sub(Frame::header_size(reliability, true))
            .max(1);
        let chunks = split_payload(&payload, chunk_size);
        let id = self.indices.next_split_id();
        let count = chunks.len() as u32;
        debug!(
            "Splitting message: peer={}, len={}, parts={}, split_id={}",
            self.peer,
            payload.len(),
            count,
            id
        );

        let mut frames = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            frames.push(Frame {
                reliability,
                message_index: Some(self.indices.next_message()),
                sequence_index,
                order,
                split: Some(SplitInfo {
                    count,
                    id,
                    index: index as u32,
                }),
                payload: chunk,
            });
        }
        frames
    }

    fn order_fields(&mut self, reliability: Reliability, channel: u8) -> (Option<u32>, Option<OrderInfo>) {
        if reliability.is_sequenced() {
            let sequence = self.indices.next_sequence(channel);
            let index = self.indices.current_order(channel);
            (Some(sequence), Some(OrderInfo { index, channel }))
        } else if reliability.is_sequenced_or_ordered() {
            let index = self.indices.next_order(channel);
            (None, Some(OrderInfo { index, channel }))
        } else {
            (None, None)
        }
    }

    fn send_frames(&mut self, frames: Vec<Frame>, now: Instant) {
        for batch in pack(frames, self.datagram_budget()) {
            self.seal(batch, now);
        }
    }

    fn seal(&mut self, frames: Vec<Frame>, now: Instant) {
        let sequence = self.send_sequence;
        let mut datagram = Datagram::new(sequence);
        datagram.frames = frames;
        match datagram.to_bytes() {
            Ok(bytes) => {
                self.send_sequence = (self.send_sequence + 1) & MAX_SEQUENCE;
                self.stats.datagrams_out += 1;
                self.recovery.add(sequence, bytes.clone(), now);
                self.push_out(bytes);
            }
            Err(e) => warn!("Failed to encode datagram: peer={}, error={}", self.peer, e),
        }
    }

    fn push_out(&mut self, bytes: Bytes) {
        self.stats.bytes_out += bytes.len() as u64;
        self.outbox.push(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: u16 = 1400;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pair(now: Instant) -> (Session, Session) {
        let server = Session::new(
            addr("10.0.0.2:50000"),
            Role::Server,
            MTU,
            0,
            SessionConfig::default(),
            now,
        );
        let client = Session::new(
            addr("10.0.0.1:19132"),
            Role::Client,
            MTU,
            0,
            SessionConfig {
                local_id: 77,
                ..SessionConfig::default()
            },
            now,
        );
        (server, client)
    }

    /// Deliver outboxes back and forth until both sides go quiet
    fn pump(a: &mut Session, b: &mut Session, now: Instant) {
        loop {
            let from_a = a.drain_outbox();
            let from_b = b.drain_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for bytes in from_a {
                b.handle_datagram(bytes, now);
            }
            for bytes in from_b {
                a.handle_datagram(bytes, now);
            }
        }
    }

    fn connect(server: &mut Session, client: &mut Session, now: Instant) {
        client.request_connection(now).unwrap();
        pump(client, server, now);
    }

    fn messages(session: &mut Session) -> Vec<Bytes> {
        session
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::MessageReceived { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_online_handshake() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);

        assert_eq!(server.state(), SessionState::Connected);
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(server.remote_id(), 77);
        assert_eq!(
            server.drain_events(),
            vec![SessionEvent::Connected {
                peer: server.peer(),
                client_id: 77
            }]
        );
        // Every datagram was acknowledged
        assert_eq!(server.unacked(), 0);
        assert_eq!(client.unacked(), 0);
    }

    #[test]
    fn test_queued_messages_flush_on_schedule() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        server.drain_events();

        client
            .send(Bytes::from_static(b"\xfelow"), Reliability::ReliableOrdered, Priority::Low, 0, now)
            .unwrap();
        client
            .send(Bytes::from_static(b"\xfehigh"), Reliability::ReliableOrdered, Priority::High, 0, now)
            .unwrap();

        client.tick(now);
        pump(&mut client, &mut server, now);
        // High went out on tick 1; the low message holds order index 0 so nothing is released yet
        assert!(messages(&mut server).is_empty());

        for _ in 0..3 {
            client.tick(now);
        }
        pump(&mut client, &mut server, now);
        assert_eq!(
            messages(&mut server),
            vec![Bytes::from_static(b"\xfelow"), Bytes::from_static(b"\xfehigh")]
        );
    }

    #[test]
    fn test_large_message_is_split_and_reassembled() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        server.drain_events();

        let mut payload = vec![0xFEu8];
        payload.extend((0..6000u32).map(|i| (i % 253) as u8));
        let payload = Bytes::from(payload);
        client
            .send(payload.clone(), Reliability::ReliableOrdered, Priority::Immediate, 0, now)
            .unwrap();

        let sent = client.drain_outbox();
        assert!(sent.len() >= 5);
        for datagram in &sent {
            assert!(datagram.len() <= MTU as usize - DATAGRAM_OVERHEAD);
        }
        // Deliver in reverse order
        for datagram in sent.into_iter().rev() {
            server.handle_datagram(datagram, now);
        }
        assert_eq!(messages(&mut server), vec![payload]);
    }

    #[test]
    fn test_lost_datagram_recovered_by_nak() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        server.drain_events();

        for body in [&b"\xfeone"[..], &b"\xfetwo"[..], &b"\xfethree"[..]] {
            client
                .send(
                    Bytes::copy_from_slice(body),
                    Reliability::ReliableOrdered,
                    Priority::Immediate,
                    0,
                    now,
                )
                .unwrap();
        }
        let mut sent = client.drain_outbox();
        assert_eq!(sent.len(), 3);
        let lost = sent.remove(1);

        for datagram in sent {
            server.handle_datagram(datagram, now);
        }
        assert_eq!(messages(&mut server), vec![Bytes::from_static(b"\xfeone")]);

        // Server NAKs the gap on its next tick; the client resends the same bytes
        server.tick(now);
        let mut resent = Vec::new();
        for bytes in server.drain_outbox() {
            client.handle_datagram(bytes, now);
        }
        resent.extend(client.drain_outbox());
        assert_eq!(resent, vec![lost]);

        for bytes in resent {
            server.handle_datagram(bytes, now);
        }
        assert_eq!(
            messages(&mut server),
            vec![Bytes::from_static(b"\xfetwo"), Bytes::from_static(b"\xfethree")]
        );
        assert_eq!(client.stats().datagrams_resent, 1);
    }

    #[test]
    fn test_duplicate_datagram_acked_but_not_redelivered() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        server.drain_events();

        client
            .send(Bytes::from_static(b"\xfeonce"), Reliability::Reliable, Priority::Immediate, 0, now)
            .unwrap();
        let datagram = client.drain_outbox().remove(0);
        server.handle_datagram(datagram.clone(), now);
        server.handle_datagram(datagram, now);

        assert_eq!(messages(&mut server).len(), 1);
        assert_eq!(server.drain_outbox().len(), 2);
        assert_eq!(server.stats().duplicates, 1);
    }

    #[test]
    fn test_ping_is_answered_and_rtt_measured() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        client.drain_events();

        client.send_packet(
            &Packet::ConnectedPing(raknet_wire::ConnectedPing {
                ping_time: millis_at(now) as i64,
            }),
            Reliability::Unreliable,
            Priority::Immediate,
            now,
        );
        let later = now + Duration::from_millis(25);
        for bytes in client.drain_outbox() {
            server.handle_datagram(bytes, later);
        }
        for bytes in server.drain_outbox() {
            client.handle_datagram(bytes, later);
        }

        assert!(client.rtt().is_some());
        assert!(client
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::Pong { .. })));
    }

    #[test]
    fn test_timeout_moves_to_gone() {
        let now = Instant::now();
        let (mut server, _) = pair(now);
        server.tick(now + Duration::from_secs(1));
        assert_eq!(server.state(), SessionState::AwaitingIncoming);

        server.tick(now + Duration::from_secs(7));
        assert_eq!(server.state(), SessionState::Gone);
        assert_eq!(
            server.drain_events(),
            vec![SessionEvent::Disconnected {
                peer: server.peer(),
                reason: DisconnectReason::Timeout
            }]
        );
    }

    #[test]
    fn test_disconnect_drains_then_closes() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);
        server.drain_events();

        client.disconnect(now).unwrap();
        assert_eq!(client.state(), SessionState::Closing);
        assert!(matches!(
            client.send(Bytes::from_static(b"\xfex"), Reliability::Reliable, Priority::High, 0, now),
            Err(SessionError::Closed)
        ));
        pump(&mut client, &mut server, now);
        assert_eq!(server.state(), SessionState::Closing);

        client.tick(now);
        server.tick(now);
        assert_eq!(client.state(), SessionState::Gone);
        assert_eq!(server.state(), SessionState::Gone);
        assert_eq!(
            server.drain_events(),
            vec![SessionEvent::Disconnected {
                peer: server.peer(),
                reason: DisconnectReason::PeerDisconnected
            }]
        );
    }

    #[test]
    fn test_closing_gives_up_after_drain_budget() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);

        // The notification is never acknowledged
        client.disconnect(now).unwrap();
        client.drain_outbox();
        for _ in 0..SessionConfig::default().closing_drain_ticks - 1 {
            client.tick(now);
            assert_eq!(client.state(), SessionState::Closing);
        }
        client.tick(now);
        assert_eq!(client.state(), SessionState::Gone);
    }

    #[test]
    fn test_unreliable_split_is_upgraded() {
        let now = Instant::now();
        let (_, mut client) = pair(now);
        let frames = client.build_frames(Bytes::from(vec![0xFE; 3000]), Reliability::Unreliable, 0);
        assert!(frames.len() > 1);
        let ids: Vec<u32> = frames.iter().filter_map(|f| f.message_index).collect();
        assert_eq!(ids, (0..frames.len() as u32).collect::<Vec<_>>());
        assert!(frames
            .iter()
            .all(|f| f.reliability == Reliability::Reliable && f.split.map(|s| s.id) == Some(0)));
    }

    #[test]
    fn test_split_chunks_share_order_index() {
        let now = Instant::now();
        let (_, mut client) = pair(now);
        client.build_frames(Bytes::from_static(b"\xfesmall"), Reliability::ReliableOrdered, 2);
        let frames = client.build_frames(Bytes::from(vec![0xFE; 3000]), Reliability::ReliableOrdered, 2);
        assert!(frames
            .iter()
            .all(|f| f.order == Some(OrderInfo { index: 1, channel: 2 })));
    }

    fn raw_datagram(sequence: u32, frame: Frame) -> Bytes {
        let mut datagram = Datagram::new(sequence);
        datagram.frames.push(frame);
        datagram.to_bytes().unwrap()
    }

    fn unreliable(payload: &'static [u8]) -> Frame {
        Frame {
            reliability: Reliability::Unreliable,
            message_index: None,
            sequence_index: None,
            order: None,
            split: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_datagram_beyond_window_dropped_without_ack() {
        let now = Instant::now();
        let (mut server, _) = pair(now);
        let limit = SessionConfig::default().window_limit;

        server.handle_datagram(raw_datagram(limit, unreliable(b"\xfefar")), now);
        assert!(server.drain_outbox().is_empty());
        assert!(server.drain_events().is_empty());
        assert_eq!(server.stats().datagrams_in, 1);

        // The last sequence inside the window is acknowledged
        server.handle_datagram(raw_datagram(limit - 1, unreliable(b"\xfenear")), now);
        let out = server.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(DatagramKind::classify(out[0][0]), DatagramKind::Ack);
    }

    #[test]
    fn test_gaps_not_naked_when_disabled() {
        let now = Instant::now();
        let mut quiet = Session::new(
            addr("10.0.0.2:50000"),
            Role::Server,
            MTU,
            0,
            SessionConfig {
                nak_gaps: false,
                ..SessionConfig::default()
            },
            now,
        );
        let (mut noisy, _) = pair(now);

        for session in [&mut quiet, &mut noisy] {
            // Sequence 0 never arrives
            session.handle_datagram(raw_datagram(1, unreliable(b"\xfegap")), now);
            session.drain_outbox();
            session.tick(now);
        }

        assert!(quiet.drain_outbox().is_empty());
        let naks = noisy.drain_outbox();
        assert_eq!(naks.len(), 1);
        assert_eq!(DatagramKind::classify(naks[0][0]), DatagramKind::Nak);
    }

    #[test]
    fn test_closing_session_does_not_answer_ping() {
        let now = Instant::now();
        let (mut server, mut client) = pair(now);
        connect(&mut server, &mut client, now);

        client.disconnect(now).unwrap();
        client.drain_outbox();
        let sent = client.stats().datagrams_out;

        server.send_packet(
            &Packet::ConnectedPing(raknet_wire::ConnectedPing {
                ping_time: millis_at(now) as i64,
            }),
            Reliability::Unreliable,
            Priority::Immediate,
            now,
        );
        for bytes in server.drain_outbox() {
            client.handle_datagram(bytes, now);
        }
        client.tick(now);

        // Only the acknowledgement of the ping goes out
        let out = client.drain_outbox();
        assert!(!out.is_empty());
        assert!(out
            .iter()
            .all(|bytes| DatagramKind::classify(bytes[0]) == DatagramKind::Ack));
        assert_eq!(client.stats().datagrams_out, sent);
    }

    #[test]
    fn test_ordered_backlog_bounded_by_window() {
        let now = Instant::now();
        let limit = 64;
        let mut server = Session::new(
            addr("10.0.0.2:50000"),
            Role::Server,
            MTU,
            0,
            SessionConfig {
                window_limit: limit,
                ..SessionConfig::default()
            },
            now,
        );

        // Indices start at 1 so nothing is ever released
        for sequence in 0..2_000u32 {
            let frame = Frame {
                reliability: Reliability::ReliableOrdered,
                message_index: Some(sequence + 1),
                sequence_index: None,
                order: Some(OrderInfo {
                    index: sequence + 1,
                    channel: 0,
                }),
                split: None,
                payload: Bytes::from(vec![0xFE; 100]),
            };
            server.handle_datagram(raw_datagram(sequence, frame), now);
        }

        assert!(server.drain_events().is_empty());
        assert!(server.dedup.held() < limit as usize);
        assert!(server.ordering.pending() < limit as usize);
    }

    #[test]
    fn test_client_requests_connection_once() {
        let now = Instant::now();
        let (_, mut client) = pair(now);
        assert_eq!(client.state(), SessionState::MtuConfirmed);

        client.request_connection(now).unwrap();
        assert_eq!(client.state(), SessionState::AwaitingIncoming);
        assert!(matches!(
            client.request_connection(now),
            Err(SessionError::InvalidState(SessionState::AwaitingIncoming))
        ));

        let mut sent = client.drain_outbox();
        let mut datagram = Datagram::decode(&mut sent.remove(0)).unwrap();
        let frame = datagram.frames.remove(0);
        match Packet::decode(&mut frame.payload.clone()).unwrap() {
            Packet::ConnectionRequest(request) => assert_eq!(request.client_id, 77),
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
