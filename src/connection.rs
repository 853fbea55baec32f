//! The per-peer connection state machine. Both roles - server side (awaits the peer's HELLO)
//!  and client side (issues the HELLO) - share this machine; they differ only in handshake
//!  bookkeeping.
//!
//! All connection state lives in an inner struct behind an `RwLock`, so the mutation sources
//!  (inbound datagram, user send, timer tick) are serialised and never interleave. Event
//!  callbacks are invoked after the guard is dropped, which keeps them free to call back into
//!  the connection.

use crate::codec::HazelMessage;
use crate::config::HazelConfig;
use crate::error::HazelError;
use crate::events::{CloseEvent, EventDispatcher};
use crate::nonce::{NonceSequence, NonceWindow};
use crate::packet::{DisconnectInfo, Packet};
use crate::pending::{PendingAckTable, PendingEntry, PendingKind};
use crate::rtt::RttTracker;
use crate::send_pipeline::SendPipeline;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientHandshake {
    New,
    AwaitingHelloAck,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionRole {
    Server { seen_hello: bool },
    Client { handshake: ClientHandshake },
}

struct ConnectionInner {
    role: ConnectionRole,
    nonces: NonceSequence,
    /// Outbound nonces awaiting an ack. Deliberately separate from `inbound_seen`.
    pending: PendingAckTable,
    /// Inbound nonces feeding the selective-ack mask.
    inbound_seen: NonceWindow,
    pending_pings: u32,
    rtt: RttTracker,
    ping_timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl ConnectionInner {
    /// A server-side connection that has not seen its HELLO yet accepts nothing else.
    fn awaiting_hello(&self) -> bool {
        matches!(self.role, ConnectionRole::Server { seen_hello: false })
    }
}

/// A single logical connection to one remote endpoint. Cheap to clone; all clones share the
///  same state.
#[derive(Clone)]
pub struct Connection {
    peer_addr: SocketAddr,
    config: Arc<HazelConfig>,
    send_pipeline: Arc<SendPipeline>,
    dispatcher: Arc<dyn EventDispatcher>,
    inner: Arc<RwLock<ConnectionInner>>,
}

enum HelloVerdict {
    Accept(Packet),
    SecondHello,
    VersionMismatch,
    WrongRole,
}

enum AckVerdict {
    Data {
        completion: oneshot::Sender<Result<usize, HazelError>>,
        sent_len: usize,
        resend_task: Option<JoinHandle<()>>,
    },
    Ping {
        resend_task: Option<JoinHandle<()>>,
    },
    Unknown,
    BeforeHello,
}

impl Connection {
    pub(crate) fn server(
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn EventDispatcher>,
        config: Arc<HazelConfig>,
    ) -> Connection {
        Self::new(
            peer_addr,
            send_pipeline,
            dispatcher,
            config,
            ConnectionRole::Server { seen_hello: false },
        )
    }

    pub(crate) fn client(
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn EventDispatcher>,
        config: Arc<HazelConfig>,
    ) -> Connection {
        Self::new(
            peer_addr,
            send_pipeline,
            dispatcher,
            config,
            ConnectionRole::Client {
                handshake: ClientHandshake::New,
            },
        )
    }

    fn new(
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn EventDispatcher>,
        config: Arc<HazelConfig>,
        role: ConnectionRole,
    ) -> Connection {
        Connection {
            peer_addr,
            config,
            send_pipeline,
            dispatcher,
            inner: Arc::new(RwLock::new(ConnectionInner {
                role,
                nonces: NonceSequence::new(),
                pending: PendingAckTable::new(),
                inbound_seen: NonceWindow::new(),
                pending_pings: 0,
                rtt: RttTracker::new(),
                ping_timer: None,
                closed: false,
            })),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    /// The running mean over the recent round-trip samples, in milliseconds. Zero-biased
    ///  until five pings have been answered.
    pub async fn ping_ms(&self) -> f64 {
        self.inner.read().await.rtt.mean_millis()
    }

    /// Fire-and-forget send: one datagram, no retransmission, no ordering guarantee.
    pub async fn send_normal(&self, messages: &[HazelMessage]) -> Result<usize, HazelError> {
        if self.is_closed().await {
            return Err(HazelError::ConnectionClosed);
        }
        let bytes = Packet::Normal {
            messages: messages.to_vec(),
        }
        .to_bytes();
        Ok(self.send_pipeline.send_packet(self.peer_addr, &bytes).await?)
    }

    /// Reliable send: resolves with the datagram size once the peer acknowledges it, or fails
    ///  with [`HazelError::NotAcknowledged`] after the attempt cap - which also closes the
    ///  connection.
    ///
    /// Successive reliable sends take strictly increasing nonces but may complete in any
    ///  order; there is no FIFO guarantee across sends.
    pub async fn send_reliable(&self, messages: &[HazelMessage]) -> Result<usize, HazelError> {
        let (bytes, ack_rx) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(HazelError::ConnectionClosed);
            }
            let nonce = inner.nonces.next();
            let bytes = Packet::Reliable {
                nonce,
                messages: messages.to_vec(),
            }
            .to_bytes();
            let (completion, ack_rx) = oneshot::channel();
            self.register_pending(
                &mut inner,
                nonce,
                bytes.clone(),
                PendingKind::Data { completion },
            );
            (bytes, ack_rx)
        };

        self.send_registered(&bytes).await;
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(HazelError::ConnectionClosed),
        }
    }

    /// Closes the connection, notifying the peer. A graceful disconnect (the default whenever
    ///  a reason is worth transmitting) carries the reason code and optional message; a forced
    ///  one sends the minimal two-byte form.
    pub async fn disconnect(
        &self,
        forced: bool,
        reason: Option<u8>,
        message: Option<String>,
    ) -> Result<usize, HazelError> {
        let info = if forced {
            DisconnectInfo::forced()
        } else {
            DisconnectInfo {
                graceful: true,
                reason,
                message: message.clone(),
            }
        };
        let event = CloseEvent {
            forced,
            reason,
            message,
        };
        self.close(Some(Packet::Disconnect(info)), event).await
    }

    /// Client role only: sends the HELLO reliably and resolves once its ack returns.
    pub(crate) async fn connect(&self, payload: Bytes) -> Result<(), HazelError> {
        let (bytes, ack_rx) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(HazelError::ConnectionClosed);
            }
            match inner.role {
                ConnectionRole::Client {
                    handshake: ClientHandshake::New,
                } => {}
                ConnectionRole::Client { .. } => return Err(HazelError::AlreadyConnected),
                ConnectionRole::Server { .. } => {
                    return Err(HazelError::Protocol("connect is a client-side operation"))
                }
            }
            inner.role = ConnectionRole::Client {
                handshake: ClientHandshake::AwaitingHelloAck,
            };

            let nonce = inner.nonces.next();
            let bytes = Packet::Hello {
                nonce,
                version: self.config.protocol_version,
                payload,
            }
            .to_bytes();
            let (completion, ack_rx) = oneshot::channel();
            self.register_pending(
                &mut inner,
                nonce,
                bytes.clone(),
                PendingKind::Data { completion },
            );
            (bytes, ack_rx)
        };

        self.send_registered(&bytes).await;
        let result = match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(HazelError::ConnectionClosed),
        };
        result?;

        {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(HazelError::ConnectionClosed);
            }
            inner.role = ConnectionRole::Client {
                handshake: ClientHandshake::Established,
            };
            inner.ping_timer = Some(self.spawn_ping_timer());
        }
        debug!("connected to {:?}", self.peer_addr);
        self.dispatcher.on_connected(self.peer_addr).await;
        Ok(())
    }

    /// Entry point for every datagram the demultiplexer attributes to this connection.
    pub(crate) async fn on_datagram(&self, mut datagram: Bytes) {
        let packet = match Packet::deser(&mut datagram) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                trace!("ignoring reserved or unknown packet type from {:?}", self.peer_addr);
                return;
            }
            Err(e) => {
                self.fatal_error(HazelError::Codec(e)).await;
                return;
            }
        };

        match packet {
            Packet::Normal { messages } => self.on_normal(messages).await,
            Packet::Reliable { nonce, messages } => self.on_reliable(nonce, messages).await,
            Packet::Hello {
                nonce,
                version,
                payload,
            } => self.on_hello(nonce, version, payload).await,
            Packet::Ping { nonce } => self.on_ping(nonce).await,
            Packet::Ack { nonce, .. } => self.on_ack(nonce).await,
            Packet::Disconnect(info) => self.on_disconnect(info).await,
        }
    }

    async fn on_normal(&self, messages: Vec<HazelMessage>) {
        {
            let inner = self.inner.read().await;
            if inner.closed {
                return;
            }
            if inner.awaiting_hello() {
                drop(inner);
                self.fatal_error(HazelError::Protocol("expected HELLO as the first packet"))
                    .await;
                return;
            }
        }
        for message in messages {
            self.dispatcher.on_message(self.peer_addr, message).await;
        }
    }

    async fn on_reliable(&self, nonce: u16, messages: Vec<HazelMessage>) {
        let ack = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            if inner.awaiting_hello() {
                None
            } else {
                Some(Self::ack_for(&mut inner, nonce))
            }
        };

        let Some(ack) = ack else {
            self.fatal_error(HazelError::Protocol("expected HELLO as the first packet"))
                .await;
            return;
        };
        self.send_ack(ack).await;
        for message in messages {
            self.dispatcher.on_message(self.peer_addr, message).await;
        }
    }

    async fn on_hello(&self, nonce: u16, version: u8, payload: Bytes) {
        let verdict = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            match inner.role {
                ConnectionRole::Client { .. } => HelloVerdict::WrongRole,
                ConnectionRole::Server { seen_hello: true } => HelloVerdict::SecondHello,
                ConnectionRole::Server { seen_hello: false } => {
                    if version != self.config.protocol_version {
                        HelloVerdict::VersionMismatch
                    } else {
                        inner.role = ConnectionRole::Server { seen_hello: true };
                        let ack = Self::ack_for(&mut inner, nonce);
                        inner.ping_timer = Some(self.spawn_ping_timer());
                        HelloVerdict::Accept(ack)
                    }
                }
            }
        };

        match verdict {
            HelloVerdict::Accept(ack) => {
                debug!("accepted HELLO (version {}) from {:?}", version, self.peer_addr);
                self.send_ack(ack).await;
                self.dispatcher.on_hello(self.peer_addr, payload).await;
            }
            HelloVerdict::SecondHello => {
                self.fatal_error(HazelError::Protocol(
                    "second HELLO on an established connection",
                ))
                .await;
            }
            HelloVerdict::VersionMismatch => {
                self.fatal_error(HazelError::Protocol("HELLO protocol version mismatch"))
                    .await;
            }
            HelloVerdict::WrongRole => {
                warn!("ignoring HELLO addressed to the client side from {:?}", self.peer_addr);
            }
        }
    }

    async fn on_ping(&self, nonce: u16) {
        let ack = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            if inner.awaiting_hello() {
                None
            } else {
                Some(Self::ack_for(&mut inner, nonce))
            }
        };

        match ack {
            Some(ack) => self.send_ack(ack).await,
            None => {
                self.fatal_error(HazelError::Protocol("expected HELLO as the first packet"))
                    .await;
            }
        }
    }

    async fn on_ack(&self, nonce: u16) {
        let verdict = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            if inner.awaiting_hello() {
                AckVerdict::BeforeHello
            } else {
                match inner.pending.remove(nonce) {
                    None => AckVerdict::Unknown,
                    Some(PendingEntry {
                        kind,
                        resend_task,
                        sent_len,
                    }) => match kind {
                        PendingKind::Data { completion } => AckVerdict::Data {
                            completion,
                            sent_len,
                            resend_task,
                        },
                        PendingKind::Ping { sent_at } => {
                            inner.pending_pings = inner.pending_pings.saturating_sub(1);
                            let rtt_millis = sent_at.elapsed().as_millis() as f64;
                            inner.rtt.add_sample(rtt_millis);
                            trace!(
                                "ping {} to {:?} answered after {}ms",
                                nonce,
                                self.peer_addr,
                                rtt_millis
                            );
                            AckVerdict::Ping { resend_task }
                        }
                    },
                }
            }
        };

        match verdict {
            AckVerdict::Data {
                completion,
                sent_len,
                resend_task,
            } => {
                if let Some(task) = resend_task {
                    task.abort();
                }
                // the waiter may be gone already; nothing left to do then
                completion.send(Ok(sent_len)).ok();
            }
            AckVerdict::Ping { resend_task } => {
                if let Some(task) = resend_task {
                    task.abort();
                }
            }
            AckVerdict::Unknown => {
                trace!("ack for unknown nonce {} from {:?} - ignoring", nonce, self.peer_addr);
            }
            AckVerdict::BeforeHello => {
                self.fatal_error(HazelError::Protocol("expected HELLO as the first packet"))
                    .await;
            }
        }
    }

    async fn on_disconnect(&self, info: DisconnectInfo) {
        {
            let inner = self.inner.read().await;
            if inner.closed {
                return;
            }
            if inner.awaiting_hello() {
                drop(inner);
                self.fatal_error(HazelError::Protocol("expected HELLO as the first packet"))
                    .await;
                return;
            }
        }
        // the peer already considers the connection gone - never reply
        let event = CloseEvent {
            forced: !info.graceful,
            reason: info.reason,
            message: info.message,
        };
        let _ = self.close(None, event).await;
    }

    fn ack_for(inner: &mut ConnectionInner, nonce: u16) -> Packet {
        inner.inbound_seen.observe(nonce);
        Packet::Ack {
            nonce,
            missing_mask: inner.inbound_seen.missing_mask(nonce),
        }
    }

    async fn send_ack(&self, ack: Packet) {
        if let Err(e) = self
            .send_pipeline
            .send_packet(self.peer_addr, &ack.to_bytes())
            .await
        {
            warn!("failed to send ack to {:?}: {}", self.peer_addr, e);
        }
    }

    /// Registers `bytes` in the retransmit table under `nonce` and spawns its retry task.
    fn register_pending(
        &self,
        inner: &mut ConnectionInner,
        nonce: u16,
        bytes: Bytes,
        kind: PendingKind,
    ) {
        inner.pending.insert(
            nonce,
            PendingEntry {
                kind,
                resend_task: None,
                sent_len: bytes.len(),
            },
        );
        let task = tokio::spawn(Self::resend_loop(self.clone(), nonce, bytes));
        inner.pending.set_resend_task(nonce, task);
    }

    /// The initial send of a packet that is already registered for retransmission: a failure
    ///  here is only logged, the retry task covers it.
    async fn send_registered(&self, bytes: &Bytes) {
        if let Err(e) = self.send_pipeline.send_packet(self.peer_addr, bytes).await {
            warn!(
                "initial send to {:?} failed: {} - retransmission pending",
                self.peer_addr, e
            );
        }
    }

    /// Retry task of one retransmit-table entry: re-sends the identical bytes on the fixed
    ///  interval until the entry disappears (ack or close) or the attempt cap is reached.
    async fn resend_loop(connection: Connection, nonce: u16, bytes: Bytes) {
        let interval = connection.config.resend_interval;
        let max_attempts = connection.config.max_send_attempts;
        let mut attempts: u32 = 1;

        loop {
            time::sleep(interval).await;

            let exhausted = {
                let mut inner = connection.inner.write().await;
                if inner.closed || !inner.pending.contains(nonce) {
                    return;
                }
                if attempts >= max_attempts {
                    // take our own entry out first - close() must not abort the running task
                    if let Some(PendingEntry { kind, .. }) = inner.pending.remove(nonce) {
                        if let PendingKind::Data { completion } = kind {
                            completion.send(Err(HazelError::NotAcknowledged)).ok();
                        }
                    }
                    true
                } else {
                    false
                }
            };

            if exhausted {
                debug!(
                    "packet {} to {:?} not acknowledged after {} attempts - closing",
                    nonce, connection.peer_addr, max_attempts
                );
                let _ = connection
                    .close(
                        Some(Packet::Disconnect(DisconnectInfo::forced())),
                        CloseEvent::forced(),
                    )
                    .await;
                return;
            }

            attempts += 1;
            trace!(
                "re-sending packet {} to {:?} (attempt {})",
                nonce,
                connection.peer_addr,
                attempts
            );
            if let Err(e) = connection
                .send_pipeline
                .send_packet(connection.peer_addr, &bytes)
                .await
            {
                warn!(
                    "re-send of packet {} to {:?} failed: {}",
                    nonce, connection.peer_addr, e
                );
            }
        }
    }

    fn spawn_ping_timer(&self) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(connection.config.ping_interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                if !connection.send_ping().await {
                    return;
                }
            }
        })
    }

    /// One ping-timer tick: the ping always goes out, and the count it pushes the table to
    ///  decides afterwards whether the connection is still alive. Returns `false` once the
    ///  timer must stop.
    async fn send_ping(&self) -> bool {
        let (bytes, overflow) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return false;
            }
            let nonce = inner.nonces.next();
            let bytes = Packet::Ping { nonce }.to_bytes();
            inner.pending_pings += 1;
            self.register_pending(
                &mut inner,
                nonce,
                bytes.clone(),
                PendingKind::Ping {
                    sent_at: Instant::now(),
                },
            );
            let overflow = inner.pending_pings >= self.config.max_pending_pings;
            if overflow {
                // detach our own handle so close() does not abort the running timer task
                inner.ping_timer.take();
            }
            (bytes, overflow)
        };

        self.send_registered(&bytes).await;
        if overflow {
            debug!(
                "{} outstanding pings for {:?} - closing",
                self.config.max_pending_pings, self.peer_addr
            );
            let _ = self
                .close(
                    Some(Packet::Disconnect(DisconnectInfo::forced())),
                    CloseEvent::forced(),
                )
                .await;
            return false;
        }
        true
    }

    /// A peer misbehaved badly enough that the connection cannot continue: surface the error,
    ///  answer with a forced DISCONNECT and close.
    async fn fatal_error(&self, error: HazelError) {
        if self.is_closed().await {
            return;
        }
        warn!("fatal error on connection to {:?}: {}", self.peer_addr, error);
        self.dispatcher.on_error(self.peer_addr, error).await;
        let _ = self
            .close(
                Some(Packet::Disconnect(DisconnectInfo::forced())),
                CloseEvent::forced(),
            )
            .await;
    }

    /// The single teardown path. Stops the ping timer, fails every outstanding completion,
    ///  optionally notifies the peer, and emits the (unique) close event.
    async fn close(
        &self,
        notify_peer: Option<Packet>,
        event: CloseEvent,
    ) -> Result<usize, HazelError> {
        let (ping_timer, pending) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(HazelError::AlreadyDisconnected);
            }
            inner.closed = true;
            (inner.ping_timer.take(), inner.pending.drain())
        };

        if let Some(timer) = ping_timer {
            timer.abort();
        }
        for entry in pending {
            entry.cancel(HazelError::ConnectionClosed);
        }

        let send_result = match notify_peer {
            Some(packet) => self
                .send_pipeline
                .send_packet(self.peer_addr, &packet.to_bytes())
                .await
                .map_err(HazelError::from),
            None => Ok(0),
        };

        debug!("connection to {:?} closed: {:?}", self.peer_addr, event);
        self.dispatcher.on_close(self.peer_addr, event).await;
        send_result
    }
}
