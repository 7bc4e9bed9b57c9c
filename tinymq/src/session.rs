//! One MQTT v3.1.1 client connection.
//!
//! After the CONNECT handshake a connection runs as three parts joined by bounded queues:
//! a reader task decoding packets into the inbound queue, a writer task draining the outbound queue
//! into the transport, and the processor (the connection task itself) which owns the protocol
//! state. They share a [`Signal`]: the first reason to close wins, every part stops on it, and the
//! session is finalized exactly once after all parts have stopped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use tinymq_codec::error::DecodeError;
use tinymq_net::MqttError;
use tinymq_utils::{timestamp_millis, TimestampMillis};

use crate::broker::Broker;
use crate::inflight::{MomentStatus, OutInflight, OutInflightMessage};
use crate::queue::InboundSender;
use crate::store::StoredPacket;
use crate::topic::Topic;
use crate::types::{
    ClientId, ConnectAck, ConnectAckReason, LastWill, Packet, PacketId, Publish, QoS, Reason,
    SessionState, SubscribeReturnCode, TopicFilter,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Close coordination shared by the parts of one session and by its [`SessionHandle`]s.
pub(crate) struct Signal {
    reason: Mutex<Option<Reason>>,
    closing: watch::Sender<bool>,
    done: watch::Sender<bool>,
    finalized: AtomicBool,
}

impl Signal {
    fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            closing: watch::channel(false).0,
            done: watch::channel(false).0,
            finalized: AtomicBool::new(false),
        }
    }

    /// Records `reason` and asks every part to stop. Only the first reason is kept.
    pub(crate) fn close(&self, reason: Reason) -> bool {
        {
            let mut r = self.reason.lock();
            if r.is_some() {
                return false;
            }
            *r = Some(reason);
        }
        self.closing.send_replace(true);
        true
    }

    #[inline]
    pub(crate) fn reason(&self) -> Option<Reason> {
        self.reason.lock().clone()
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    #[inline]
    fn begin_finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    #[inline]
    fn finish(&self) {
        self.done.send_replace(true);
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) async fn finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[derive(Debug)]
pub(crate) enum Message {
    /// A publication routed to this client.
    Forward(Publish),
    /// A stored outbound packet re-sent after reconnecting.
    Replay(StoredPacket),
}

/// The registry's view of a live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) id: u64,
    pub client_id: ClientId,
    pub clean_session: bool,
    pub remote_addr: SocketAddr,
    pub connected_at: TimestampMillis,
    tx: mpsc::Sender<Message>,
    signal: Arc<Signal>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("remote_addr", &self.remote_addr)
            .field("closing", &self.signal.is_closing())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        client_id: ClientId,
        clean_session: bool,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            client_id,
            clean_session,
            remote_addr,
            connected_at: timestamp_millis(),
            tx,
            signal: Arc::new(Signal::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hands a publication to the session without waiting. On a full or closed queue the message
    /// is given back.
    pub(crate) fn forward(&self, publish: Publish) -> Result<(), Publish> {
        self.tx.try_send(Message::Forward(publish)).map_err(|e| match e.into_inner() {
            Message::Forward(p) => p,
            Message::Replay(sp) => sp.publish,
        })
    }

    #[inline]
    pub fn kick(&self, reason: Reason) -> bool {
        self.signal.close(reason)
    }

    /// Tells the session to stop and waits for its teardown, returning false on timeout.
    pub async fn kick_and_wait(&self, reason: Reason, timeout: Duration) -> bool {
        self.kick(reason);
        tokio::time::timeout(timeout, self.signal.finished()).await.is_ok()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.signal.is_closing()
    }

    #[inline]
    pub fn reason(&self) -> Option<Reason> {
        self.signal.reason()
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.signal.is_finished()
    }

    pub(crate) async fn finished(&self) {
        self.signal.finished().await
    }
}

#[inline]
fn connack(return_code: ConnectAckReason, session_present: bool) -> Packet {
    Packet::ConnectAck(ConnectAck { return_code, session_present })
}

async fn refuse<W>(writer: &mut W, reason: Reason) -> Reason
where
    W: Sink<Packet> + Unpin,
{
    let _ = writer.close().await;
    reason
}

/// Runs a connection from its CONNECT packet to teardown and returns why it ended.
pub(crate) async fn handle<R, W, E>(broker: Broker, mut reader: R, mut writer: W, remote_addr: SocketAddr) -> Reason
where
    R: Stream<Item = Result<Packet, E>> + Unpin + Send + 'static,
    E: Into<MqttError> + Send + 'static,
    W: Sink<Packet> + Unpin + Send + 'static,
    W::Error: fmt::Debug + Send,
{
    broker.stats.connections.inc();
    let stats = broker.stats.clone();
    let _guard = scopeguard::guard((), move |_| stats.connections.dec());

    let mqtt = &broker.settings.mqtt;
    log::debug!("{} {:?}", remote_addr, SessionState::AwaitingConnect);
    let connect = match tokio::time::timeout(mqtt.connect_timeout, reader.next()).await {
        Err(_) => {
            log::debug!("{} no CONNECT within {:?}", remote_addr, mqtt.connect_timeout);
            return refuse(&mut writer, Reason::HandshakeTimeout).await;
        }
        Ok(None) => return Reason::RemoteClose(None),
        Ok(Some(Ok(Packet::Connect(connect)))) => connect,
        Ok(Some(Ok(p))) => {
            let reason = Reason::protocol(format!("first packet must be CONNECT, got {}", p.name()));
            return refuse(&mut writer, reason).await;
        }
        Ok(Some(Err(e))) => {
            let e: MqttError = e.into();
            if matches!(e, MqttError::Decode(DecodeError::UnsupportedProtocolLevel)) {
                let _ = writer.send(connack(ConnectAckReason::UnacceptableProtocolVersion, false)).await;
            }
            return refuse(&mut writer, Reason::protocol(e.to_string())).await;
        }
    };

    let clean_session = connect.clean_session;
    let client_id = if connect.client_id.is_empty() {
        if !clean_session {
            log::info!("{} empty client id without clean session", remote_addr);
            let _ = writer.send(connack(ConnectAckReason::IdentifierRejected, false)).await;
            return refuse(&mut writer, Reason::protocol(MqttError::IdentifierRejected.to_string())).await;
        }
        ClientId::from(Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned())
    } else {
        connect.client_id.clone()
    };
    let auth = broker.auth.authenticate(&connect, remote_addr).await;
    if auth != ConnectAckReason::ConnectionAccepted {
        log::info!("{:?} from {} refused, {}", client_id, remote_addr, auth.reason());
        let _ = writer.send(connack(auth, false)).await;
        return refuse(&mut writer, Reason::NotAuthorized(auth)).await;
    }
    let keep_alive = if connect.keep_alive == 0 { mqtt.keepalive_default } else { connect.keep_alive };

    let (msg_tx, mut msg_rx) = mpsc::channel(mqtt.outbound_queue_capacity.max(1));
    let handle = SessionHandle::new(broker.next_session_id(), client_id.clone(), clean_session, remote_addr, msg_tx);
    if let Some(prev) = broker.registry.evict(&client_id, mqtt.takeover_timeout).await {
        log::info!("{:?} session {} taken over by {} from {}", client_id, prev.id, handle.id, remote_addr);
    }
    //purge before publishers can see the new handle
    if clean_session {
        broker.clean_session(&client_id).await;
    }
    if let Some(prev) = broker.registry.register(handle.clone(), mqtt.takeover_timeout).await {
        log::info!("{:?} session {} replaced by a concurrent connect {}", client_id, prev.id, handle.id);
    }
    broker.stats.sessions.inc();

    let (out_tx, out_rx) = mpsc::channel(mqtt.outbound_queue_capacity.max(1));
    let mut session = Session {
        broker: broker.clone(),
        handle: handle.clone(),
        will: connect.last_will.clone(),
        out_tx,
        inflight: OutInflight::new(mqtt.retry_interval, mqtt.max_retries),
        state: SessionState::AwaitingConnect,
    };

    if let Err(e) = writer.send(connack(ConnectAckReason::ConnectionAccepted, !clean_session)).await {
        handle.signal.close(Reason::RemoteClose(Some(format!("{:?}", e))));
        let reason = handle.signal.reason().unwrap_or(Reason::RemoteClose(None));
        session.finalize(&mut msg_rx, &reason).await;
        return reason;
    }
    session.set_state(SessionState::Connected);
    log::info!(
        "{:?} connected from {}, clean_session: {}, keep_alive: {}",
        client_id,
        remote_addr,
        clean_session,
        keep_alive
    );

    if !clean_session {
        let packets = broker.store.stream_outbound_packets(&client_id);
        tokio::spawn(replay_stored(client_id.clone(), packets, handle.tx.clone()));
    }

    let (inbound_tx, mut inbound_rx) = mpsc::channel(mqtt.inbound_queue_capacity.max(1));
    let inbound = InboundSender::new(
        client_id.clone(),
        inbound_tx,
        mqtt.inbound_queue_policy,
        mqtt.inbound_queue_timeout,
        broker.stats.clone(),
    );
    let idle = mqtt.idle_timeout(keep_alive);
    let reader_task = tokio::spawn(read_loop(reader, inbound, idle, handle.signal.clone()));
    let writer_task = tokio::spawn(write_loop(writer, out_rx, handle.signal.clone(), client_id.clone()));

    session.run(&mut inbound_rx, &mut msg_rx).await;

    let reader_reason = match reader_task.await {
        Ok(reason) => reason,
        Err(e) => Reason::Error(e.to_string()),
    };
    handle.signal.close(reader_reason);
    if let Err(e) = writer_task.await {
        log::warn!("{:?} writer task failed, {}", client_id, e);
    }

    let reason = handle.signal.reason().unwrap_or(Reason::RemoteClose(None));
    session.finalize(&mut msg_rx, &reason).await;
    reason
}

async fn replay_stored(
    client_id: ClientId,
    mut packets: BoxStream<'static, crate::Result<StoredPacket>>,
    tx: mpsc::Sender<Message>,
) {
    let mut replayed = 0;
    while let Some(packet) = packets.next().await {
        match packet {
            Ok(packet) => {
                if tx.send(Message::Replay(packet)).await.is_err() {
                    break;
                }
                replayed += 1;
            }
            Err(e) => {
                log::warn!("{:?} failed to load stored outbound packets, {:?}", client_id, e);
                break;
            }
        }
    }
    log::debug!("{:?} replayed {} stored packets", client_id, replayed);
}

async fn read_next<R>(
    reader: &mut R,
    idle: Option<Duration>,
) -> Result<Option<R::Item>, tokio::time::error::Elapsed>
where
    R: Stream + Unpin,
{
    match idle {
        Some(idle) => tokio::time::timeout(idle, reader.next()).await,
        None => Ok(reader.next().await),
    }
}

/// Decodes packets into the inbound queue. Returns why reading stopped; only a full inbound queue
/// closes the session from here, every other cause is picked up after the processor has drained
/// what was already queued.
async fn read_loop<R, E>(mut reader: R, inbound: InboundSender, idle: Option<Duration>, signal: Arc<Signal>) -> Reason
where
    R: Stream<Item = Result<Packet, E>> + Unpin,
    E: Into<MqttError>,
{
    loop {
        let next = tokio::select! {
            _ = signal.closed() => return Reason::RemoteClose(None),
            next = read_next(&mut reader, idle) => next,
        };
        let packet = match next {
            Err(_) => return Reason::KeepaliveTimeout,
            Ok(None) => return Reason::RemoteClose(None),
            Ok(Some(Err(e))) => {
                let e: MqttError = e.into();
                return match e {
                    MqttError::Decode(DecodeError::Io(e)) => Reason::RemoteClose(Some(e.to_string())),
                    e => Reason::protocol(e.to_string()),
                }
            }
            Ok(Some(Ok(packet))) => packet,
        };
        let pushed = tokio::select! {
            _ = signal.closed() => return Reason::RemoteClose(None),
            pushed = inbound.push(packet) => pushed,
        };
        if let Err(reason) = pushed {
            if reason == Reason::InboundQueueFull {
                signal.close(reason.clone());
            }
            return reason;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<Packet>, signal: Arc<Signal>, client_id: ClientId)
where
    W: Sink<Packet> + Unpin,
    W::Error: fmt::Debug,
{
    loop {
        let packet = tokio::select! {
            biased;
            packet = out_rx.recv() => packet,
            _ = signal.closed() => None,
        };
        let Some(packet) = packet else { break };
        if let Err(e) = writer.send(packet).await {
            log::debug!("{:?} write error, {:?}", client_id, e);
            signal.close(Reason::RemoteClose(Some(format!("{:?}", e))));
            return;
        }
    }

    out_rx.close();
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        while let Ok(packet) = out_rx.try_recv() {
            writer.feed(packet).await?;
        }
        writer.close().await
    })
    .await;
    match flushed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("{:?} flush error, {:?}", client_id, e),
        Err(_) => log::debug!("{:?} flush timed out", client_id),
    }
}

struct Session {
    broker: Broker,
    handle: SessionHandle,
    will: Option<LastWill>,
    out_tx: mpsc::Sender<Packet>,
    inflight: OutInflight,
    state: SessionState,
}

impl Session {
    #[inline]
    fn client_id(&self) -> &ClientId {
        &self.handle.client_id
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("{:?} {:?} -> {:?}", self.handle.client_id, self.state, state);
        self.state = state;
    }

    async fn run(&mut self, inbound_rx: &mut mpsc::Receiver<Packet>, msg_rx: &mut mpsc::Receiver<Message>) {
        let signal = self.handle.signal.clone();
        let retry_interval = self.broker.settings.mqtt.retry_interval;
        let retry_enabled = !retry_interval.is_zero();
        let period = if retry_enabled { retry_interval } else { Duration::from_secs(3600) };
        let mut retry_tick = tokio::time::interval_at(Instant::now() + period, period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let res = tokio::select! {
                biased;
                _ = signal.closed() => break,
                packet = inbound_rx.recv() => match packet {
                    Some(packet) => self.handle_packet(packet).await,
                    None => break,
                },
                msg = msg_rx.recv() => match msg {
                    Some(Message::Forward(publish)) => self.deliver(publish).await,
                    Some(Message::Replay(packet)) => self.replay(packet).await,
                    None => Err(Reason::Error("session channel closed".into())),
                },
                _ = retry_tick.tick(), if retry_enabled => self.retransmit().await,
            };
            if let Err(reason) = res {
                signal.close(reason);
                break;
            }
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), Reason> {
        tokio::select! {
            sent = self.out_tx.send(packet) => sent.map_err(|_| Reason::RemoteClose(None)),
            _ = self.handle.signal.closed() => {
                Err(self.handle.signal.reason().unwrap_or(Reason::RemoteClose(None)))
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Reason> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PublishAck { packet_id } | Packet::PublishComplete { packet_id } => {
                self.complete_outbound(packet_id).await;
                Ok(())
            }
            Packet::PublishReceived { packet_id } => {
                if self.inflight.update_status(&packet_id, MomentStatus::UnComplete) {
                    self.broker
                        .store
                        .release_outbound_packet(self.client_id(), packet_id)
                        .await
                        .map_err(|e| Reason::Error(e.to_string()))?;
                } else {
                    log::debug!("{:?} PUBREC for unknown packet id {}", self.client_id(), packet_id);
                }
                self.send(Packet::PublishRelease { packet_id }).await
            }
            Packet::PublishRelease { packet_id } => {
                self.send(Packet::PublishComplete { packet_id }).await?;
                if let Err(e) = self.broker.store.delete_inbound_packet(self.client_id(), packet_id).await {
                    log::warn!("{:?} failed to delete inbound packet {}, {:?}", self.client_id(), packet_id, e);
                }
                Ok(())
            }
            Packet::Subscribe { packet_id, topic_filters } => self.handle_subscribe(packet_id, topic_filters).await,
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.handle_unsubscribe(packet_id, topic_filters).await
            }
            Packet::PingRequest => self.send(Packet::PingResponse).await,
            Packet::Disconnect => {
                self.will = None;
                Err(Reason::ConnectDisconnect)
            }
            p => Err(Reason::protocol(format!("unexpected packet {}", p.name()))),
        }
    }

    async fn handle_publish(&mut self, mut publish: Publish) -> Result<(), Reason> {
        Topic::parse_name(&publish.topic).map_err(|e| Reason::protocol(e.to_string()))?;
        match publish.qos {
            QoS::AtMostOnce => {
                publish.dup = false;
                self.fan_out(publish).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or_else(packet_id_required)?;
                self.send(Packet::PublishAck { packet_id }).await?;
                self.fan_out(publish).await;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or_else(packet_id_required)?;
                let store = &self.broker.store;
                let received = store
                    .find_inbound_packet(self.client_id(), packet_id)
                    .await
                    .map_err(|e| Reason::Error(e.to_string()))?;
                if received.is_none() {
                    self.fan_out(publish.clone()).await;
                    store
                        .store_inbound_packet(self.client_id(), packet_id, &publish)
                        .await
                        .map_err(|e| Reason::Error(e.to_string()))?;
                } else {
                    log::debug!("{:?} duplicate QoS 2 publish, packet id {}", self.client_id(), packet_id);
                }
                self.send(Packet::PublishReceived { packet_id }).await?;
            }
        }
        Ok(())
    }

    async fn fan_out(&self, publish: Publish) {
        if let Err(e) = self.broker.publish(self.client_id(), publish).await {
            log::warn!("{:?} publish failed, {:?}", self.client_id(), e);
        }
    }

    async fn handle_subscribe(&mut self, packet_id: PacketId, topic_filters: Vec<(TopicFilter, u8)>) -> Result<(), Reason> {
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut retaineds = Vec::new();
        for (topic_filter, qos) in topic_filters {
            let qos = match QoS::try_from(qos) {
                Ok(qos) => qos,
                Err(_) => {
                    log::warn!("{:?} subscribe {:?} with invalid qos {}", self.client_id(), topic_filter, qos);
                    status.push(SubscribeReturnCode::Failure);
                    continue;
                }
            };
            match self.broker.subscribe(self.client_id(), &topic_filter, qos).await {
                Ok(msgs) => {
                    status.push(SubscribeReturnCode::Success(qos));
                    retaineds.extend(msgs);
                }
                Err(e) => {
                    log::warn!("{:?} subscribe {:?} failed, {:?}", self.client_id(), topic_filter, e);
                    status.push(SubscribeReturnCode::Failure);
                }
            }
        }
        self.send(Packet::SubscribeAck { packet_id, status }).await?;
        for publish in retaineds {
            self.deliver(publish).await?;
        }
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, packet_id: PacketId, topic_filters: Vec<TopicFilter>) -> Result<(), Reason> {
        for topic_filter in topic_filters {
            if let Err(e) = self.broker.unsubscribe(self.client_id(), &topic_filter).await {
                log::debug!("{:?} unsubscribe {:?}, {:?}", self.client_id(), topic_filter, e);
            }
        }
        self.send(Packet::UnsubscribeAck { packet_id }).await
    }

    /// Sends a routed publication. QoS 1/2 messages get a packet id, a durable outbound record in
    /// the form used for redelivery, and an in-flight entry before they go out.
    async fn deliver(&mut self, mut publish: Publish) -> Result<(), Reason> {
        publish.dup = false;
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            return self.send(Packet::Publish(publish)).await;
        }

        let packet_id = match self.broker.packet_ids.request(self.client_id()) {
            Ok(packet_id) => packet_id,
            Err(e) => {
                self.broker.stats.dropped_packets.inc();
                log::warn!("{:?} {}, dropped message to {:?}", self.client_id(), e, publish.topic);
                return Ok(());
            }
        };
        publish.packet_id = Some(packet_id);
        let mut resend = publish.clone();
        resend.dup = true;
        if let Err(e) = self.broker.store.store_outbound_packet(self.client_id(), packet_id, &resend).await {
            self.broker.packet_ids.free(self.client_id(), packet_id);
            self.broker.stats.dropped_packets.inc();
            log::warn!(
                "{:?} failed to store outbound packet {}, dropped message to {:?}, {:?}",
                self.client_id(),
                packet_id,
                publish.topic,
                e
            );
            return Ok(());
        }
        self.inflight.push_back(OutInflightMessage::new(initial_status(publish.qos), resend));
        self.send(Packet::Publish(publish)).await
    }

    async fn replay(&mut self, packet: StoredPacket) -> Result<(), Reason> {
        let packet_id = packet.packet_id;
        if self.inflight.get(&packet_id).is_some() {
            return Ok(());
        }
        self.broker.packet_ids.reserve(self.client_id(), packet_id);
        let mut publish = packet.publish;
        publish.packet_id = Some(packet_id);
        if packet.released {
            self.inflight.push_back(OutInflightMessage::new(MomentStatus::UnComplete, publish));
            return self.send(Packet::PublishRelease { packet_id }).await;
        }
        let mut resend = publish.clone();
        resend.dup = true;
        if !publish.dup {
            if let Err(e) = self.broker.store.store_outbound_packet(self.client_id(), packet_id, &resend).await {
                log::warn!("{:?} failed to update outbound packet {}, {:?}", self.client_id(), packet_id, e);
            }
        }
        self.inflight.push_back(OutInflightMessage::new(initial_status(publish.qos), resend));
        self.send(Packet::Publish(publish)).await
    }

    async fn complete_outbound(&mut self, packet_id: PacketId) {
        if self.inflight.remove(&packet_id).is_none() {
            log::debug!("{:?} acknowledgement for unknown packet id {}", self.client_id(), packet_id);
        }
        self.broker.packet_ids.free(self.client_id(), packet_id);
        if let Err(e) = self.broker.store.delete_outbound_packet(self.client_id(), packet_id).await {
            log::warn!("{:?} failed to delete outbound packet {}, {:?}", self.client_id(), packet_id, e);
        }
    }

    async fn retransmit(&mut self) -> Result<(), Reason> {
        let (resend, exhausted) = self.inflight.take_timeouts();
        for packet_id in exhausted {
            log::warn!(
                "{:?} packet {} not acknowledged after {} retries, keeping it for redelivery",
                self.client_id(),
                packet_id,
                self.broker.settings.mqtt.max_retries
            );
        }
        for m in resend {
            let packet = match (m.status, m.publish.packet_id) {
                (MomentStatus::UnComplete, Some(packet_id)) => Packet::PublishRelease { packet_id },
                _ => Packet::Publish(m.publish),
            };
            log::debug!("{:?} resend {}, retries: {}", self.client_id(), packet.name(), m.retries);
            self.send(packet).await?;
        }
        Ok(())
    }

    /// Teardown, run once after every part of the session has stopped.
    async fn finalize(&mut self, msg_rx: &mut mpsc::Receiver<Message>, reason: &Reason) {
        if !self.handle.signal.begin_finalize() {
            return;
        }
        self.set_state(SessionState::Disconnecting);
        let client_id = self.handle.client_id.clone();

        if let Some(will) = self.will.take() {
            if !reason.is_graceful() {
                let publish = Publish {
                    dup: false,
                    retain: will.retain,
                    qos: will.qos,
                    topic: will.topic,
                    packet_id: None,
                    payload: will.message,
                };
                if let Err(e) = self.broker.publish(&client_id, publish).await {
                    log::warn!("{:?} failed to publish will, {:?}", client_id, e);
                }
            }
        }

        msg_rx.close();
        let mut offline = 0;
        while let Ok(msg) = msg_rx.try_recv() {
            if let Message::Forward(publish) = msg {
                if !self.handle.clean_session
                    && publish.qos != QoS::AtMostOnce
                    && self.broker.store_offline(&client_id, publish).await
                {
                    offline += 1;
                }
            }
        }

        self.broker.registry.unregister(&self.handle);
        if self.handle.clean_session {
            self.broker.clean_session(&client_id).await;
        }
        self.broker.stats.sessions.dec();
        self.set_state(SessionState::Closed);
        log::info!(
            "{:?} disconnected, reason: {}, inflight: {}, queued offline: {}",
            client_id,
            reason,
            self.inflight.len(),
            offline
        );
        self.handle.signal.finish();
    }
}

#[inline]
fn initial_status(qos: QoS) -> MomentStatus {
    if qos == QoS::ExactlyOnce {
        MomentStatus::UnReceived
    } else {
        MomentStatus::UnAck
    }
}

#[inline]
fn packet_id_required() -> Reason {
    Reason::protocol(MqttError::PacketIdRequired.to_string())
}
