//! Connection task
//!
//! One task owns the socket for the process lifetime. It connects, runs the
//! session until the connection drops, then backs off and tries again.
//! Publish commands that arrive while no session is running are rejected
//! straight away rather than queued.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::inflight::{Inflight, PubRecAction, Reply, Slot, Stage};
use super::transport::{self, BrokerStream};
use super::{ClientOptions, ConnectError, ConnectionStatus, PublishError};
use crate::codec::{Decoder, Encoder};
use crate::metrics::Metrics;
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode,
};

/// Message to the connection task
pub(crate) enum Command {
    /// Publish a message and report the outcome on `reply`
    Publish { publish: Publish, reply: Reply },
    /// Flush in-flight publishes for at most `grace`, then disconnect
    Disconnect {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Why a session ended
enum SessionEnd {
    /// Connection dropped or the broker misbehaved
    Lost(String),
    /// Disconnect was requested and has completed
    Closed(Option<oneshot::Sender<()>>),
}

pub(crate) struct ConnectionTask {
    pub options: Arc<ClientOptions>,
    pub status: Arc<RwLock<ConnectionStatus>>,
    pub tls: Option<TlsConnector>,
    pub metrics: Option<Arc<Metrics>>,
}

impl ConnectionTask {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    /// Run the connection loop until a disconnect is requested or the
    /// command channel closes. The outcome of the first attempt is sent on
    /// `first_attempt`.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<Command>,
        first_attempt: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        let options = self.options.clone();
        let mut first_attempt = Some(first_attempt);
        let mut retry_interval = options.reconnect_interval;

        loop {
            self.set_status(ConnectionStatus::Connecting);
            debug!("Connecting to {}", options.addr);

            let attempt = match reject_while(self.establish(), &mut commands).await {
                Ok(attempt) => attempt,
                Err(done) => return self.shut_down(commands, done),
            };

            match attempt {
                Ok(mut session) => {
                    retry_interval = options.reconnect_interval;
                    self.set_status(ConnectionStatus::Connected);
                    if let Some(ref metrics) = self.metrics {
                        metrics.broker_up();
                    }
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let end = session.run(&mut commands).await;
                    if let Some(ref metrics) = self.metrics {
                        metrics.broker_down();
                    }

                    match end {
                        SessionEnd::Closed(done) => {
                            info!("Disconnected from {}", options.addr);
                            return self.shut_down(commands, done);
                        }
                        SessionEnd::Lost(reason) => {
                            error!("Connection to {} lost: {}", options.addr, reason);
                            if !options.auto_reconnect {
                                warn!("Automatic reconnect disabled; publishes will fail");
                                self.set_status(ConnectionStatus::Disconnected);
                                let done = reject_while(std::future::pending::<()>(), &mut commands)
                                    .await
                                    .err()
                                    .flatten();
                                return self.shut_down(commands, done);
                            }
                        }
                    }
                }
                Err(e) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.broker_connect_failed();
                    }
                    match first_attempt.take() {
                        Some(tx) if !options.connect_retry => {
                            error!("Failed to connect to {}: {}", options.addr, e);
                            self.set_status(ConnectionStatus::Disconnected);
                            let _ = tx.send(Err(e));
                            return;
                        }
                        Some(tx) => {
                            warn!(
                                "Failed to connect to {}: {}; retrying in background",
                                options.addr, e
                            );
                            let _ = tx.send(Ok(()));
                        }
                        None => {
                            warn!("Reconnect to {} failed: {}", options.addr, e);
                        }
                    }
                }
            }

            self.set_status(ConnectionStatus::Backoff);
            debug!("Reconnecting in {:?}", retry_interval);

            // Exponential backoff
            if let Err(done) = reject_while(sleep(retry_interval), &mut commands).await {
                return self.shut_down(commands, done);
            }
            retry_interval = std::cmp::min(retry_interval * 2, options.max_reconnect_interval);
        }
    }

    /// Reject whatever is still queued, then report the shutdown as done
    fn shut_down(&self, mut commands: mpsc::Receiver<Command>, done: Option<oneshot::Sender<()>>) {
        self.set_status(ConnectionStatus::Disconnected);
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Publish { reply, .. } => {
                    let _ = reply.send(Err(PublishError::ShuttingDown));
                }
                Command::Disconnect { done, .. } => {
                    let _ = done.send(());
                }
            }
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Open the transport, send CONNECT and wait for a successful CONNACK
    async fn establish(&self) -> Result<Session, ConnectError> {
        let options = &self.options;
        let limit = options.connect_timeout;

        let stream = timeout(limit, transport::open(&options.addr, self.tls.as_ref()))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let encoder = Encoder::new(options.protocol_version);
        let mut decoder = Decoder::new().with_max_packet_size(options.max_packet_size);
        decoder.set_protocol_version(options.protocol_version);

        let mut properties = Properties::default();
        if options.protocol_version == ProtocolVersion::V5 {
            properties.maximum_packet_size =
                Some(u32::try_from(options.max_packet_size).unwrap_or(u32::MAX));
            properties.receive_maximum = Some(options.max_inflight);
        }
        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: options.protocol_version,
            client_id: options.client_id.clone(),
            clean_start: options.clean_start,
            keep_alive: options.keep_alive,
            username: options.username.clone(),
            password: options.password.clone(),
            properties,
        }));

        let mut write_buf = BytesMut::with_capacity(4096);
        encoder.encode(&connect, &mut write_buf)?;
        timeout(limit, writer.write_all(&write_buf))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        debug!("CONNECT sent");

        // Wait for CONNACK; anything after it stays buffered for the session
        let mut read_buf = BytesMut::with_capacity(4096);
        let connack = timeout(limit, async {
            loop {
                if let Some((packet, consumed)) = decoder.decode(&read_buf)? {
                    read_buf.advance(consumed);
                    return Ok::<_, ConnectError>(packet);
                }
                let n = reader.read_buf(&mut read_buf).await?;
                if n == 0 {
                    return Err(ConnectError::Protocol(
                        "connection closed before CONNACK".to_string(),
                    ));
                }
            }
        })
        .await
        .map_err(|_| ConnectError::Timeout)??;

        let connack = match connack {
            Packet::ConnAck(connack) => connack,
            other => {
                return Err(ConnectError::Protocol(format!(
                    "expected CONNACK, got {}",
                    other.name()
                )));
            }
        };
        if connack.reason_code != ReasonCode::Success {
            return Err(ConnectError::Refused(connack.reason_code));
        }

        let props = &connack.properties;
        let keep_alive = props.server_keep_alive.unwrap_or(options.keep_alive);
        let receive_maximum = props.receive_maximum.unwrap_or(u16::MAX);
        if let Some(ref assigned) = props.assigned_client_identifier {
            debug!("Broker assigned client identifier '{}'", assigned);
        }

        info!(
            "Connected to {} (MQTT {}, session_present={})",
            options.addr, options.protocol_version, connack.session_present
        );

        Ok(Session {
            reader,
            writer,
            encoder,
            decoder,
            read_buf,
            write_buf,
            inflight: Inflight::new(options.max_inflight.min(receive_maximum)),
            keep_alive: Duration::from_secs(keep_alive as u64),
            max_packet_size: props.maximum_packet_size,
            maximum_qos: props.maximum_qos,
            metrics: self.metrics.clone(),
        })
    }
}

/// Drive `fut` to completion while rejecting publishes with `NotConnected`.
///
/// Returns `Err` with the completion handle if a disconnect is requested
/// (or the channel closes) first.
async fn reject_while<F: Future>(
    fut: F,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<F::Output, Option<oneshot::Sender<()>>> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            cmd = commands.recv() => match cmd {
                Some(Command::Publish { reply, .. }) => {
                    let _ = reply.send(Err(PublishError::NotConnected));
                }
                Some(Command::Disconnect { done, .. }) => return Err(Some(done)),
                None => return Err(None),
            },
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// An established connection
struct Session {
    reader: ReadHalf<Box<dyn BrokerStream>>,
    writer: WriteHalf<Box<dyn BrokerStream>>,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    inflight: Inflight,
    keep_alive: Duration,
    /// Maximum Packet Size announced by a v5 broker
    max_packet_size: Option<u32>,
    /// Maximum QoS announced by a v5 broker
    maximum_qos: Option<QoS>,
    metrics: Option<Arc<Metrics>>,
}

impl Session {
    async fn run(&mut self, commands: &mut mpsc::Receiver<Command>) -> SessionEnd {
        let mut keepalive_timer = (!self.keep_alive.is_zero())
            .then(|| interval_at(Instant::now() + self.keep_alive, self.keep_alive));
        let mut ping_outstanding = false;

        // Set once a disconnect is requested
        let mut draining: Option<(Instant, Option<oneshot::Sender<()>>)> = None;

        // Packets that arrived together with CONNACK
        if let Err(reason) = self.process_read_buf().await {
            return self.lose(reason);
        }

        loop {
            if let Some((_, ref mut done)) = draining {
                if self.inflight.is_empty() {
                    let done = done.take();
                    return self.close(done).await;
                }
            }
            let drain_deadline = draining.as_ref().map(|(deadline, _)| *deadline);

            tokio::select! {
                cmd = commands.recv(), if draining.is_none() => {
                    match cmd {
                        Some(Command::Publish { publish, reply }) => {
                            if let Err(reason) = self.publish(publish, reply).await {
                                return self.lose(reason);
                            }
                        }
                        Some(Command::Disconnect { grace, done }) => {
                            debug!(
                                "Disconnect requested, {} message(s) in flight",
                                self.inflight.len()
                            );
                            draining = Some((Instant::now() + grace, Some(done)));
                        }
                        None => {
                            draining = Some((Instant::now(), None));
                        }
                    }
                }

                // Handle incoming packets from the broker
                result = self.reader.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => return self.lose("connection closed by broker".to_string()),
                        Ok(_) => {}
                        Err(e) => return self.lose(e.to_string()),
                    }
                    ping_outstanding = false;
                    if let Err(reason) = self.process_read_buf().await {
                        return self.lose(reason);
                    }
                }

                // Send PINGREQ to keep connection alive
                _ = next_tick(&mut keepalive_timer) => {
                    if ping_outstanding {
                        return self.lose("no PINGRESP within keep alive".to_string());
                    }
                    if let Err(reason) = self.send(&Packet::PingReq).await {
                        return self.lose(reason);
                    }
                    ping_outstanding = true;
                }

                _ = deadline_reached(drain_deadline) => {
                    let done = draining.take().and_then(|(_, done)| done);
                    return self.close(done).await;
                }
            }
        }
    }

    /// Fail everything in flight and report the loss
    fn lose(&mut self, reason: String) -> SessionEnd {
        self.inflight.fail_all(PublishError::ConnectionLost);
        SessionEnd::Lost(reason)
    }

    /// Send DISCONNECT and close the socket
    async fn close(&mut self, done: Option<oneshot::Sender<()>>) -> SessionEnd {
        if !self.inflight.is_empty() {
            warn!(
                "Disconnecting with {} unacknowledged message(s)",
                self.inflight.len()
            );
        }
        self.inflight.fail_all(PublishError::ShuttingDown);

        let disconnect = Packet::Disconnect(Disconnect::default());
        if let Err(reason) = self.send(&disconnect).await {
            debug!("Failed to send DISCONNECT: {}", reason);
        }
        let _ = self.writer.shutdown().await;
        SessionEnd::Closed(done)
    }

    /// Encode and write one packet
    async fn send(&mut self, packet: &Packet) -> Result<(), String> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| format!("failed to encode {}: {}", packet.name(), e))?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(ref metrics) = self.metrics {
            metrics.packet_sent(packet.name());
        }
        Ok(())
    }

    /// Write a publish. Errors that only concern this message are reported
    /// on `reply`; a write failure is returned as a connection loss.
    async fn publish(&mut self, mut publish: Publish, reply: Reply) -> Result<(), String> {
        // The caller may have timed out or gone away while this was queued
        if reply.is_closed() {
            return Ok(());
        }

        if let Some(max_qos) = self.maximum_qos {
            if publish.qos > max_qos {
                let _ = reply.send(Err(PublishError::Rejected(ReasonCode::QoSNotSupported)));
                return Ok(());
            }
        }

        if let Some(max) = self.max_packet_size {
            if self.encoder.publish_size(&publish) > max as usize {
                let _ = reply.send(Err(PublishError::PacketTooLarge));
                return Ok(());
            }
        }

        let packet_id = if publish.qos == QoS::AtMostOnce {
            None
        } else {
            match self.inflight.allocate() {
                Slot::Free(id) => Some(id),
                Slot::Full => {
                    let _ = reply.send(Err(PublishError::InflightFull));
                    return Ok(());
                }
                Slot::Stalled => {
                    let _ = reply.send(Err(PublishError::ConnectionLost));
                    return Err(format!(
                        "broker left {} publish(es) unacknowledged past their timeout",
                        self.inflight.len()
                    ));
                }
            }
        };
        publish.packet_id = packet_id;

        let qos = publish.qos;
        let packet = Packet::Publish(publish);
        self.write_buf.clear();
        if let Err(e) = self.encoder.encode(&packet, &mut self.write_buf) {
            let _ = reply.send(Err(PublishError::Encode(e)));
            return Ok(());
        }

        if let Err(e) = self.writer.write_all(&self.write_buf).await {
            let _ = reply.send(Err(PublishError::ConnectionLost));
            return Err(e.to_string());
        }
        if let Some(ref metrics) = self.metrics {
            metrics.packet_sent("publish");
        }

        match packet_id {
            Some(id) => {
                self.inflight.insert(id, qos, reply);
                self.update_inflight_metric();
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
        Ok(())
    }

    /// Decode and handle every complete packet in the read buffer
    async fn process_read_buf(&mut self) -> Result<(), String> {
        loop {
            let decoded = self
                .decoder
                .decode(&self.read_buf)
                .map_err(|e| format!("malformed packet from broker: {}", e))?;
            let Some((packet, consumed)) = decoded else {
                return Ok(());
            };
            self.read_buf.advance(consumed);
            if let Some(ref metrics) = self.metrics {
                metrics.packet_received(packet.name());
            }
            self.handle_packet(packet).await?;
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), String> {
        match packet {
            Packet::PubAck(ack) => {
                if !self
                    .inflight
                    .complete(ack.packet_id, Stage::AwaitingPubAck, ack.reason_code)
                {
                    debug!("PUBACK for unknown packet id {}", ack.packet_id);
                }
                self.update_inflight_metric();
            }
            Packet::PubRec(rec) => match self.inflight.on_pubrec(rec.packet_id, rec.reason_code) {
                PubRecAction::Release => {
                    self.send(&Packet::PubRel(PubRel::new(rec.packet_id)))
                        .await?;
                }
                PubRecAction::Refused => self.update_inflight_metric(),
                PubRecAction::Unknown => {
                    debug!("PUBREC for unknown packet id {}", rec.packet_id);
                    let mut rel = PubRel::new(rec.packet_id);
                    if self.encoder.protocol_version() == ProtocolVersion::V5 {
                        rel.reason_code = ReasonCode::PacketIdNotFound;
                    }
                    self.send(&Packet::PubRel(rel)).await?;
                }
            },
            Packet::PubComp(comp) => {
                if !self
                    .inflight
                    .complete(comp.packet_id, Stage::AwaitingPubComp, comp.reason_code)
                {
                    debug!("PUBCOMP for unknown packet id {}", comp.packet_id);
                }
                self.update_inflight_metric();
            }
            Packet::Publish(publish) => {
                // Only possible with a resumed session; acknowledged and dropped
                debug!(
                    "Discarding inbound PUBLISH on '{}' (QoS {})",
                    publish.topic, publish.qos
                );
                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => {
                        self.send(&Packet::PubAck(PubAck::new(id))).await?;
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        self.send(&Packet::PubRec(PubRec::new(id))).await?;
                    }
                    _ => {}
                }
            }
            Packet::PubRel(rel) => {
                self.send(&Packet::PubComp(PubComp::new(rel.packet_id)))
                    .await?;
            }
            Packet::PingResp => {
                debug!("PINGRESP received");
            }
            Packet::Disconnect(disconnect) => {
                let detail = disconnect
                    .properties
                    .reason_string
                    .as_deref()
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default();
                warn!(
                    "Broker sent DISCONNECT: {}{}",
                    disconnect.reason_code, detail
                );
                return Err(format!(
                    "broker disconnected: {}",
                    disconnect.reason_code
                ));
            }
            other => {
                return Err(format!("unexpected {} from broker", other.name()));
            }
        }
        Ok(())
    }

    fn update_inflight_metric(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.set_inflight(self.inflight.len());
        }
    }
}
