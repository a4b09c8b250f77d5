//! Async streaming transport
//!
//! One task owns the [`StreamCore`] and both channels. Local components talk
//! to it through a [`TransportHandle`] with non-blocking sends; everything it
//! learns comes back as [`TransportEvent`]s.

use std::future::pending;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use telesurg_core::{
    Clock, HapticFeedback, InstrumentState, StreamProtocol, StreamingParameters, TeleopError, TeleopResult,
};
use telesurg_predict::PredictionConfig;
use telesurg_wire::{Message, SurgeonCommand};

use crate::{
    encode_frame, spawn_connect, ConnectionState, DatagramChannel, Inbound, InboundReceiver, InboundSender,
    OrderedChannel, ReconnectPolicy, StreamCore, TransportEvent,
};

/// Where and how to stream
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub params: StreamingParameters,
    pub arm_count: usize,
    pub prediction: PredictionConfig,
    /// Local datagram address
    pub bind: SocketAddr,
    /// Remote datagram address; when absent the peer is learned from the first packet
    pub peer: Option<SocketAddr>,
    /// Accept ordered connections here
    pub ordered_listen: Option<SocketAddr>,
    /// Connect the ordered channel here
    pub ordered_peer: Option<SocketAddr>,
    pub ping_interval: Duration,
    pub metrics_interval: Duration,
    /// How long the datagram probe waits for a pong in auto mode
    pub probe_timeout: Duration,
    /// Peer silence after which the link counts as down
    pub silence_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let params = StreamingParameters::default();
        TransportConfig {
            prediction: PredictionConfig::from_streaming(&params),
            params,
            arm_count: 3,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer: None,
            ordered_listen: None,
            ordered_peer: None,
            ping_interval: Duration::from_millis(10),
            metrics_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(250),
            silence_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
            command_capacity: 1024,
            event_capacity: 1024,
        }
    }
}

impl TransportConfig {
    pub fn new(params: StreamingParameters, arm_count: usize) -> Self {
        TransportConfig {
            prediction: PredictionConfig::from_streaming(&params),
            params,
            arm_count,
            ..Default::default()
        }
    }

    fn wants_datagram(&self) -> bool {
        self.params.protocol != StreamProtocol::Ordered
    }

    fn wants_ordered(&self) -> bool {
        self.params.protocol != StreamProtocol::Datagram
    }
}

/// Requests from local components
#[derive(Debug, Clone)]
pub enum TransportCommand {
    PublishState(InstrumentState),
    /// Every state of the current control tick has been published
    EndOfTick,
    Haptic(HapticFeedback),
    SurgeonCommand(SurgeonCommand),
    Shutdown,
}

/// Emergency stop latch, kept apart from the command queue
#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn raise(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

/// Cheap clonable sender side of a running transport
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    stop: Arc<StopSignal>,
}

impl TransportHandle {
    /// Never blocks; a full queue drops the request
    pub fn try_send(&self, command: TransportCommand) -> TeleopResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TeleopError::Transport("transport queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TeleopError::ChannelClosed,
        })
    }

    pub fn publish_state(&self, state: InstrumentState) -> TeleopResult<()> {
        self.try_send(TransportCommand::PublishState(state))
    }

    pub fn end_tick(&self) -> TeleopResult<()> {
        self.try_send(TransportCommand::EndOfTick)
    }

    pub fn send_haptic(&self, feedback: HapticFeedback) -> TeleopResult<()> {
        self.try_send(TransportCommand::Haptic(feedback))
    }

    pub fn send_command(&self, command: SurgeonCommand) -> TeleopResult<()> {
        self.try_send(TransportCommand::SurgeonCommand(command))
    }

    /// Broadcast a stop ahead of any queued traffic
    ///
    /// Never refused for a full queue; repeated requests before the transport
    /// wakes collapse into one broadcast.
    pub fn emergency_stop(&self) -> TeleopResult<()> {
        if self.commands.is_closed() {
            return Err(TeleopError::ChannelClosed);
        }
        self.stop.raise();
        Ok(())
    }

    pub fn shutdown(&self) -> TeleopResult<()> {
        self.try_send(TransportCommand::Shutdown)
    }
}

pub struct StreamingTransport {
    config: TransportConfig,
    clock: Arc<dyn Clock>,
    core: StreamCore,
    datagram: Option<DatagramChannel>,
    ordered: Option<OrderedChannel>,
    listener: Option<TcpListener>,
    /// A connect task is running for the ordered channel
    connecting: bool,
    /// The datagram probe failed; send on the ordered channel when it is up
    fell_back: bool,
    inbound_tx: InboundSender,
    inbound_rx: InboundReceiver,
    commands: mpsc::Receiver<TransportCommand>,
    stop: Arc<StopSignal>,
    events: mpsc::Sender<TransportEvent>,
    pending_events: Vec<TransportEvent>,
    outbound: Vec<Message>,
    dropped_events: u64,
}

impl StreamingTransport {
    /// Bind sockets; nothing is sent until [`run`](Self::run)
    pub async fn bind(
        config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> TeleopResult<(Self, TransportHandle, mpsc::Receiver<TransportEvent>)> {
        config.params.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.command_capacity);
        let (command_tx, commands) = mpsc::channel(config.command_capacity);
        let (events, event_rx) = mpsc::channel(config.event_capacity);

        let mut datagram = None;
        if config.wants_datagram() {
            let mut channel = DatagramChannel::bind(config.bind).await?;
            if let Some(peer) = config.peer {
                channel.set_peer(peer);
            }
            channel.start_receive_loop(inbound_tx.clone());
            info!(addr = %channel.local_addr(), "datagram channel bound");
            datagram = Some(channel);
        }

        let mut listener = None;
        if config.wants_ordered() {
            if let Some(addr) = config.ordered_listen {
                let l = TcpListener::bind(addr)
                    .await
                    .map_err(|e| TeleopError::Transport(e.to_string()))?;
                info!(addr = ?l.local_addr().ok(), "ordered channel listening");
                listener = Some(l);
            }
        }

        let core = StreamCore::with_prediction(config.params.clone(), config.arm_count, config.prediction);
        let stop = Arc::new(StopSignal::default());
        let transport = StreamingTransport {
            config,
            clock,
            core,
            datagram,
            ordered: None,
            listener,
            connecting: false,
            fell_back: false,
            inbound_tx,
            inbound_rx,
            commands,
            stop: Arc::clone(&stop),
            events,
            pending_events: Vec::new(),
            outbound: Vec::new(),
            dropped_events: 0,
        };
        let handle = TransportHandle {
            commands: command_tx,
            stop,
        };
        Ok((transport, handle, event_rx))
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.datagram.as_ref().map(|d| d.local_addr())
    }

    pub fn ordered_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Drive the transport until shutdown or until every local handle is dropped
    pub async fn run(mut self) -> TeleopResult<()> {
        self.establish().await;

        let mut metrics = interval(self.config.metrics_interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.stop.take() {
                self.broadcast_emergency_stop().await;
            }
            tokio::select! {
                biased;

                _ = self.stop.notify.notified() => {}
                command = self.commands.recv() => match command {
                    Some(TransportCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
                accepted = accept(&self.listener) => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "ordered channel accepted");
                        self.ordered = Some(OrderedChannel::start(stream, peer, self.inbound_tx.clone()));
                    }
                    Err(e) => warn!(error = %e, "ordered accept failed"),
                },
                _ = ping.tick() => self.send_ping().await,
                _ = metrics.tick() => self.report(),
            }
            self.flush_events();
        }

        info!(stats = ?self.core.stats(), dropped_events = self.dropped_events, "transport stopped");
        self.core.transition(ConnectionState::Disconnected, &mut self.pending_events);
        self.flush_events();
        Ok(())
    }

    /// Bring up the preferred channel, falling back when it stays silent
    async fn establish(&mut self) {
        self.core.transition(ConnectionState::Signaling, &mut self.pending_events);

        let has_datagram_peer = self.datagram.as_ref().map_or(false, |d| d.peer().is_some());
        if self.config.params.protocol == StreamProtocol::Auto && has_datagram_peer {
            if !self.probe_datagram().await {
                warn!("datagram probe unanswered, falling back to ordered channel");
                self.fell_back = true;
                self.start_ordered_connect();
            }
        } else if self.config.wants_ordered() {
            self.start_ordered_connect();
        }
        self.flush_events();
    }

    /// Ping the datagram peer until a pong comes back or the probe times out
    async fn probe_datagram(&mut self) -> bool {
        let deadline = Instant::now() + self.config.probe_timeout;
        while Instant::now() < deadline {
            self.send_ping().await;
            let wait = self.config.ping_interval.max(Duration::from_millis(10));
            if let Ok(Some(inbound)) = timeout(wait, self.inbound_rx.recv()).await {
                self.handle_inbound(inbound).await;
            }
            if self.core.state().is_up() {
                return true;
            }
        }
        false
    }

    fn start_ordered_connect(&mut self) {
        if self.connecting || self.ordered.is_some() {
            return;
        }
        if let Some(peer) = self.config.ordered_peer {
            debug!(%peer, "connecting ordered channel");
            self.connecting = true;
            spawn_connect(peer, self.config.reconnect, self.inbound_tx.clone());
        }
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        let mut outbound = std::mem::take(&mut self.outbound);
        match command {
            TransportCommand::PublishState(state) => self.core.outbound_state(state, &mut outbound),
            TransportCommand::EndOfTick => self.core.end_tick(&mut outbound),
            TransportCommand::Haptic(feedback) => outbound.push(Message::HapticFeedback(feedback)),
            TransportCommand::SurgeonCommand(command) => outbound.push(Message::SurgeonCommand(command)),
            TransportCommand::Shutdown => {}
        }
        for message in outbound.drain(..) {
            self.send(&message).await;
        }
        self.outbound = outbound;
    }

    /// Send a message on the preferred live channel
    async fn send(&mut self, message: &Message) {
        if !self.prefers_ordered() {
            if let Some(datagram) = &self.datagram {
                match datagram.send(&message.encode()).await {
                    Ok(true) => {
                        self.core.record_sent(message);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "datagram send failed"),
                }
            }
        }
        if let Some(ordered) = &mut self.ordered {
            match ordered.send(&encode_frame(message)).await {
                Ok(()) => self.core.record_sent(message),
                Err(e) => {
                    warn!(error = %e, "ordered send failed");
                    self.ordered_lost();
                }
            }
        }
    }

    fn prefers_ordered(&self) -> bool {
        self.ordered.is_some() && (self.fell_back || self.config.params.protocol == StreamProtocol::Ordered)
    }

    fn can_send(&self) -> bool {
        self.ordered.is_some() || self.datagram.as_ref().map_or(false, |d| d.peer().is_some())
    }

    /// Single-byte stop on every channel at once
    pub async fn broadcast_emergency_stop(&mut self) {
        let message = Message::EmergencyStop;
        let packet = message.encode();
        let frame = encode_frame(&message);

        let datagram = self.datagram.as_ref();
        let ordered = self.ordered.as_mut();
        let datagram = async move {
            match datagram {
                Some(d) => d.send(&packet).await.unwrap_or(false),
                None => false,
            }
        };
        let ordered = async move {
            match ordered {
                Some(o) => o.send(&frame).await.is_ok(),
                None => false,
            }
        };
        let (sent_datagram, sent_ordered) = tokio::join!(datagram, ordered);

        if sent_datagram || sent_ordered {
            self.core.record_sent(&message);
        }
        if !sent_datagram && !sent_ordered {
            error!("emergency stop could not be sent on any channel");
        } else {
            warn!(datagram = sent_datagram, ordered = sent_ordered, "emergency stop broadcast");
        }
    }

    async fn send_ping(&mut self) {
        let now = self.clock.now();
        if self.core.state().is_up() && self.core.is_silent(now, self.config.silence_timeout) {
            warn!(timeout = ?self.config.silence_timeout, "peer silent");
            self.core.transition(ConnectionState::Disconnected, &mut self.pending_events);
            self.start_ordered_connect();
        }
        if !self.can_send() {
            return;
        }
        let ping = self.core.make_ping(now);
        self.send(&ping).await;
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let now = self.clock.now();
        match inbound {
            Inbound::Datagram(packet, from) => {
                if let Some(datagram) = &mut self.datagram {
                    if datagram.peer().is_none() {
                        info!(peer = %from, "datagram peer learned");
                        datagram.set_peer(from);
                    }
                }
                if let Some(reply) = self.core.handle_incoming(&packet, now, &mut self.pending_events) {
                    if let Some(datagram) = &self.datagram {
                        if let Err(e) = datagram.send_to(&reply.encode(), from).await {
                            debug!(error = %e, "reply send failed");
                        }
                    }
                }
            }
            Inbound::Frame(body) => {
                if let Some(reply) = self.core.handle_incoming(&body, now, &mut self.pending_events) {
                    if let Some(ordered) = &mut self.ordered {
                        if let Err(e) = ordered.send(&encode_frame(&reply)).await {
                            debug!(error = %e, "reply send failed");
                        }
                    }
                }
            }
            Inbound::OrderedClosed => {
                info!("ordered channel closed");
                self.ordered_lost();
            }
            Inbound::OrderedConnected(stream, peer) => {
                self.connecting = false;
                info!(%peer, "ordered channel up");
                self.ordered = Some(OrderedChannel::start(stream, peer, self.inbound_tx.clone()));
            }
        }
    }

    fn ordered_lost(&mut self) {
        self.ordered = None;
        let datagram_live = self.datagram.as_ref().map_or(false, |d| d.peer().is_some());
        if !datagram_live {
            self.core.transition(ConnectionState::Disconnected, &mut self.pending_events);
        }
        self.start_ordered_connect();
    }

    fn report(&mut self) {
        let now = self.clock.now();
        let report = self.core.report(now, &mut self.pending_events);
        debug!(
            latency_ms = ?report.avg_latency_ms,
            loss = report.loss_rate,
            bitrate_kbps = report.bitrate_kbps,
            state = %report.state,
            "link metrics"
        );
    }

    fn flush_events(&mut self) {
        for event in self.pending_events.drain(..) {
            if self.events.try_send(event).is_err() {
                self.dropped_events += 1;
            }
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesurg_core::{InstrumentId, MonotonicClock, PriorityMode, Timestamp, Vec3};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(MonotonicClock::new())
    }

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn next_matching<F>(rx: &mut mpsc::Receiver<TransportEvent>, f: F) -> TransportEvent
    where
        F: Fn(&TransportEvent) -> bool,
    {
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(event) if f(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        };
        timeout(Duration::from_secs(5), wait).await.expect("timed out waiting for event")
    }

    fn datagram_params() -> StreamingParameters {
        StreamingParameters {
            protocol: StreamProtocol::Datagram,
            priority: PriorityMode::Latency,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_datagram_session() {
        let responder_config = TransportConfig {
            bind: local(),
            ..TransportConfig::new(datagram_params(), 1)
        };
        let (responder, responder_handle, mut responder_events) =
            StreamingTransport::bind(responder_config, clock()).await.unwrap();
        let responder_addr = responder.datagram_addr().unwrap();
        tokio::spawn(responder.run());

        let initiator_config = TransportConfig {
            bind: local(),
            peer: Some(responder_addr),
            ..TransportConfig::new(datagram_params(), 1)
        };
        let (initiator, initiator_handle, mut initiator_events) =
            StreamingTransport::bind(initiator_config, clock()).await.unwrap();
        tokio::spawn(initiator.run());

        // pings establish both ends
        next_matching(&mut initiator_events, |e| matches!(e, TransportEvent::Heartbeat { .. })).await;
        next_matching(&mut responder_events, |e| {
            matches!(e, TransportEvent::StateChanged(ConnectionState::Connected))
        })
        .await;

        let state = InstrumentState::at_rest(InstrumentId::new(2), Vec3::new(1.0, 2.0, 3.0), Timestamp::from_millis(1));
        initiator_handle.publish_state(state).unwrap();
        let received = next_matching(&mut responder_events, |e| matches!(e, TransportEvent::RemoteState(_))).await;
        let TransportEvent::RemoteState(remote) = received else {
            unreachable!()
        };
        assert_eq!(remote.instrument_id, InstrumentId::new(2));
        assert_eq!(remote.tip_position, Vec3::new(1.0, 2.0, 3.0));

        responder_handle.emergency_stop().unwrap();
        next_matching(&mut initiator_events, |e| matches!(e, TransportEvent::EmergencyStop)).await;

        initiator_handle.shutdown().unwrap();
        responder_handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_ordered() {
        // datagram peer that never answers
        let silent = tokio::net::UdpSocket::bind(local()).await.unwrap();

        let responder_config = TransportConfig {
            bind: local(),
            ordered_listen: Some(local()),
            ..TransportConfig::new(StreamingParameters::default(), 1)
        };
        let (responder, responder_handle, _responder_events) =
            StreamingTransport::bind(responder_config, clock()).await.unwrap();
        let ordered_addr = responder.ordered_addr().unwrap();
        tokio::spawn(responder.run());

        let initiator_config = TransportConfig {
            bind: local(),
            peer: Some(silent.local_addr().unwrap()),
            ordered_peer: Some(ordered_addr),
            probe_timeout: Duration::from_millis(50),
            ..TransportConfig::new(StreamingParameters::default(), 1)
        };
        let (initiator, initiator_handle, mut initiator_events) =
            StreamingTransport::bind(initiator_config, clock()).await.unwrap();
        tokio::spawn(initiator.run());

        next_matching(&mut initiator_events, |e| matches!(e, TransportEvent::Heartbeat { .. })).await;

        let feedback = HapticFeedback {
            instrument_id: InstrumentId::new(0),
            timestamp: Timestamp::from_millis(4),
            force: Vec3::new(0.5, 0.0, 0.0),
            torque: Vec3::ZERO,
            grip_force: 1.5,
            tissue: None,
        };
        responder_handle.send_haptic(feedback).unwrap();
        let got = next_matching(&mut initiator_events, |e| matches!(e, TransportEvent::Haptic(_))).await;
        assert_eq!(got, TransportEvent::Haptic(feedback));

        initiator_handle.shutdown().unwrap();
        responder_handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_handle_reports_closed() {
        let config = TransportConfig {
            bind: local(),
            ..TransportConfig::new(datagram_params(), 1)
        };
        let (transport, handle, _events) = StreamingTransport::bind(config, clock()).await.unwrap();
        drop(transport);
        assert_eq!(handle.emergency_stop(), Err(TeleopError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_emergency_stop_overtakes_full_queue() {
        let remote = tokio::net::UdpSocket::bind(local()).await.unwrap();
        let config = TransportConfig {
            bind: local(),
            peer: Some(remote.local_addr().unwrap()),
            command_capacity: 8,
            ..TransportConfig::new(datagram_params(), 1)
        };
        let (transport, handle, _events) = StreamingTransport::bind(config, clock()).await.unwrap();

        let state = InstrumentState::at_rest(InstrumentId::new(0), Vec3::ZERO, Timestamp::from_millis(1));
        for _ in 0..8 {
            handle.publish_state(state).unwrap();
        }
        assert!(handle.publish_state(state).is_err());
        handle.emergency_stop().unwrap();
        handle.emergency_stop().unwrap();
        tokio::spawn(transport.run());

        // the stop leaves before any of the queued states
        let mut buf = [0u8; 256];
        let (len, _) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0xFF]);

        // the queued states and pings follow; the two requests were one stop
        let mut stops = 1;
        for _ in 0..20 {
            match timeout(Duration::from_millis(100), remote.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) if Message::is_emergency_stop(&buf[..len]) => stops += 1,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_params() {
        let params = StreamingParameters {
            target_latency_ms: 500.0,
            ..Default::default()
        };
        let config = TransportConfig {
            bind: local(),
            ..TransportConfig::new(params, 1)
        };
        assert!(StreamingTransport::bind(config, clock()).await.is_err());
    }
}
