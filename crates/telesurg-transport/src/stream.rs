//! Socket-free streaming core
//!
//! [`StreamCore`] holds everything the transport knows about a session except
//! the sockets: per-instrument rings and predictors, latency/loss monitors,
//! bitrate control, time sync and the connection state. The async transport
//! feeds it packets and timer ticks; tests drive it directly.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use telesurg_core::{
    HapticFeedback, InstrumentId, InstrumentState, PriorityMode, StreamingParameters, Timestamp, MAX_INSTRUMENTS,
};
use telesurg_predict::{PredictionConfig, PredictionEngine, PredictionStats};
use telesurg_wire::{BatchUpdate, Message, Ping, Pong, SurgeonCommand};

use crate::{
    AdaptiveBitrate, ConnectionState, LatencyMonitor, PacketLossMonitor, StateRing, SyncSample, TimeSync,
    DEFAULT_RING_CAPACITY, LATENCY_FACTOR,
};

/// States handed to the predictor as history
const PREDICTION_HISTORY: usize = 16;

/// Something the transport tells the rest of the system
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Instrument state received from the peer
    RemoteState(InstrumentState),
    Haptic(HapticFeedback),
    SurgeonCommand(SurgeonCommand),
    EmergencyStop,
    /// Average latency over budget, ms
    LatencyWarning(f32),
    Metrics(MetricsReport),
    StateChanged(ConnectionState),
    /// Peer answered a ping
    Heartbeat { round_trip: Duration },
}

/// Once-per-second link summary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsReport {
    pub timestamp: Timestamp,
    pub avg_latency_ms: Option<f32>,
    pub max_latency_ms: Option<f32>,
    pub p95_latency_ms: Option<f32>,
    pub loss_rate: f32,
    pub bitrate_kbps: u32,
    pub fec: bool,
    pub clock_offset_us: Option<i64>,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub batches_sent: u64,
    pub emergency_stops_sent: u64,
    pub emergency_stops_received: u64,
}

/// Outbound history and prediction for one instrument
struct Track {
    ring: StateRing,
    predictor: PredictionEngine,
}

pub struct StreamCore {
    params: StreamingParameters,
    state: ConnectionState,
    prediction: PredictionConfig,
    tracks: HashMap<InstrumentId, Track>,
    ring_capacity: usize,
    history: Vec<InstrumentState>,
    pending_batch: Vec<InstrumentState>,
    latency: LatencyMonitor,
    loss: PacketLossMonitor,
    bitrate: AdaptiveBitrate,
    sync: TimeSync,
    next_ping: u32,
    last_heard: Option<Timestamp>,
    stats: TransportStats,
}

impl StreamCore {
    pub fn new(params: StreamingParameters, arm_count: usize) -> Self {
        let prediction = PredictionConfig::from_streaming(&params);
        Self::with_prediction(params, arm_count, prediction)
    }

    pub fn with_prediction(params: StreamingParameters, arm_count: usize, prediction: PredictionConfig) -> Self {
        StreamCore {
            bitrate: AdaptiveBitrate::new(&params),
            state: ConnectionState::Disconnected,
            prediction,
            tracks: HashMap::with_capacity(arm_count.clamp(1, MAX_INSTRUMENTS)),
            ring_capacity: DEFAULT_RING_CAPACITY,
            history: Vec::with_capacity(PREDICTION_HISTORY),
            pending_batch: Vec::with_capacity(MAX_INSTRUMENTS),
            latency: LatencyMonitor::default(),
            loss: PacketLossMonitor::default(),
            sync: TimeSync::default(),
            next_ping: 0,
            last_heard: None,
            stats: TransportStats::default(),
            params,
        }
    }

    pub fn params(&self) -> &StreamingParameters {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn latency(&self) -> &LatencyMonitor {
        &self.latency
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.sync
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate.bitrate_kbps()
    }

    pub fn fec_enabled(&self) -> bool {
        self.bitrate.fec_enabled()
    }

    pub fn ring(&self, id: InstrumentId) -> Option<&StateRing> {
        self.tracks.get(&id).map(|t| &t.ring)
    }

    pub fn prediction_stats(&self, id: InstrumentId) -> Option<&PredictionStats> {
        self.tracks.get(&id).map(|t| t.predictor.stats())
    }

    pub fn last_heard(&self) -> Option<Timestamp> {
        self.last_heard
    }

    /// Move to `next`, emitting `StateChanged` if it differs
    pub fn transition(&mut self, next: ConnectionState, events: &mut Vec<TransportEvent>) {
        if next != self.state {
            info!(from = %self.state, to = %next, "connection state changed");
            self.state = next;
            events.push(TransportEvent::StateChanged(next));
        }
    }

    /// Record a local state and produce what to send for it
    ///
    /// The state is stored unmodified; the outgoing copy is predicted forward
    /// by the lead time. In throughput mode states of one tick are collected
    /// until [`end_tick`](Self::end_tick) and sent as a single batch.
    pub fn outbound_state(&mut self, state: InstrumentState, out: &mut Vec<Message>) {
        let ring_capacity = self.ring_capacity;
        let prediction = self.prediction;
        let track = self.tracks.entry(state.instrument_id).or_insert_with(|| Track {
            ring: StateRing::new(ring_capacity),
            predictor: PredictionEngine::new(prediction),
        });

        track.ring.copy_recent(PREDICTION_HISTORY, &mut self.history);
        track.ring.push(state);
        let predicted = track.predictor.predict(&state, &self.history);

        match self.params.priority {
            PriorityMode::Latency => out.push(Message::InstrumentState(predicted)),
            PriorityMode::Throughput => {
                let stale = self
                    .pending_batch
                    .first()
                    .map_or(false, |s| s.timestamp != predicted.timestamp);
                if stale || self.pending_batch.len() >= MAX_INSTRUMENTS {
                    self.flush_batch(out);
                }
                self.pending_batch.push(predicted);
            }
        }
    }

    /// The control tick has published every state it will
    pub fn end_tick(&mut self, out: &mut Vec<Message>) {
        self.flush_batch(out);
    }

    /// Send whatever is pending in the batch
    pub fn flush_batch(&mut self, out: &mut Vec<Message>) {
        if self.pending_batch.is_empty() {
            return;
        }
        let timestamp = self.pending_batch[0].timestamp;
        match BatchUpdate::new(timestamp, &self.pending_batch) {
            Ok(batch) => {
                self.stats.batches_sent += 1;
                out.push(Message::BatchUpdate(batch));
            }
            Err(e) => warn!(error = %e, "dropping batch"),
        }
        self.pending_batch.clear();
    }

    /// Next ping; its sequence id is tracked for loss
    pub fn make_ping(&mut self, now: Timestamp) -> Message {
        let seq = self.next_ping;
        self.next_ping = self.next_ping.wrapping_add(1);
        self.loss.record_sent(seq, now);
        self.stats.pings_sent += 1;
        Message::Ping(Ping { seq, origin: now })
    }

    /// Count a message leaving on any channel
    pub fn record_sent(&mut self, message: &Message) {
        self.stats.messages_sent += 1;
        if matches!(message, Message::EmergencyStop) {
            self.stats.emergency_stops_sent += 1;
        }
    }

    /// Process one received packet
    ///
    /// Returns a reply to send back on the same channel (a pong for a ping).
    pub fn handle_incoming(&mut self, packet: &[u8], now: Timestamp, events: &mut Vec<TransportEvent>) -> Option<Message> {
        if Message::is_emergency_stop(packet) {
            self.heard(now, events);
            self.stats.emergency_stops_received += 1;
            warn!("emergency stop received from peer");
            events.push(TransportEvent::EmergencyStop);
            return None;
        }

        let message = match Message::decode(packet) {
            Ok(m) => m,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(error = %e, len = packet.len(), "dropping undecodable packet");
                return None;
            }
        };
        self.heard(now, events);

        match message {
            Message::InstrumentState(state) => events.push(TransportEvent::RemoteState(state)),
            Message::BatchUpdate(batch) => {
                events.extend(batch.into_states().into_iter().map(TransportEvent::RemoteState));
            }
            Message::HapticFeedback(feedback) => events.push(TransportEvent::Haptic(feedback)),
            Message::SurgeonCommand(command) => events.push(TransportEvent::SurgeonCommand(command)),
            Message::Ping(ping) => return Some(Message::Pong(Pong::answer(&ping, now, now))),
            Message::Pong(pong) => self.handle_pong(&pong, now, events),
            Message::EmergencyStop => {}
        }
        None
    }

    fn heard(&mut self, now: Timestamp, events: &mut Vec<TransportEvent>) {
        self.stats.messages_received += 1;
        self.last_heard = Some(now);
        if !self.state.is_up() {
            let next = self.state.established();
            self.transition(next, events);
        }
    }

    fn handle_pong(&mut self, pong: &Pong, now: Timestamp, events: &mut Vec<TransportEvent>) {
        self.stats.pongs_received += 1;
        if !self.loss.acknowledge(pong.seq) {
            debug!(seq = pong.seq, "late or duplicate pong");
            return;
        }
        let sample = SyncSample::from_pong(pong, now);
        let one_way_ms = sample.round_trip.as_micros() as f32 / 2000.0;
        self.latency.record(one_way_ms);
        self.sync.update(&sample);
        trace!(seq = pong.seq, latency_ms = one_way_ms, offset_us = sample.offset_us, "pong");
        events.push(TransportEvent::Heartbeat {
            round_trip: sample.round_trip,
        });
    }

    /// No traffic from the peer for longer than `timeout`
    pub fn is_silent(&self, now: Timestamp, timeout: Duration) -> bool {
        match self.last_heard {
            Some(t) => now.since(t) > timeout,
            None => false,
        }
    }

    /// Periodic metrics pass: loss pruning, bitrate/FEC decisions, health
    pub fn report(&mut self, now: Timestamp, events: &mut Vec<TransportEvent>) -> MetricsReport {
        let lost = self.loss.prune(now);
        let loss_rate = self.loss.take_loss_rate();
        let avg = self.latency.average();
        let decision = self.bitrate.adjust(avg, loss_rate);

        if let Some(avg) = avg.filter(|a| *a > self.params.target_latency_ms * LATENCY_FACTOR) {
            warn!(latency_ms = avg, target_ms = self.params.target_latency_ms, "latency over budget");
            events.push(TransportEvent::LatencyWarning(avg));
        }
        if decision.bitrate_changed {
            info!(bitrate_kbps = decision.bitrate_kbps, "bitrate adjusted");
        }
        if decision.fec_changed {
            info!(fec = decision.fec, loss_rate, lost, "forward error correction toggled");
        }

        let next = self.state.with_health(decision.degraded);
        self.transition(next, events);

        let report = MetricsReport {
            timestamp: now,
            avg_latency_ms: avg,
            max_latency_ms: self.latency.max(),
            p95_latency_ms: self.latency.percentile(95.0),
            loss_rate,
            bitrate_kbps: decision.bitrate_kbps,
            fec: decision.fec,
            clock_offset_us: self.sync.offset_us(),
            state: self.state,
        };
        events.push(TransportEvent::Metrics(report));
        report
    }
}
