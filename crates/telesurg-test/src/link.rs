//! Two transport cores joined by chaos networks
//!
//! The robot side publishes states and pings; the console side answers. Both
//! run the real `StreamCore` logic (prediction, batching, latency and loss
//! monitoring, bitrate adaptation), only the sockets are replaced.

use telesurg_core::{InstrumentState, StreamingParameters, Timestamp};
use telesurg_transport::{MetricsReport, StreamCore, TransportEvent};
use telesurg_wire::Message;

use crate::chaos::{ChaosConfig, ChaosNetwork};

/// Events raised at each end during a step
#[derive(Debug, Default)]
pub struct LinkEvents {
    pub robot: Vec<TransportEvent>,
    pub console: Vec<TransportEvent>,
}

impl LinkEvents {
    pub fn clear(&mut self) {
        self.robot.clear();
        self.console.clear();
    }

    pub fn latency_warnings(&self) -> usize {
        self.robot
            .iter()
            .filter(|e| matches!(e, TransportEvent::LatencyWarning(_)))
            .count()
    }

    pub fn remote_states(&self) -> impl Iterator<Item = &InstrumentState> {
        self.console.iter().filter_map(|e| match e {
            TransportEvent::RemoteState(state) => Some(state),
            _ => None,
        })
    }
}

pub struct SimulatedLink {
    robot: StreamCore,
    console: StreamCore,
    /// Robot to console
    uplink: ChaosNetwork,
    /// Console to robot
    downlink: ChaosNetwork,
    outbound: Vec<Message>,
}

impl SimulatedLink {
    pub fn new(params: StreamingParameters, arm_count: usize, chaos: ChaosConfig, seed: u64) -> Self {
        SimulatedLink {
            robot: StreamCore::new(params.clone(), arm_count),
            console: StreamCore::new(params, arm_count),
            uplink: ChaosNetwork::new(chaos.clone(), seed),
            downlink: ChaosNetwork::new(chaos, seed.wrapping_add(1)),
            outbound: Vec::new(),
        }
    }

    pub fn robot(&self) -> &StreamCore {
        &self.robot
    }

    pub fn console(&self) -> &StreamCore {
        &self.console
    }

    pub fn uplink_mut(&mut self) -> &mut ChaosNetwork {
        &mut self.uplink
    }

    pub fn downlink_mut(&mut self) -> &mut ChaosNetwork {
        &mut self.downlink
    }

    /// Both directions at once
    pub fn set_chaos(&mut self, chaos: ChaosConfig) {
        self.uplink.set_config(chaos.clone());
        self.downlink.set_config(chaos);
    }

    pub fn set_blackout(&mut self, blackout: bool) {
        self.uplink.set_blackout(blackout);
        self.downlink.set_blackout(blackout);
    }

    /// Publish one robot state (predicted, possibly batched)
    pub fn publish(&mut self, state: InstrumentState, now: Timestamp) {
        self.robot.outbound_state(state, &mut self.outbound);
        self.send_outbound(now);
    }

    pub fn flush(&mut self, now: Timestamp) {
        self.robot.end_tick(&mut self.outbound);
        self.send_outbound(now);
    }

    pub fn ping(&mut self, now: Timestamp) {
        let ping = self.robot.make_ping(now);
        self.outbound.push(ping);
        self.send_outbound(now);
    }

    pub fn emergency_stop(&mut self, now: Timestamp) {
        self.outbound.push(Message::EmergencyStop);
        self.send_outbound(now);
    }

    fn send_outbound(&mut self, now: Timestamp) {
        for message in self.outbound.drain(..) {
            self.robot.record_sent(&message);
            self.uplink.send(&message.encode(), now);
        }
    }

    /// Deliver whatever has arrived by `now` at both ends
    pub fn step(&mut self, now: Timestamp, events: &mut LinkEvents) {
        for packet in self.uplink.deliver(now) {
            if let Some(reply) = self.console.handle_incoming(&packet, now, &mut events.console) {
                self.console.record_sent(&reply);
                self.downlink.send(&reply.encode(), now);
            }
        }
        for packet in self.downlink.deliver(now) {
            if let Some(reply) = self.robot.handle_incoming(&packet, now, &mut events.robot) {
                self.robot.record_sent(&reply);
                self.uplink.send(&reply.encode(), now);
            }
        }
    }

    /// Robot-side metrics pass
    pub fn report(&mut self, now: Timestamp, events: &mut LinkEvents) -> MetricsReport {
        self.robot.report(now, &mut events.robot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use telesurg_core::{InstrumentId, Vec3};
    use telesurg_transport::ConnectionState;

    #[test]
    fn test_states_cross_the_link() {
        let mut link = SimulatedLink::new(
            StreamingParameters::default(),
            1,
            ChaosConfig::ideal(Duration::from_millis(5)),
            1,
        );
        let mut events = LinkEvents::default();
        let state = InstrumentState::at_rest(InstrumentId::new(0), Vec3::new(1.0, 2.0, 3.0), Timestamp::from_millis(1));
        link.publish(state, Timestamp::from_millis(1));

        link.step(Timestamp::from_millis(5), &mut events);
        assert_eq!(events.remote_states().count(), 0);
        link.step(Timestamp::from_millis(6), &mut events);

        let received: Vec<_> = events.remote_states().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].tip_position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(link.console().state(), ConnectionState::Connected);
    }

    #[test]
    fn test_ping_round_trip() {
        let mut link = SimulatedLink::new(
            StreamingParameters::default(),
            1,
            ChaosConfig::ideal(Duration::from_millis(8)),
            1,
        );
        let mut events = LinkEvents::default();
        link.ping(Timestamp::ZERO);
        link.step(Timestamp::from_millis(8), &mut events);
        link.step(Timestamp::from_millis(16), &mut events);

        assert!(events.robot.iter().any(|e| matches!(
            e,
            TransportEvent::Heartbeat { round_trip } if *round_trip == Duration::from_millis(16)
        )));
        assert_eq!(link.robot().latency().average(), Some(8.0));
        assert_eq!(link.robot().stats().pongs_received, 1);
    }
}
