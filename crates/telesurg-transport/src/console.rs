//! Surgeon console driver over datagrams
//!
//! The console bridge streams `SURGEON_COMMAND` records whose instrument id
//! is the manipulator channel and whose jaw field is the raw gripper aperture.
//! A background task keeps the newest sample per channel in a mailbox the
//! control thread reads without blocking. Haptics go back to whichever address
//! the bridge last sent from.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use telesurg_core::{ConsoleVersion, HapticFeedback, MasterConsole, MasterSample, TeleopError, TeleopResult};
use telesurg_wire::Message;

use crate::MAX_DATAGRAM_SIZE;

pub const CONSOLE_PROTOCOL_VERSION: u16 = 1;

/// Haptic sends queued before new ones are dropped
const HAPTIC_QUEUE: usize = 64;

#[derive(Debug, Default)]
struct Mailbox {
    latest: Vec<Option<MasterSample>>,
    console: Option<SocketAddr>,
    received: u64,
    rejected: u64,
    emergency_stop: bool,
}

pub struct NetworkConsole {
    mailbox: Arc<Mutex<Mailbox>>,
    haptics: mpsc::Sender<HapticFeedback>,
    local_addr: SocketAddr,
    channels: usize,
    tasks: [JoinHandle<()>; 2],
}

impl NetworkConsole {
    /// Bind and start listening; must be called inside a tokio runtime
    pub async fn bind(addr: SocketAddr, channels: usize) -> TeleopResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| TeleopError::Console(e.to_string()))?;
        let local_addr = socket.local_addr().map_err(|e| TeleopError::Console(e.to_string()))?;
        let socket = Arc::new(socket);

        let mailbox = Arc::new(Mutex::new(Mailbox {
            latest: vec![None; channels],
            ..Default::default()
        }));
        let (haptics, haptic_rx) = mpsc::channel(HAPTIC_QUEUE);

        let receiver = tokio::spawn(receive_samples(Arc::clone(&socket), Arc::clone(&mailbox)));
        let sender = tokio::spawn(send_haptics(socket, Arc::clone(&mailbox), haptic_rx));

        Ok(NetworkConsole {
            mailbox,
            haptics,
            local_addr,
            channels,
            tasks: [receiver, sender],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the bridge last sent from
    pub fn console_addr(&self) -> Option<SocketAddr> {
        self.mailbox.lock().console
    }

    pub fn packets_received(&self) -> u64 {
        self.mailbox.lock().received
    }

    /// Packets that were not usable surgeon commands
    pub fn packets_rejected(&self) -> u64 {
        self.mailbox.lock().rejected
    }
}

impl MasterConsole for NetworkConsole {
    fn read_manipulator(&mut self, channel: usize) -> TeleopResult<Option<MasterSample>> {
        self.mailbox
            .lock()
            .latest
            .get_mut(channel)
            .map(Option::take)
            .ok_or_else(|| TeleopError::Console(format!("no channel {}", channel)))
    }

    fn send_haptic(&mut self, channel: usize, feedback: &HapticFeedback) -> TeleopResult<()> {
        if channel >= self.channels {
            return Err(TeleopError::Console(format!("no channel {}", channel)));
        }
        self.haptics.try_send(*feedback).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TeleopError::Console("haptic queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TeleopError::ChannelClosed,
        })
    }

    fn get_version(&self) -> ConsoleVersion {
        ConsoleVersion {
            vendor: "telesurg-network".into(),
            firmware: env!("CARGO_PKG_VERSION").into(),
            protocol: CONSOLE_PROTOCOL_VERSION,
        }
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn take_emergency_stop(&mut self) -> bool {
        std::mem::take(&mut self.mailbox.lock().emergency_stop)
    }
}

impl Drop for NetworkConsole {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn receive_samples(socket: Arc<UdpSocket>, mailbox: Arc<Mutex<Mailbox>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "console receive error");
                continue;
            }
        };

        let decoded = Message::decode(&buf[..len]);
        let mut mb = mailbox.lock();
        mb.console = Some(from);
        match decoded {
            Ok(Message::SurgeonCommand(command)) => {
                let channel = command.instrument_id.0 as usize;
                if channel < mb.latest.len() {
                    mb.latest[channel] = Some(command.to_master_sample());
                    mb.received += 1;
                } else {
                    mb.rejected += 1;
                    debug!(channel, "sample for unknown console channel");
                }
            }
            Ok(Message::EmergencyStop) => {
                mb.received += 1;
                mb.emergency_stop = true;
                warn!(%from, "emergency stop from console");
            }
            Ok(other) => {
                mb.rejected += 1;
                debug!(kind = ?other.message_type(), "unexpected message from console");
            }
            Err(e) => {
                mb.rejected += 1;
                debug!(error = %e, "undecodable console packet");
            }
        }
    }
}

async fn send_haptics(socket: Arc<UdpSocket>, mailbox: Arc<Mutex<Mailbox>>, mut rx: mpsc::Receiver<HapticFeedback>) {
    while let Some(feedback) = rx.recv().await {
        let Some(dest) = mailbox.lock().console else {
            continue;
        };
        let packet = Message::HapticFeedback(feedback).encode();
        if let Err(e) = socket.send_to(&packet, dest).await {
            debug!(error = %e, "haptic send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use telesurg_core::{ButtonStates, InstrumentId, Quaternion, Timestamp, Vec3};
    use telesurg_wire::SurgeonCommand;

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not met");
    }

    fn command(channel: u32, x: f32, gripper: f32) -> Message {
        Message::SurgeonCommand(SurgeonCommand {
            timestamp: Timestamp::from_millis(3),
            instrument_id: InstrumentId::new(channel),
            position: Vec3::new(x, 0.0, 0.0),
            orientation: Quaternion::IDENTITY,
            jaw: gripper,
            velocity: Vec3::ZERO,
            buttons: ButtonStates::new(ButtonStates::CLUTCH),
        })
    }

    #[tokio::test]
    async fn test_latest_sample_per_channel() {
        let mut console = NetworkConsole::bind("127.0.0.1:0".parse().unwrap(), 2).await.unwrap();
        let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        bridge.send_to(&command(1, 1.0, 0.2).encode(), console.local_addr()).await.unwrap();
        bridge.send_to(&command(1, 2.0, 1.7).encode(), console.local_addr()).await.unwrap();
        wait_for(|| console.packets_received() == 2).await;

        assert_eq!(console.read_manipulator(0).unwrap(), None);
        let sample = console.read_manipulator(1).unwrap().unwrap();
        assert_eq!(sample.position.x, 2.0);
        assert_eq!(sample.gripper, 1.0);
        assert!(sample.buttons.clutch());
        // consumed
        assert_eq!(console.read_manipulator(1).unwrap(), None);
        assert!(console.read_manipulator(5).is_err());
        assert_eq!(console.console_addr(), Some(bridge.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_haptics_return_to_bridge() {
        let mut console = NetworkConsole::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        bridge.send_to(&command(0, 0.0, 0.0).encode(), console.local_addr()).await.unwrap();
        wait_for(|| console.console_addr().is_some()).await;

        let feedback = HapticFeedback {
            instrument_id: InstrumentId::new(0),
            timestamp: Timestamp::from_millis(9),
            force: Vec3::new(0.0, 0.0, 1.25),
            torque: Vec3::ZERO,
            grip_force: 2.0,
            tissue: None,
        };
        console.send_haptic(0, &feedback).unwrap();
        assert!(console.send_haptic(3, &feedback).is_err());

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), bridge.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap(), Message::HapticFeedback(feedback));
    }

    #[tokio::test]
    async fn test_console_emergency_stop_and_garbage() {
        let mut console = NetworkConsole::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        bridge.send_to(&[0x77], console.local_addr()).await.unwrap();
        bridge.send_to(&Message::EmergencyStop.encode(), console.local_addr()).await.unwrap();
        wait_for(|| console.packets_received() == 1).await;

        assert_eq!(console.packets_rejected(), 1);
        assert!(console.take_emergency_stop());
        assert!(!console.take_emergency_stop());
        assert_eq!(console.get_version().protocol, CONSOLE_PROTOCOL_VERSION);
    }
}
