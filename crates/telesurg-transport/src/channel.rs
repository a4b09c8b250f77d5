//! Datagram and ordered channels
//!
//! Sockets are read by background tasks that forward packets into an mpsc
//! channel, so the transport loop only ever awaits cancel-safe receives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use telesurg_core::{TeleopError, TeleopResult};
use telesurg_wire::Message;

/// Largest datagram we accept
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Ordered frames carry a u16 little-endian length prefix
pub const FRAME_HEADER_SIZE: usize = 2;

/// What the socket tasks deliver to the transport loop
#[derive(Debug)]
pub enum Inbound {
    Datagram(Vec<u8>, SocketAddr),
    /// One length-delimited frame from the ordered channel
    Frame(Vec<u8>),
    /// The ordered channel's read side ended
    OrderedClosed,
    /// A (re)connect attempt produced a stream
    OrderedConnected(TcpStream, SocketAddr),
}

pub type InboundSender = mpsc::Sender<Inbound>;
pub type InboundReceiver = mpsc::Receiver<Inbound>;

fn transport_err(e: std::io::Error) -> TeleopError {
    TeleopError::Transport(e.to_string())
}

/// Unordered, no-retransmit channel
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peer: Option<SocketAddr>,
}

impl DatagramChannel {
    pub async fn bind(addr: SocketAddr) -> TeleopResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(transport_err)?;
        let local_addr = socket.local_addr().map_err(transport_err)?;
        Ok(DatagramChannel {
            socket: Arc::new(socket),
            local_addr,
            peer: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        if self.peer != Some(peer) {
            debug!(%peer, "datagram peer set");
            self.peer = Some(peer);
        }
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Send to the known peer; false when no peer is known yet
    pub async fn send(&self, packet: &[u8]) -> TeleopResult<bool> {
        let Some(peer) = self.peer else {
            return Ok(false);
        };
        self.send_to(packet, peer).await?;
        Ok(true)
    }

    pub async fn send_to(&self, packet: &[u8], dest: SocketAddr) -> TeleopResult<()> {
        self.socket.send_to(packet, dest).await.map_err(transport_err)?;
        Ok(())
    }

    /// Forward every received datagram into `tx`
    pub fn start_receive_loop(&self, tx: InboundSender) {
        let socket = self.socket();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if tx.send(Inbound::Datagram(buf[..len].to_vec(), addr)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "datagram receive error");
                    }
                }
            }
        });
    }
}

/// Length-prefix one message for the ordered channel
pub fn encode_frame(message: &Message) -> Bytes {
    let len = message.encoded_len();
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
    buf.put_u16_le(len as u16);
    message.encode_into(&mut buf);
    buf.freeze()
}

/// Ordered, reliable channel over TCP
pub struct OrderedChannel {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl OrderedChannel {
    /// Split `stream`, spawning the frame reader
    pub fn start(stream: TcpStream, peer: SocketAddr, tx: InboundSender) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        tokio::spawn(read_frames(reader, tx));
        OrderedChannel { writer, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, frame: &[u8]) -> TeleopResult<()> {
        self.writer.write_all(frame).await.map_err(transport_err)
    }
}

async fn read_frames(mut reader: OwnedReadHalf, tx: InboundSender) {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            debug!(error = %e, "ordered channel closed");
            break;
        }
        let len = u16::from_le_bytes(header) as usize;
        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            warn!(error = %e, len, "truncated frame on ordered channel");
            break;
        }
        if tx.send(Inbound::Frame(body)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Inbound::OrderedClosed).await;
}

/// Backoff for re-establishing the ordered channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter
    pub jitter: f32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-based)
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jitter = if self.jitter > 0.0 {
            rng.gen_range(0.0..self.jitter)
        } else {
            0.0
        };
        base.mul_f32(1.0 + jitter)
    }
}

/// Connect to `peer` with backoff until it succeeds or the loop goes away
pub fn spawn_connect(peer: SocketAddr, policy: ReconnectPolicy, tx: InboundSender) {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            match TcpStream::connect(peer).await {
                Ok(stream) => {
                    debug!(%peer, attempt, "ordered channel connected");
                    let _ = tx.send(Inbound::OrderedConnected(stream, peer)).await;
                    return;
                }
                Err(e) => {
                    let delay = policy.delay(attempt, &mut rand::thread_rng());
                    debug!(%peer, attempt, error = %e, ?delay, "ordered connect failed");
                    attempt = attempt.saturating_add(1);
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use telesurg_core::Timestamp;
    use telesurg_wire::Ping;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let mut a = DatagramChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = DatagramChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(a.local_addr().port(), 0);
        assert!(!a.send(&[1]).await.unwrap());

        let (tx, mut rx) = mpsc::channel(8);
        b.start_receive_loop(tx);

        a.set_peer(b.local_addr());
        assert!(a.send(&Message::EmergencyStop.encode()).await.unwrap());

        match rx.recv().await {
            Some(Inbound::Datagram(packet, from)) => {
                assert_eq!(packet, vec![0xFF]);
                assert_eq!(from, a.local_addr());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ordered_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        spawn_connect(addr, ReconnectPolicy::default(), tx.clone());
        let (server_stream, client_addr) = listener.accept().await.unwrap();
        let mut server = OrderedChannel::start(server_stream, client_addr, tx.clone());

        let client = match rx.recv().await {
            Some(Inbound::OrderedConnected(stream, peer)) => {
                assert_eq!(peer, addr);
                stream
            }
            other => panic!("unexpected {:?}", other),
        };
        let (client_tx, mut client_rx) = mpsc::channel(8);
        let _client = OrderedChannel::start(client, addr, client_tx);

        let ping = Message::Ping(Ping {
            seq: 9,
            origin: Timestamp::from_millis(3),
        });
        server.send(&encode_frame(&ping)).await.unwrap();
        server.send(&encode_frame(&Message::EmergencyStop)).await.unwrap();

        match client_rx.recv().await {
            Some(Inbound::Frame(body)) => assert_eq!(Message::decode(&body).unwrap(), ping),
            other => panic!("unexpected {:?}", other),
        }
        match client_rx.recv().await {
            Some(Inbound::Frame(body)) => assert_eq!(body, vec![0xFF]),
            other => panic!("unexpected {:?}", other),
        }

        drop(server);
        match client_rx.recv().await {
            Some(Inbound::OrderedClosed) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(0, &mut rng), Duration::from_millis(50));
        assert_eq!(policy.delay(2, &mut rng), Duration::from_millis(200));
        assert_eq!(policy.delay(30, &mut rng), Duration::from_secs(2));

        let jittered = ReconnectPolicy::default().delay(1, &mut rng);
        assert!(jittered >= Duration::from_millis(100) && jittered < Duration::from_millis(121));
    }

    #[test]
    fn test_frame_prefix() {
        let frame = encode_frame(&Message::EmergencyStop);
        assert_eq!(&frame[..], &[1, 0, 0xFF]);
    }
}
