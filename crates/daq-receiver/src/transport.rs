//! Message transports feeding the receive thread.
//!
//! A transport writes received bytes straight into the buffer the decoder
//! hands out and reports how many arrived. `Ok(None)` means the read timed out
//! with nothing to deliver, which lets the receive loop run its timeout
//! monitor and service commands at a steady cadence.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use daq_core::{DaqError, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, info};

/// Framing a transport provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One message per receive, boundaries preserved
    Datagram,
    /// Byte stream, receives may split or join messages
    Stream,
}

/// Source of raw message bytes.
pub trait MessageTransport: Send {
    /// Framing provided.
    fn kind(&self) -> TransportKind;

    /// Longest a single `receive` may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Receive into `buf`. `Ok(None)` on timeout.
    ///
    /// Returns [`DaqError::ChannelClosed`] once the source can never deliver
    /// again, and [`DaqError::ConnectionLost`] when a stream peer disconnects
    /// (a later peer may still connect).
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Human-readable endpoint for logs and status.
    fn describe(&self) -> String;
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

/// Zero durations mean "block forever" to std sockets; never ask for that.
fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// UDP socket transport for the packet decoder.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `addr`.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "UDP transport bound");
        Ok(Self { socket, local_addr })
    }

    /// Bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl MessageTransport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.socket.set_read_timeout(Some(clamp_timeout(timeout)))?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(err) if is_timeout(err.kind()) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.local_addr)
    }
}

/// TCP transport for the stream decoder. Serves one connection at a time.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    /// Listen on `addr`.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "TCP transport listening");
        Ok(Self {
            listener,
            local_addr,
            stream: None,
            timeout: Duration::from_millis(10),
        })
    }

    /// Listening address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&mut self) -> Result<bool> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.timeout))?;
                stream.set_nodelay(true)?;
                info!(%peer, "Stream connection accepted");
                self.stream = Some(stream);
                Ok(true)
            }
            Err(err) if is_timeout(err.kind()) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl MessageTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = clamp_timeout(timeout);
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(self.timeout))?;
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.stream.is_none() && !self.accept()? {
            std::thread::sleep(self.timeout);
            return Ok(None);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.read(buf) {
            Ok(0) => {
                info!("Stream peer closed connection");
                self.stream = None;
                Err(DaqError::ConnectionLost("peer closed connection".to_string()))
            }
            Ok(n) => Ok(Some(n)),
            Err(err) if is_timeout(err.kind()) => Ok(None),
            Err(err) => {
                debug!(error = %err, "Stream read failed - dropping connection");
                self.stream = None;
                Err(DaqError::ConnectionLost(err.to_string()))
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }
}

/// In-process transport fed through a channel, for tests and simulators.
///
/// In datagram mode each sent vector is one message (truncated to the buffer,
/// like UDP). In stream mode sent vectors are concatenated and handed out in
/// whatever pieces fit the buffer.
pub struct ChannelTransport {
    rx: Receiver<Vec<u8>>,
    kind: TransportKind,
    pending: Vec<u8>,
    offset: usize,
    timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport and the sender that feeds it.
    #[must_use]
    pub fn pair(kind: TransportKind) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            tx,
            Self {
                rx,
                kind,
                pending: Vec::new(),
                offset: 0,
                timeout: Duration::from_millis(10),
            },
        )
    }

    fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(DaqError::ChannelClosed("channel transport sender dropped".to_string()))
            }
        }
    }
}

impl MessageTransport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = clamp_timeout(timeout);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.kind {
            TransportKind::Datagram => {
                let Some(message) = self.next_message()? else {
                    return Ok(None);
                };
                let n = message.len().min(buf.len());
                buf[..n].copy_from_slice(&message[..n]);
                Ok(Some(n))
            }
            TransportKind::Stream => {
                if self.offset >= self.pending.len() {
                    match self.next_message()? {
                        Some(message) => {
                            self.pending = message;
                            self.offset = 0;
                        }
                        None => return Ok(None),
                    }
                }
                let n = (self.pending.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                Ok(Some(n))
            }
        }
    }

    fn describe(&self) -> String {
        format!("channel://{:?}", self.kind).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_channel_datagram_preserves_boundaries() {
        let (tx, mut transport) = ChannelTransport::pair(TransportKind::Datagram);
        tx.send(vec![1, 2, 3]).unwrap();
        tx.send(vec![4]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(transport.receive(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(transport.receive(&mut buf).unwrap(), Some(1));
        assert_eq!(transport.receive(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_channel_stream_splits_messages() {
        let (tx, mut transport) = ChannelTransport::pair(TransportKind::Stream);
        tx.send(vec![1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 2];
        let mut got = Vec::new();
        while let Some(n) = transport.receive(&mut buf).unwrap() {
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_channel_closed() {
        let (tx, mut transport) = ChannelTransport::pair(TransportKind::Datagram);
        drop(tx);
        let mut buf = [0u8; 4];
        assert!(matches!(
            transport.receive(&mut buf),
            Err(DaqError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_udp_receive_and_timeout() {
        let mut transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        transport.set_read_timeout(Duration::from_millis(20)).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(transport.receive(&mut buf).unwrap(), None);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[7, 8, 9], transport.local_addr()).unwrap();
        assert_eq!(transport.receive(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[7, 8, 9]);
    }

    #[test]
    fn test_tcp_accept_and_read() {
        let mut transport = TcpTransport::bind("127.0.0.1:0").unwrap();
        transport.set_read_timeout(Duration::from_millis(20)).unwrap();
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        client.write_all(&[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        for _ in 0..50 {
            if let Some(n) = transport.receive(&mut buf).unwrap() {
                got.extend_from_slice(&buf[..n]);
            }
            if got.len() == 4 {
                break;
            }
        }
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_tcp_peer_close_is_connection_lost() {
        let mut transport = TcpTransport::bind("127.0.0.1:0").unwrap();
        transport.set_read_timeout(Duration::from_millis(20)).unwrap();
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        client.write_all(&[5, 6]).unwrap();
        drop(client);

        let mut buf = [0u8; 16];
        let mut lost = false;
        for _ in 0..50 {
            match transport.receive(&mut buf) {
                Err(DaqError::ConnectionLost(_)) => {
                    lost = true;
                    break;
                }
                other => assert!(other.is_ok()),
            }
        }
        assert!(lost);

        // A new peer is accepted afterwards.
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        client.write_all(&[7]).unwrap();
        let mut got = None;
        for _ in 0..50 {
            if let Some(n) = transport.receive(&mut buf).unwrap() {
                got = Some(buf[..n].to_vec());
                break;
            }
        }
        assert_eq!(got, Some(vec![7]));
    }
}
