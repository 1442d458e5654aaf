//! Byte sinks the audio sender writes packets to

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use crate::error::NetworkError;

/// Socket type an endpoint is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(NetworkError::ConnectionFailed(format!(
                "unknown transport protocol: {other}"
            ))),
        }
    }
}

/// Opaque packet sink used by the sender thread.
pub trait Transport: Send {
    /// Write one framed packet.
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError>;

    /// Largest packet the transport accepts in one piece, if bounded.
    fn max_packet(&self) -> Option<usize>;

    /// Release the underlying socket.
    fn close(&mut self);
}

/// Connected UDP socket
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: SocketAddr,
    max_payload: usize,
}

impl UdpTransport {
    pub fn connect(peer: SocketAddr, max_payload: usize, send_buffer: usize) -> Result<Self, NetworkError> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        if send_buffer > 0 {
            if let Err(e) = socket.set_send_buffer_size(send_buffer) {
                tracing::warn!("Could not set UDP send buffer to {}: {}", send_buffer, e);
            }
        }

        let local = match peer.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        socket
            .bind(&SockAddr::from(local))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .connect(&SockAddr::from(peer))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            socket: Some(socket.into()),
            peer,
            max_payload,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        if packet.len() > self.max_payload {
            return Err(NetworkError::PacketTooLarge(packet.len()));
        }
        let socket = self.socket.as_ref().ok_or(NetworkError::Closed)?;
        socket
            .send(packet)
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn max_packet(&self) -> Option<usize> {
        Some(self.max_payload)
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

/// TCP byte stream
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect(peer: SocketAddr, timeout: Duration) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect_timeout(&peer, timeout)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{peer}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        let stream = self.stream.as_mut().ok_or(NetworkError::Closed)?;
        stream
            .write_all(packet)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn max_packet(&self) -> Option<usize> {
        None
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Open a transport of the requested type towards `peer`.
pub fn connect(
    protocol: TransportProtocol,
    peer: SocketAddr,
    max_datagram: usize,
    send_buffer: usize,
    connect_timeout: Duration,
) -> Result<Box<dyn Transport>, NetworkError> {
    match protocol {
        TransportProtocol::Udp => Ok(Box::new(UdpTransport::connect(peer, max_datagram, send_buffer)?)),
        TransportProtocol::Tcp => Ok(Box::new(TcpTransport::connect(peer, connect_timeout)?)),
    }
}
