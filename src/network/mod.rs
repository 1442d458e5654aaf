//! Network subsystem for paced PCM delivery

pub mod frame;
pub mod pacing;
pub mod sender;
pub mod transport;

pub use frame::{decode_packet, PacketFramer, PacketHeader};
pub use pacing::TokenBucket;
pub use sender::{AudioSender, SenderStats};
pub use transport::{connect, TcpTransport, Transport, TransportProtocol, UdpTransport};
