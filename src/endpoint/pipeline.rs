//! Audio endpoint: one queue feeding one paced sender

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{create_shared_queue, AudioChunk, SharedAudioQueue};
use crate::config::AppConfig;
use crate::endpoint::registry::{Identified, Identity};
use crate::error::Result;
use crate::network::{self, AudioSender, SenderStats, Transport, TransportProtocol};

/// Remote audio sink fed from its own bounded queue
pub struct AudioEndpoint {
    identity: Identity,
    /// Serial of the control session that created the endpoint
    owner: Option<u64>,
    peer: SocketAddr,
    protocol: TransportProtocol,
    queue: SharedAudioQueue,
    sender: Mutex<Option<AudioSender>>,
    active: AtomicBool,
    created_at: DateTime<Utc>,
}

/// Endpoint snapshot for listings
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub id: String,
    pub active: bool,
    pub protocol: TransportProtocol,
    pub peer: String,
    pub owner: Option<u64>,
    pub queued_ms: u64,
    pub rejected_chunks: u64,
    pub stats: SenderStats,
    pub created_at: DateTime<Utc>,
}

impl AudioEndpoint {
    /// Connect to `peer` and start streaming whatever gets pushed.
    pub fn open(
        id: &str,
        owner: Option<u64>,
        peer: SocketAddr,
        protocol: TransportProtocol,
        config: &AppConfig,
    ) -> Result<Arc<Self>> {
        let transport = network::connect(
            protocol,
            peer,
            config.pacing.max_datagram_payload,
            config.pacing.send_buffer_size,
            Duration::from_millis(config.network.connect_timeout_ms),
        )?;
        let endpoint = Self::with_transport(id, owner, peer, protocol, transport, config)?;

        tracing::info!("Audio endpoint {} streaming to {} over {}", id, peer, protocol);
        Ok(endpoint)
    }

    /// Build an endpoint around an already-open transport.
    pub fn with_transport(
        id: &str,
        owner: Option<u64>,
        peer: SocketAddr,
        protocol: TransportProtocol,
        transport: Box<dyn Transport>,
        config: &AppConfig,
    ) -> Result<Arc<Self>> {
        let queue = create_shared_queue(config.audio.queue_capacity());
        let sender = AudioSender::start(id, queue.clone(), transport, config.pacing.clone())?;

        Ok(Arc::new(Self {
            identity: Identity::new(id),
            owner,
            peer,
            protocol,
            queue,
            sender: Mutex::new(Some(sender)),
            active: AtomicBool::new(true),
            created_at: Utc::now(),
        }))
    }

    /// Offer a chunk to the endpoint's queue. False when the queue is full.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        self.queue.push(chunk)
    }

    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Inactive endpoints keep their sender but receive no new audio.
    pub fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::SeqCst) != active {
            tracing::info!("Endpoint {} {}", self.id(), if active { "activated" } else { "deactivated" });
            if !active {
                self.queue.flush();
            }
        }
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn queue(&self) -> &SharedAudioQueue {
        &self.queue
    }

    pub fn stats(&self) -> SenderStats {
        self.sender
            .lock()
            .as_ref()
            .map(|s| s.stats())
            .unwrap_or_default()
    }

    /// Stop the sender thread and drop queued audio.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        if let Some(mut sender) = sender {
            sender.stop();
            self.queue.flush();
            tracing::info!("Audio endpoint {} stopped", self.id());
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().as_ref().map_or(false, |s| s.is_running())
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            id: self.id(),
            active: self.is_active(),
            protocol: self.protocol,
            peer: self.peer.to_string(),
            owner: self.owner,
            queued_ms: self.queue.queued_duration().as_millis() as u64,
            rejected_chunks: self.queue.overflow_count(),
            stats: self.stats(),
            created_at: self.created_at,
        }
    }
}

impl Identified for AudioEndpoint {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for AudioEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::sender::tests::RecordingTransport;
    use std::net::UdpSocket;

    pub(crate) fn recording_endpoint(id: &str) -> (Arc<AudioEndpoint>, RecordingTransport) {
        let transport = RecordingTransport::default();
        let config = AppConfig::default();
        let endpoint = AudioEndpoint::with_transport(
            id,
            None,
            "127.0.0.1:9".parse().unwrap(),
            TransportProtocol::Udp,
            Box::new(transport.clone()),
            &config,
        )
        .unwrap();
        (endpoint, transport)
    }

    #[test]
    fn test_deactivate_flushes_and_stop_is_idempotent() {
        let (endpoint, _transport) = recording_endpoint("den");
        endpoint.set_active(false);
        assert!(!endpoint.is_active());
        assert!(endpoint.queue().is_empty());

        assert!(endpoint.is_running());
        endpoint.stop();
        endpoint.stop();
        assert!(!endpoint.is_running());
        assert_eq!(endpoint.info().id, "den");
    }

    #[test]
    fn test_open_udp_endpoint_streams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer = receiver.local_addr().unwrap();

        let endpoint =
            AudioEndpoint::open("lan", Some(1), peer, TransportProtocol::Udp, &AppConfig::default()).unwrap();
        assert!(endpoint.push(AudioChunk::silence(0, 2, 44_100, 100).unwrap()));

        let mut buf = [0u8; 2048];
        let n = receiver.recv(&mut buf).unwrap();
        let (header, samples) = network::decode_packet(&buf[..n]).unwrap();
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.sample_count, 100);
        assert_eq!(samples.len(), 200);
        assert_eq!(endpoint.owner(), Some(1));
    }
}
