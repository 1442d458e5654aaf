//! Fan-out of produced audio to every active endpoint

use std::sync::Arc;

use crate::audio::AudioChunk;
use crate::backend::{AudioSink, SinkOutcome};
use crate::endpoint::pipeline::AudioEndpoint;
use crate::endpoint::registry::EndpointRegistry;

/// Audio sink that copies each chunk into every active endpoint's queue
pub struct EndpointHub {
    endpoints: Arc<EndpointRegistry<AudioEndpoint>>,
}

impl EndpointHub {
    pub fn new(endpoints: Arc<EndpointRegistry<AudioEndpoint>>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry<AudioEndpoint>> {
        &self.endpoints
    }

    /// Drop queued audio on every endpoint. Returns the chunks discarded.
    pub fn flush_all(&self) -> usize {
        let flushed: usize = self.endpoints.snapshot().iter().map(|e| e.flush()).sum();
        if flushed > 0 {
            tracing::debug!("Flushed {} queued chunks", flushed);
        }
        flushed
    }
}

impl AudioSink for EndpointHub {
    fn deliver(&self, chunk: &AudioChunk) -> SinkOutcome {
        let active: Vec<_> = self
            .endpoints
            .snapshot()
            .into_iter()
            .filter(|e| e.is_active())
            .collect();
        if active.is_empty() {
            return SinkOutcome::NoListeners;
        }

        let accepted = active.iter().filter(|e| e.push(chunk.clone())).count();
        match accepted {
            0 => SinkOutcome::Rejected,
            n if n == active.len() => SinkOutcome::Accepted,
            _ => SinkOutcome::Partial,
        }
    }

    fn flush(&self) {
        self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::pipeline::tests::recording_endpoint;

    fn chunk() -> AudioChunk {
        AudioChunk::silence(0, 2, 44_100, 441).unwrap()
    }

    #[test]
    fn test_no_active_endpoints() {
        let registry = Arc::new(EndpointRegistry::new());
        let hub = EndpointHub::new(registry.clone());
        assert_eq!(hub.deliver(&chunk()), SinkOutcome::NoListeners);

        let (endpoint, _transport) = recording_endpoint("idle");
        endpoint.set_active(false);
        registry.register(endpoint);
        assert_eq!(hub.deliver(&chunk()), SinkOutcome::NoListeners);
    }

    #[test]
    fn test_full_queue_rejects() {
        let registry = Arc::new(EndpointRegistry::new());
        let hub = EndpointHub::new(registry.clone());
        let (endpoint, _transport) = recording_endpoint("full");
        endpoint.stop();
        registry.register(endpoint.clone());

        // 1s capacity holds 100 chunks of 10ms
        for _ in 0..100 {
            assert_eq!(hub.deliver(&chunk()), SinkOutcome::Accepted);
        }
        assert_eq!(hub.deliver(&chunk()), SinkOutcome::Rejected);

        let (open, _transport) = recording_endpoint("open");
        open.stop();
        registry.register(open);
        assert_eq!(hub.deliver(&chunk()), SinkOutcome::Partial);

        assert_eq!(hub.flush_all(), 101);
        assert_eq!(endpoint.queue().queued_samples(), 0);
    }
}
