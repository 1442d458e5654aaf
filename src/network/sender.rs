//! Rate-limited audio sender
//!
//! One sender thread per endpoint drains the endpoint's queue and writes
//! framed PCM to its transport, spending token-bucket credit per chunk so
//! the transmitted sample rate tracks the chunk's nominal playback rate.
//! Transmit failures are logged and skipped: a lost packet is preferable
//! to a stalled stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::audio::{AudioChunk, SharedAudioQueue};
use crate::config::PacingConfig;
use crate::error::{AudioError, NetworkError};
use crate::network::frame::PacketFramer;
use crate::network::pacing::TokenBucket;
use crate::network::transport::Transport;

#[derive(Default)]
struct SenderCounters {
    chunks_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
}

/// Sender statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SenderStats {
    pub chunks_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Handle to a running sender thread
pub struct AudioSender {
    name: String,
    running: Arc<AtomicBool>,
    counters: Arc<SenderCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioSender {
    /// Spawn a sender draining `queue` into `transport`.
    pub fn start(
        name: &str,
        queue: SharedAudioQueue,
        transport: Box<dyn Transport>,
        pacing: PacingConfig,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(SenderCounters::default());

        let worker = SenderWorker {
            name: name.to_string(),
            queue,
            framer: PacketFramer::new(transport.max_packet()),
            transport,
            bucket: None,
            pacing,
            running: running.clone(),
            counters: counters.clone(),
            consecutive_errors: 0,
        };

        let handle = thread::Builder::new()
            .name(format!("sender-{}", name))
            .spawn(move || worker.run())
            .map_err(|e| AudioError::Spawn(e.to_string()))?;

        tracing::debug!("Sender {} started", name);

        Ok(Self {
            name: name.to_string(),
            running,
            counters,
            thread_handle: Some(handle),
        })
    }

    /// Request cancellation and wait for the thread to exit.
    ///
    /// The thread notices within one queue timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sender {} panicked", self.name);
            }
            tracing::debug!("Sender {} stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            chunks_sent: self.counters.chunks_sent.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SenderWorker {
    name: String,
    queue: SharedAudioQueue,
    transport: Box<dyn Transport>,
    framer: PacketFramer,
    /// Created from the first chunk's sample rate
    bucket: Option<TokenBucket>,
    pacing: PacingConfig,
    running: Arc<AtomicBool>,
    counters: Arc<SenderCounters>,
    consecutive_errors: u64,
}

impl SenderWorker {
    fn run(mut self) {
        let gap = self.pacing.inter_packet_gap();

        while self.running.load(Ordering::Relaxed) {
            let Some(chunk) = self.queue.pop_timed(self.pacing.pop_timeout()) else {
                continue;
            };
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if !self.wait_for_credit(&chunk) {
                break;
            }

            self.transmit(&chunk);

            if !gap.is_zero() {
                thread::sleep(gap);
            }
        }

        self.transport.close();
    }

    /// Block until the bucket covers `chunk`. False if cancelled meanwhile.
    fn wait_for_credit(&mut self, chunk: &AudioChunk) -> bool {
        let samples = chunk.sample_count() as u64;
        let pacing = &self.pacing;
        let bucket = self.bucket.get_or_insert_with(|| {
            TokenBucket::new(
                chunk.sample_rate(),
                pacing.refill_interval(),
                pacing.burst_intervals,
                Instant::now(),
            )
        });
        bucket.set_sample_rate(chunk.sample_rate());
        bucket.ensure_capacity(samples);

        let quantum = self.pacing.wait_quantum();
        loop {
            bucket.refill(Instant::now());
            if bucket.try_consume(samples) {
                return true;
            }
            if !self.running.load(Ordering::Relaxed) {
                return false;
            }
            thread::sleep(quantum);
        }
    }

    fn transmit(&mut self, chunk: &AudioChunk) {
        for packet in self.framer.frame(chunk) {
            match self.transport.send(&packet) {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_sent
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                }
                Err(e) => self.record_error(e),
            }
        }
        self.counters.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&mut self, error: NetworkError) {
        self.consecutive_errors += 1;
        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);

        if self.consecutive_errors == 1 || self.consecutive_errors % 500 == 0 {
            tracing::warn!(
                "Sender {}: transmit failed ({} in a row): {}",
                self.name,
                self.consecutive_errors,
                error
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::create_shared_queue;
    use crate::network::frame::decode_packet;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Transport that records packets in memory
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub packets: Arc<Mutex<Vec<(Instant, Bytes)>>>,
        pub fail: Arc<AtomicBool>,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NetworkError::SendFailed("unplugged".into()));
            }
            self.packets
                .lock()
                .push((Instant::now(), Bytes::copy_from_slice(packet)));
            Ok(())
        }

        fn max_packet(&self) -> Option<usize> {
            None
        }

        fn close(&mut self) {}
    }

    fn fast_pacing() -> PacingConfig {
        PacingConfig {
            inter_packet_gap_us: 0,
            pop_timeout_ms: 20,
            wait_quantum_ms: 1,
            ..PacingConfig::default()
        }
    }

    fn chunk(timestamp: u32) -> AudioChunk {
        AudioChunk::silence(timestamp, 2, 44_100, 441).unwrap()
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_sender_preserves_order() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let transport = RecordingTransport::default();
        let packets = transport.packets.clone();

        for ts in 0..3 {
            assert!(queue.push(chunk(ts * 10)));
        }
        let mut sender = AudioSender::start("order", queue.clone(), Box::new(transport), fast_pacing()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || packets.lock().len() == 3));
        sender.stop();

        let timestamps: Vec<u32> = packets
            .lock()
            .iter()
            .map(|(_, p)| decode_packet(p).unwrap().0.timestamp)
            .collect();
        assert_eq!(timestamps, vec![0, 10, 20]);
        assert_eq!(queue.queued_samples(), 0);
        assert_eq!(sender.stats().chunks_sent, 3);
        assert_eq!(sender.stats().bytes_sent, 3 * (1764 + 20));
    }

    #[test]
    fn test_sender_paces_to_playback_rate() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let transport = RecordingTransport::default();
        let packets = transport.packets.clone();

        // 300ms of audio
        for ts in 0..30 {
            assert!(queue.push(chunk(ts * 10)));
        }
        let start = Instant::now();
        let mut sender = AudioSender::start("pace", queue, Box::new(transport), fast_pacing()).unwrap();

        assert!(wait_until(Duration::from_secs(3), || packets.lock().len() == 30));
        let elapsed = start.elapsed();
        sender.stop();

        assert!(elapsed >= Duration::from_millis(250), "sent too fast: {:?}", elapsed);
    }

    #[test]
    fn test_sender_survives_transport_errors() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let transport = RecordingTransport::default();
        transport.fail.store(true, Ordering::SeqCst);
        let fail = transport.fail.clone();
        let packets = transport.packets.clone();

        queue.push(chunk(0));
        queue.push(chunk(10));
        let mut sender = AudioSender::start("flaky", queue.clone(), Box::new(transport), fast_pacing()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || sender.stats().send_errors == 2));
        fail.store(false, Ordering::SeqCst);
        queue.push(chunk(20));

        assert!(wait_until(Duration::from_secs(2), || packets.lock().len() == 1));
        sender.stop();
        assert_eq!(sender.stats().chunks_sent, 3);
    }

    #[test]
    fn test_stop_is_prompt_when_idle() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let mut sender =
            AudioSender::start("idle", queue, Box::new(RecordingTransport::default()), fast_pacing()).unwrap();
        assert!(sender.is_running());

        let start = Instant::now();
        sender.stop();
        assert!(!sender.is_running());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
