//! Bounded producer/consumer queue of PCM chunks
//!
//! The queue is the only shared-mutable boundary between the playback
//! producer and an endpoint's sender thread. Capacity is measured in
//! seconds of audio rather than chunk count, so the bound holds whatever
//! chunk size the producer picks. Producers never block: a chunk that
//! would overflow the bound is rejected and the producer decides whether
//! to retry later or drop it.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::chunk::AudioChunk;

struct QueueState {
    chunks: VecDeque<AudioChunk>,
    queued_samples: u64,
}

impl QueueState {
    fn take_front(&mut self) -> Option<AudioChunk> {
        let chunk = self.chunks.pop_front()?;
        self.queued_samples -= chunk.sample_count() as u64;
        Some(chunk)
    }
}

/// Thread-safe FIFO of audio chunks bounded by buffered duration.
pub struct AudioQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: Duration,
    overflow_count: AtomicU64,
}

impl AudioQueue {
    /// Create a queue holding at most `capacity` worth of audio.
    pub fn new(capacity: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                queued_samples: 0,
            }),
            available: Condvar::new(),
            capacity,
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Sample budget for audio at `sample_rate`.
    pub fn capacity_samples(&self, sample_rate: u32) -> u64 {
        (self.capacity.as_micros() as u64 * sample_rate as u64) / 1_000_000
    }

    /// Append a chunk to the tail.
    ///
    /// Returns false when accepting it would exceed the capacity at the
    /// chunk's sample rate; the queue is left unchanged in that case.
    /// Chunks without samples are accepted and discarded.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        let samples = chunk.sample_count() as u64;
        if samples == 0 {
            return true;
        }
        let limit = self.capacity_samples(chunk.sample_rate());

        let mut state = self.state.lock();
        if state.queued_samples + samples > limit {
            drop(state);
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        state.queued_samples += samples;
        state.chunks.push_back(chunk);
        drop(state);

        self.available.notify_one();
        true
    }

    /// Remove the head, waiting as long as it takes for one to arrive.
    pub fn pop_blocking(&self) -> AudioChunk {
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.take_front() {
                return chunk;
            }
            self.available.wait(&mut state);
        }
    }

    /// Remove the head, waiting at most `timeout`.
    pub fn pop_timed(&self, timeout: Duration) -> Option<AudioChunk> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.take_front() {
                return Some(chunk);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.take_front();
            }
        }
    }

    /// Remove the head without waiting.
    pub fn try_pop(&self) -> Option<AudioChunk> {
        self.state.lock().take_front()
    }

    /// Discard everything queued. Returns the number of chunks dropped.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.chunks.len();
        state.chunks.clear();
        state.queued_samples = 0;
        dropped
    }

    /// Samples currently queued
    pub fn queued_samples(&self) -> u64 {
        self.state.lock().queued_samples
    }

    /// Buffered playback time, using each chunk's own rate
    pub fn queued_duration(&self) -> Duration {
        let state = self.state.lock();
        state.chunks.iter().map(AudioChunk::duration).sum()
    }

    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    pub fn capacity(&self) -> Duration {
        self.capacity
    }

    /// Number of pushes rejected for lack of room
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to an audio queue
pub type SharedAudioQueue = Arc<AudioQueue>;

/// Create a new shared audio queue
pub fn create_shared_queue(capacity: Duration) -> SharedAudioQueue {
    Arc::new(AudioQueue::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn chunk(timestamp: u32, samples: usize) -> AudioChunk {
        AudioChunk::silence(timestamp, 2, 44_100, samples).unwrap()
    }

    #[test]
    fn test_queue_fifo() {
        let queue = AudioQueue::new(Duration::from_secs(1));

        for ts in 0..3 {
            assert!(queue.push(chunk(ts, 441)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.queued_samples(), 1323);
        assert_eq!(queue.queued_duration(), Duration::from_millis(30));

        for ts in 0..3 {
            assert_eq!(queue.pop_blocking().timestamp(), ts);
        }
        assert_eq!(queue.queued_samples(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_rejects_over_capacity() {
        let queue = AudioQueue::new(Duration::from_millis(20));
        assert_eq!(queue.capacity_samples(44_100), 882);

        assert!(queue.push(chunk(0, 441)));
        assert!(queue.push(chunk(1, 441)));
        assert!(!queue.push(chunk(2, 1)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_samples(), 882);
        assert_eq!(queue.overflow_count(), 1);

        queue.try_pop().unwrap();
        assert!(queue.push(chunk(3, 441)));
    }

    #[test]
    fn test_zero_sample_chunk_not_queued() {
        let queue = AudioQueue::new(Duration::from_secs(1));
        assert!(queue.push(chunk(0, 0)));
        assert!(queue.is_empty());
        assert_eq!(queue.queued_samples(), 0);
    }

    #[test]
    fn test_flush_clears_state() {
        let queue = AudioQueue::new(Duration::from_secs(1));
        for ts in 0..5 {
            queue.push(chunk(ts, 441));
        }
        let held = queue.try_pop().unwrap();

        assert_eq!(queue.flush(), 4);
        assert_eq!(queue.queued_samples(), 0);
        assert!(queue.pop_timed(Duration::from_millis(5)).is_none());
        assert_eq!(held.sample_count(), 441);
    }

    #[test]
    fn test_pop_timed_times_out() {
        let queue = AudioQueue::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(queue.pop_timed(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_timed(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(queue.push(chunk(42, 441)));

        let popped = consumer.join().unwrap().expect("chunk delivered");
        assert_eq!(popped.timestamp(), 42);
    }

    #[test]
    fn test_cross_thread_order_preserved() {
        let queue = create_shared_queue(Duration::from_secs(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut ts = 0;
                while ts < 200 {
                    if queue.push(chunk(ts, 441)) {
                        ts += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        for expected in 0..200 {
            assert_eq!(queue.pop_blocking().timestamp(), expected);
        }
        producer.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_capacity_never_exceeded(ops in proptest::collection::vec((any::<bool>(), 1usize..2000), 1..200)) {
            let queue = AudioQueue::new(Duration::from_millis(250));
            let limit = queue.capacity_samples(44_100);

            for (is_push, samples) in ops {
                if is_push {
                    let before_len = queue.len();
                    let before = queue.queued_samples();
                    let accepted = queue.push(chunk(0, samples));
                    if !accepted {
                        prop_assert_eq!(queue.len(), before_len);
                        prop_assert_eq!(queue.queued_samples(), before);
                    }
                } else {
                    queue.try_pop();
                }
                prop_assert!(queue.queued_samples() <= limit);
            }
        }
    }
}
