//! PCM audio chunk handed from the playback producer to endpoint queues

use std::time::Duration;

use crate::error::AudioError;

/// A run of interleaved 16-bit PCM samples captured at one device tick.
///
/// Fields are only reachable through [`AudioChunk::new`], so every chunk
/// carries a non-zero rate and a payload aligned to its channel count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    timestamp: u32,
    channels: u8,
    sample_rate: u32,
    pcm: Vec<i16>,
}

impl AudioChunk {
    /// Create a chunk, validating the channel layout.
    pub fn new(
        timestamp: u32,
        channels: u8,
        sample_rate: u32,
        pcm: Vec<i16>,
    ) -> Result<Self, AudioError> {
        if channels != 1 && channels != 2 {
            return Err(AudioError::UnsupportedChannels(channels));
        }
        if sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate(sample_rate));
        }
        if pcm.len() % channels as usize != 0 {
            return Err(AudioError::MisalignedPayload {
                len: pcm.len(),
                channels,
            });
        }

        Ok(Self {
            timestamp,
            channels,
            sample_rate,
            pcm,
        })
    }

    /// Build from parts a generator has already validated.
    pub(crate) fn from_parts(timestamp: u32, channels: u8, sample_rate: u32, pcm: Vec<i16>) -> Self {
        debug_assert!(channels == 1 || channels == 2);
        debug_assert!(sample_rate > 0);
        debug_assert_eq!(pcm.len() % channels.max(1) as usize, 0);
        Self {
            timestamp,
            channels,
            sample_rate,
            pcm,
        }
    }

    /// Silent chunk covering `samples` sample frames.
    pub fn silence(timestamp: u32, channels: u8, sample_rate: u32, samples: usize) -> Result<Self, AudioError> {
        Self::new(timestamp, channels, sample_rate, vec![0; samples * channels as usize])
    }

    /// Device tick at capture
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Number of channels (1 or 2)
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved samples, `sample_count() * channels` long
    pub fn pcm(&self) -> &[i16] {
        &self.pcm
    }

    pub fn into_pcm(self) -> Vec<i16> {
        self.pcm
    }

    /// Number of sample frames (samples per channel)
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Payload size once framed on the wire
    pub fn byte_len(&self) -> usize {
        self.pcm.len() * std::mem::size_of::<i16>()
    }

    /// Playback duration of this chunk
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.sample_count() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_validation() {
        assert_eq!(
            AudioChunk::new(0, 3, 44_100, vec![0; 6]),
            Err(AudioError::UnsupportedChannels(3))
        );
        assert_eq!(
            AudioChunk::new(0, 2, 44_100, vec![0; 5]),
            Err(AudioError::MisalignedPayload { len: 5, channels: 2 })
        );
        assert!(AudioChunk::new(0, 2, 0, vec![0; 4]).is_err());
        assert_eq!(AudioChunk::new(0, 0, 44_100, Vec::new()), Err(AudioError::UnsupportedChannels(0)));
    }

    #[test]
    fn test_accessors_expose_validated_layout() {
        let chunk = AudioChunk::new(250, 1, 8_000, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(chunk.timestamp(), 250);
        assert_eq!(chunk.channels(), 1);
        assert_eq!(chunk.sample_rate(), 8_000);
        assert_eq!(chunk.pcm(), &[1, 2, 3, 4]);
        assert_eq!(chunk.duration(), Duration::from_micros(500));
        assert_eq!(chunk.into_pcm(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_chunk_sizes() {
        let chunk = AudioChunk::silence(7, 2, 44_100, 441).unwrap();
        assert_eq!(chunk.sample_count(), 441);
        assert_eq!(chunk.pcm().len(), 882);
        assert_eq!(chunk.byte_len(), 1764);
        assert_eq!(chunk.duration(), Duration::from_millis(10));

        let mono = AudioChunk::silence(0, 1, 48_000, 480).unwrap();
        assert_eq!(mono.sample_count(), 480);
        assert_eq!(mono.duration(), Duration::from_millis(10));
    }
}
