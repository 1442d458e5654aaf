//! Sine-tone PCM source

use std::f64::consts::TAU;

use crate::audio::chunk::AudioChunk;
use crate::error::AudioError;

/// Renders a continuous sine tone as fixed-size 16-bit chunks.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
    sample_rate: u32,
    channels: u8,
    phase: f64,
    /// Sample frames rendered so far
    position: u64,
}

impl ToneGenerator {
    pub fn new(frequency: f64, sample_rate: u32, channels: u8) -> Result<Self, AudioError> {
        if channels != 1 && channels != 2 {
            return Err(AudioError::UnsupportedChannels(channels));
        }
        if sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            frequency,
            amplitude: 0.25,
            sample_rate,
            channels,
            phase: 0.0,
            position: 0,
        })
    }

    /// Scale output, 0.0 silences and 1.0 is full scale.
    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude.clamp(0.0, 1.0);
    }

    /// Jump to `position_ms` from the start of the tone.
    pub fn seek(&mut self, position_ms: u32) {
        self.position = position_ms as u64 * self.sample_rate as u64 / 1000;
        let cycles = self.position as f64 * self.frequency / self.sample_rate as f64;
        self.phase = cycles.fract() * TAU;
    }

    /// Milliseconds rendered so far
    pub fn position_ms(&self) -> u32 {
        (self.position * 1000 / self.sample_rate as u64) as u32
    }

    /// Render the next `samples` sample frames.
    pub fn next_chunk(&mut self, samples: usize) -> AudioChunk {
        let step = TAU * self.frequency / self.sample_rate as f64;
        let mut pcm = Vec::with_capacity(samples * self.channels as usize);

        for _ in 0..samples {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f64) as i16;
            for _ in 0..self.channels {
                pcm.push(value);
            }
            self.phase = (self.phase + step) % TAU;
        }

        let timestamp = self.position_ms();
        self.position += samples as u64;

        AudioChunk::from_parts(timestamp, self.channels, self.sample_rate, pcm)
    }
}
