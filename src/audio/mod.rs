//! Audio subsystem module

pub mod chunk;
pub mod queue;
pub mod tone;

pub use chunk::AudioChunk;
pub use queue::{create_shared_queue, AudioQueue, SharedAudioQueue};
pub use tone::ToneGenerator;
