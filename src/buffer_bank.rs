//! The loop buffers of the installation. Every sound identity owns one mono
//! buffer, and the identity doubles as the buffer's index here.

use crate::hound_helpers::{read_wav, AudioFileError};
use log::{info, warn};
use std::f32::consts::PI;
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of a buffer in the [`BufferBank`].
pub type BufferId = u32;

/// A mono buffer together with its native sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wraps raw samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
        }
    }

    /// A decaying tone, handy as a stand-in loop when no files are given.
    pub fn tone(freq: f32, duration: f64, sample_rate: u32) -> Self {
        let len = (duration * sample_rate as f64).round() as usize;
        let samples = (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                0.3 * (2.0 * PI * freq * t).sin() * (-3.0 * t).exp()
            })
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples per second.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Raw samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Linearly interpolated sample at `position` seconds, silence outside
    /// the buffer.
    pub fn sample_at(&self, position: f64) -> f32 {
        if position < 0.0 {
            return 0.0;
        }
        let index = position * self.sample_rate as f64;
        let i = index.floor() as usize;
        let frac = (index - i as f64) as f32;
        match (self.samples.get(i), self.samples.get(i + 1)) {
            (Some(a), Some(b)) => a + (b - a) * frac,
            (Some(a), None) => *a,
            _ => 0.0,
        }
    }
}

/// A buffer failed to load.
#[derive(Debug)]
pub struct BufferBankError {
    /// The file we tried to read.
    pub path: PathBuf,
    /// Why it failed.
    pub source: AudioFileError,
}

impl fmt::Display for BufferBankError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not load {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for BufferBankError {}

/// Loaded buffers, indexed by [`BufferId`]. Ids whose file failed to load
/// stay empty so the remaining ids keep their meaning.
#[derive(Debug, Clone, Default)]
pub struct BufferBank {
    buffers: Vec<Option<AudioBuffer>>,
}

impl BufferBank {
    /// Wraps already loaded buffers; buffer `i` gets id `i`.
    pub fn from_buffers(buffers: Vec<AudioBuffer>) -> Self {
        Self {
            buffers: buffers.into_iter().map(Some).collect(),
        }
    }

    /// `count` tones, a stand-in for a sound library.
    pub fn synthesized(count: usize, duration: f64, sample_rate: u32) -> Self {
        Self::from_buffers(
            (0..count)
                .map(|i| AudioBuffer::tone(110.0 * 2f32.powf(i as f32 / 5.0), duration, sample_rate))
                .collect(),
        )
    }

    /// Reads one file, folded to mono.
    pub fn load_one(path: impl AsRef<Path>) -> Result<AudioBuffer, BufferBankError> {
        let path = path.as_ref();
        let data = read_wav(path).map_err(|source| BufferBankError {
            path: path.to_path_buf(),
            source,
        })?;
        let sample_rate = data.sample_rate;
        Ok(AudioBuffer::new(data.into_mono(), sample_rate))
    }

    /// Loads every file; failures are logged and leave a hole.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Self {
        let buffers = paths
            .iter()
            .map(|path| match Self::load_one(path) {
                Ok(buffer) => {
                    info!(
                        "BufferBank : loaded {} ({:.2}s).",
                        path.as_ref().display(),
                        buffer.duration()
                    );
                    Some(buffer)
                }
                Err(error) => {
                    warn!("BufferBank : {error}");
                    None
                }
            })
            .collect();
        Self { buffers }
    }

    /// The buffer behind `id`, if it was loaded.
    pub fn get(&self, id: BufferId) -> Option<&AudioBuffer> {
        self.buffers.get(id as usize).and_then(Option::as_ref)
    }

    /// Number of ids, loaded or not.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the bank has no ids.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Snaps a loop length onto a grid of `quantization` seconds so devices that
/// join independently agree on the loop period. Never shorter than one grid
/// step; a non-positive grid leaves the length alone.
pub fn quantized_duration(duration: f64, quantization: f64) -> f64 {
    if quantization > 0.0 {
        ((duration / quantization + 0.5).floor() * quantization).max(quantization)
    } else {
        duration
    }
}
