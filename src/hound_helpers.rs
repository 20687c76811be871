//! A wrapper for the hound library that is suited for the installation's
//! needs: every file, loop or impulse response, ends up as de-interleaved
//! `f32` channels in [-1, 1].

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::path::Path;

/// Things that go wrong while reading audio files.
#[derive(Debug)]
pub enum AudioFileError {
    /// The file could not be opened or read.
    Io(std::io::Error),
    /// hound could not decode the file.
    Hound(hound::Error),
    /// The file declares zero channels.
    NoChannels,
}

impl fmt::Display for AudioFileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            AudioFileError::Io(error) => Cow::from(format!("io error: {}", error)),
            AudioFileError::Hound(error) => Cow::from(format!("wav error: {}", error)),
            AudioFileError::NoChannels => Cow::from("wav file has no channels"),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for AudioFileError {}

impl From<hound::Error> for AudioFileError {
    fn from(value: hound::Error) -> Self {
        match value {
            hound::Error::IoError(error) => Self::Io(error),
            other => Self::Hound(other),
        }
    }
}

impl From<std::io::Error> for AudioFileError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// De-interleaved audio with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    /// Samples per second.
    pub sample_rate: u32,
    /// One `Vec` per channel, all of equal length.
    pub channels: Vec<Vec<f32>>,
}

impl ChannelData {
    /// Number of frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Averages all channels into one.
    pub fn into_mono(self) -> Vec<f32> {
        let n_channels = self.channels.len();
        if n_channels == 1 {
            return self.channels.into_iter().next().unwrap_or_default();
        }
        (0..self.frames())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n_channels as f32)
            .collect()
    }
}

/// Reads the WAV file at `path`.
pub fn read_wav(path: impl AsRef<Path>) -> Result<ChannelData, AudioFileError> {
    let reader = WavReader::open(path)?;
    read_channels(reader)
}

/// Reads a WAV file from any seekable reader.
pub fn read_wav_from<R: Read>(source: R) -> Result<ChannelData, AudioFileError> {
    let reader = WavReader::new(source)?;
    read_channels(reader)
}

fn read_channels<R: Read>(mut reader: WavReader<R>) -> Result<ChannelData, AudioFileError> {
    let spec = reader.spec();
    let n_channels = spec.channels as usize;
    if n_channels == 0 {
        return Err(AudioFileError::NoChannels);
    }

    // collect the file into a Vec of interleaved f32 samples
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = (0..n_channels)
        .map(|ch| {
            interleaved
                .iter()
                .skip(ch)
                .step_by(n_channels)
                .copied()
                .collect()
        })
        .collect();

    Ok(ChannelData {
        sample_rate: spec.sample_rate,
        channels,
    })
}

/// Writes `channels` as a 32-bit float WAV into `sink`. Used to produce
/// fixtures and impulse response files.
pub fn write_wav_to<W: Write + Seek>(
    sink: W,
    sample_rate: u32,
    channels: &[Vec<f32>],
) -> Result<(), AudioFileError> {
    let spec = WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::new(sink, spec)?;
    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    for i in 0..frames {
        for channel in channels {
            writer.write_sample(channel[i])?;
        }
    }
    writer.finalize()?;
    Ok(())
}
