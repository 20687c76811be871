//! A wrapper for the hound WavWriter that writes rendered binaural blocks
//! to a stereo output file.

use crate::hound_helpers::AudioFileError;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Appends stereo blocks to a 32-bit float WAV file.
pub struct StereoWavWriter {
    writer: Option<WavWriter<BufWriter<File>>>,
    frames: u64,
}

impl StereoWavWriter {
    /// Creates the output file.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, AudioFileError> {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path, spec)?;

        Ok(Self {
            writer: Some(writer),
            frames: 0,
        })
    }

    /// Interleaves one block of left and right samples into the file.
    pub fn append(&mut self, left: &[f32], right: &[f32]) -> Result<(), AudioFileError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        for (l, r) in left.iter().zip(right) {
            writer.write_sample(*l)?;
            writer.write_sample(*r)?;
            self.frames += 1;
        }

        // flush after each block so the header stays valid if we get killed
        writer.flush()?;
        Ok(())
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Finalizes the file. This also happens when the writer is dropped,
    /// but calling it gives us controlled error checking.
    pub fn finalize(&mut self) -> Result<(), AudioFileError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            info!("StereoWavWriter : finalized after {} frames.", self.frames);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hound_helpers::read_wav;

    #[test]
    fn appended_blocks_read_back() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let path = tempfile.path();

        let mut writer = StereoWavWriter::create(path, 44100).unwrap();
        writer.append(&[0.25, 0.5], &[-0.25, -0.5]).unwrap();
        writer.append(&[1.0], &[0.0]).unwrap();
        assert_eq!(writer.frames(), 3);
        writer.finalize().unwrap();
        // finalizing twice is harmless
        writer.finalize().unwrap();

        let data = read_wav(path).unwrap();
        assert_eq!(data.sample_rate, 44100);
        assert_eq!(data.channels[0], vec![0.25, 0.5, 1.0]);
        assert_eq!(data.channels[1], vec![-0.25, -0.5, 0.0]);
    }
}
