//! Immutable, shareable decoded PCM.
//!
//! A [`PcmBuffer`] holds one fully decoded sound in the engine's
//! output format, ready for any number of voices to read from. Mono
//! material is kept mono; the mixer duplicates it into both output
//! channels at mix time, which halves the memory cost of effect and
//! ambience libraries.

use std::sync::Arc;

use crate::common::{ChannelCount, OutputFormat};

/// A refcounted buffer of decoded PCM in the engine's output format.
///
/// Cloning is cheap and shares the underlying bytes; the data is
/// freed when the last clone (user-facing or voice-held) drops.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    channels: ChannelCount,
    sample_bytes: usize,
}

impl PcmBuffer {
    /// Builds a buffer from raw bytes already in `format`.
    ///
    /// The byte length is truncated to a whole number of sample
    /// blocks (`channels * sample size`).
    pub fn new(mut bytes: Vec<u8>, channels: ChannelCount, format: OutputFormat) -> PcmBuffer {
        let block = channels.get() as usize * format.sample_bytes();
        bytes.truncate(bytes.len() / block * block);
        PcmBuffer {
            inner: Arc::new(Inner {
                bytes,
                channels,
                sample_bytes: format.sample_bytes(),
            }),
        }
    }

    /// Builds an `F32` buffer from host-generated samples
    /// (interleaved when stereo).
    pub fn from_f32_samples(samples: &[f32], channels: ChannelCount) -> PcmBuffer {
        let mut bytes = Vec::with_capacity(samples.len() * size_of::<f32>());
        for s in samples {
            bytes.extend_from_slice(&s.to_ne_bytes());
        }
        PcmBuffer::new(bytes, channels, OutputFormat::F32)
    }

    /// Builds an `I16` buffer from host-generated samples
    /// (interleaved when stereo).
    pub fn from_i16_samples(samples: &[i16], channels: ChannelCount) -> PcmBuffer {
        let mut bytes = Vec::with_capacity(samples.len() * size_of::<i16>());
        for s in samples {
            bytes.extend_from_slice(&s.to_ne_bytes());
        }
        PcmBuffer::new(bytes, channels, OutputFormat::I16)
    }

    /// Length of the decoded data in bytes. Always a whole number of
    /// sample blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    /// Returns true if the buffer holds no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// Channel count of the source material: 1 (mono) or 2 (stereo).
    #[inline]
    pub fn channels(&self) -> ChannelCount {
        self.inner.channels
    }

    /// Size in bytes of one sample across all channels.
    #[inline]
    pub fn sample_block_bytes(&self) -> usize {
        self.inner.channels.get() as usize * self.inner.sample_bytes
    }

    /// The raw sample bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// Number of strong references to the underlying data.
    #[inline]
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::nz;

    #[test]
    fn truncates_to_whole_blocks() {
        // 7 bytes of "stereo i16" is one block (4 bytes) plus change
        let buf = PcmBuffer::new(vec![0u8; 7], nz!(2), OutputFormat::I16);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.sample_block_bytes(), 4);
    }

    #[test]
    fn from_samples_round_trips() {
        let buf = PcmBuffer::from_f32_samples(&[0.25, -0.5, 1.0, 0.0], nz!(2));
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.channels().get(), 2);
        let first = f32::from_ne_bytes(buf.as_slice()[0..4].try_into().unwrap());
        assert_eq!(first, 0.25);
    }

    #[test]
    fn clones_share_data() {
        let buf = PcmBuffer::from_i16_samples(&[1, 2, 3, 4], nz!(1));
        let other = buf.clone();
        assert_eq!(buf.use_count(), 2);
        assert_eq!(other.as_slice().as_ptr(), buf.as_slice().as_ptr());
        drop(other);
        assert_eq!(buf.use_count(), 1);
    }
}
