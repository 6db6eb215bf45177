//! Iterator adapters that bring decoded audio into the engine's
//! output spec.
//!
//! The decoder backends produce samples at whatever rate and channel
//! layout the file was authored with; these adapters map the channel
//! count down to the engine's mono/stereo model and resample with
//! linear interpolation. They run on the loading thread and inside
//! decoder tasks, never in the mix callback.

use num_rational::Ratio;

use crate::common::{ChannelCount, Sample, SampleRate};
use crate::math::lerp;

/// Maps an interleaved sample stream from `from` channels to `to`
/// channels.
///
/// Only the layouts the mixer understands are produced: mono stays
/// mono, and anything wider than stereo keeps its first two channels.
/// Upmixing mono to stereo is left to the mixer.
#[derive(Clone, Debug)]
pub struct ChannelMapper<I> {
    input: I,
    from: ChannelCount,
    to: ChannelCount,
    frame_pos: u16,
}

impl<I> ChannelMapper<I>
where
    I: Iterator<Item = Sample>,
{
    /// `to` must not exceed `from`; widening is not this adapter's job.
    pub fn new(input: I, from: ChannelCount, to: ChannelCount) -> ChannelMapper<I> {
        assert!(to <= from);
        ChannelMapper {
            input,
            from,
            to,
            frame_pos: 0,
        }
    }

    /// Access the underlying iterator.
    #[inline]
    pub fn inner(&self) -> &I {
        &self.input
    }

    /// Destroys this adapter and returns the underlying iterator.
    #[inline]
    pub fn into_inner(self) -> I {
        self.input
    }
}

impl<I> Iterator for ChannelMapper<I>
where
    I: Iterator<Item = Sample>,
{
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        let sample = self.input.next()?;
        let pos = self.frame_pos;
        self.frame_pos = (self.frame_pos + 1) % self.from.get();

        if pos < self.to.get() {
            return Some(sample);
        }

        // drop the remainder of this frame, then recurse into the next
        for _ in pos + 1..self.from.get() {
            self.input.next()?;
        }
        self.frame_pos = 0;
        self.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let (min, max) = self.input.size_hint();
        let scale = |n: usize| n / self.from.get() as usize * self.to.get() as usize;
        (scale(min), max.map(scale))
    }
}

/// Converts an interleaved sample stream from one sample rate to
/// another with per-channel linear interpolation.
///
/// Frames are processed in chunks of `from` input frames mapping onto
/// `to` output frames, with `from`/`to` reduced by their gcd so the
/// position arithmetic stays small. Down-sampling discards frames;
/// this is the trade-off a game mixer makes to keep loads cheap.
#[derive(Clone, Debug)]
pub struct LinearResampler<I>
where
    I: Iterator,
{
    input: I,
    from: u32,
    to: u32,
    channels: ChannelCount,
    /// Frame most recently read, one sample per channel.
    current_frame: Vec<Sample>,
    /// The frame after `current_frame`.
    next_frame: Vec<Sample>,
    /// Position of `current_frame` within the chunk, modulo `from`.
    current_pos_in_chunk: u32,
    /// Position of the next output frame within the chunk, modulo `to`.
    next_output_pos_in_chunk: u32,
    /// Samples of the frame being emitted, beyond the first channel.
    output_buffer: Vec<Sample>,
}

impl<I> LinearResampler<I>
where
    I: Iterator<Item = Sample>,
{
    pub fn new(
        mut input: I,
        from: SampleRate,
        to: SampleRate,
        channels: ChannelCount,
    ) -> LinearResampler<I> {
        let (from, to) = Ratio::new(from.get(), to.get()).into_raw();

        let (current_frame, next_frame) = if from != to {
            let current = read_frame(&mut input, channels);
            let next = read_frame(&mut input, channels);
            (current, next)
        } else {
            (Vec::new(), Vec::new())
        };

        LinearResampler {
            input,
            from,
            to,
            channels,
            current_frame,
            next_frame,
            current_pos_in_chunk: 0,
            next_output_pos_in_chunk: 0,
            output_buffer: Vec::with_capacity(channels.get() as usize - 1),
        }
    }

    fn advance_input_frame(&mut self) {
        self.current_pos_in_chunk += 1;
        std::mem::swap(&mut self.current_frame, &mut self.next_frame);
        self.next_frame = read_frame(&mut self.input, self.channels);
    }

    /// Access the underlying iterator.
    #[inline]
    pub fn inner(&self) -> &I {
        &self.input
    }

    /// Destroys this adapter and returns the underlying iterator.
    #[inline]
    pub fn into_inner(self) -> I {
        self.input
    }
}

fn read_frame<I>(input: &mut I, channels: ChannelCount) -> Vec<Sample>
where
    I: Iterator<Item = Sample>,
{
    input.take(channels.get() as usize).collect()
}

impl<I> Iterator for LinearResampler<I>
where
    I: Iterator<Item = Sample>,
{
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if !self.output_buffer.is_empty() {
            return Some(self.output_buffer.remove(0));
        }

        if self.from == self.to {
            return self.input.next();
        }

        // the frame the next output sample interpolates from
        let req_pos = (self.from * self.next_output_pos_in_chunk) / self.to;
        while self.current_pos_in_chunk != req_pos {
            self.advance_input_frame();
        }

        if self.current_frame.is_empty() {
            return None;
        }

        let numerator = (self.from * self.next_output_pos_in_chunk) % self.to;
        let first = if self.next_frame.is_empty() {
            // input ended; hold the last frame rather than lerping into silence
            let out = *self.current_frame.first()?;
            self.output_buffer.extend_from_slice(&self.current_frame[1..]);
            out
        } else {
            let out = lerp(
                &self.current_frame[0],
                &self.next_frame[0],
                numerator,
                self.to,
            );
            for ch in 1..self.current_frame.len().min(self.next_frame.len()) {
                self.output_buffer.push(lerp(
                    &self.current_frame[ch],
                    &self.next_frame[ch],
                    numerator,
                    self.to,
                ));
            }
            out
        };

        self.next_output_pos_in_chunk += 1;
        if self.next_output_pos_in_chunk == self.to {
            // chunk complete; skip any input frames this chunk didn't visit
            self.next_output_pos_in_chunk = 0;
            while self.current_pos_in_chunk < self.from {
                self.advance_input_frame();
            }
            self.current_pos_in_chunk = 0;
        }

        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::nz;

    #[test]
    fn channel_passthrough() {
        let data = vec![0.1f32, 0.2, 0.3, 0.4];
        let out: Vec<_> = ChannelMapper::new(data.clone().into_iter(), nz!(2), nz!(2)).collect();
        assert_eq!(out, data);
    }

    #[test]
    fn drops_extra_channels() {
        // 3-channel frames [l, r, c]
        let data = vec![1.0f32, 2.0, 9.0, 3.0, 4.0, 9.0];
        let out: Vec<_> = ChannelMapper::new(data.into_iter(), nz!(3), nz!(2)).collect();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn resample_identity() {
        let data = vec![0.5f32, -0.5, 0.25, -0.25];
        let out: Vec<_> =
            LinearResampler::new(data.clone().into_iter(), nz!(44_100), nz!(44_100), nz!(2))
                .collect();
        assert_eq!(out, data);
    }

    #[test]
    fn resample_doubles() {
        let data = vec![0.0f32, 1.0, 0.0, 1.0];
        let out: Vec<_> =
            LinearResampler::new(data.into_iter(), nz!(22_050), nz!(44_100), nz!(1)).collect();
        // every second sample is the lerp midpoint of its neighbours
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.5);
        assert_eq!(out[2], 1.0);
        assert_eq!(out[3], 0.5);
    }

    #[test]
    fn resample_halves_len() {
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out: Vec<_> =
            LinearResampler::new(data.into_iter(), nz!(48_000), nz!(24_000), nz!(1)).collect();
        assert_eq!(out.len(), 50);
    }
}
