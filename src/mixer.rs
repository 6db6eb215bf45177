//! The per-callback block producer.
//!
//! Each device callback the [`Renderer`] walks the voice table,
//! copies every audible voice's next run of samples into a scratch
//! block, applies that voice's [`VolumeRamp`], sums the result into
//! the output and clamps. The mix mutex is only held while touching a
//! voice's state; the gain and summing work runs unlocked with
//! nothing but the scratch buffer, so the host can keep queueing
//! voices mid-callback.

use std::sync::Arc;

use crate::common::OutputFormat;
use crate::engine::EngineInner;
use crate::voice::{Voice, VoiceSource, VoiceState, VolumeRamp};

/// A sample type the mixer can copy, scale and sum.
pub(crate) trait MixSample: Copy + Default {
    const BYTES: usize;
    fn read(bytes: &[u8]) -> Self;
    fn scaled(self, gain: f32) -> Self;
}

impl MixSample for f32 {
    const BYTES: usize = 4;

    #[inline]
    fn read(bytes: &[u8]) -> f32 {
        f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline]
    fn scaled(self, gain: f32) -> f32 {
        self * gain
    }
}

impl MixSample for i16 {
    const BYTES: usize = 2;

    #[inline]
    fn read(bytes: &[u8]) -> i16 {
        i16::from_ne_bytes([bytes[0], bytes[1]])
    }

    #[inline]
    fn scaled(self, gain: f32) -> i16 {
        (self as f32 * gain) as i16
    }
}

/// How much one copy call moved: samples into the scratch block,
/// bytes out of the source.
struct CopyAmount {
    target: usize,
    src: usize,
}

/// Straight copy of interleaved stereo source bytes into the scratch
/// block.
fn copy_stereo<S: MixSample>(dst: &mut [S], src: &[u8]) -> CopyAmount {
    let n = dst.len().min(src.len() / S::BYTES);
    for (i, slot) in dst[..n].iter_mut().enumerate() {
        *slot = S::read(&src[i * S::BYTES..]);
    }
    CopyAmount {
        target: n,
        src: n * S::BYTES,
    }
}

/// Copies mono source bytes into the scratch block, emitting each
/// sample twice. Source and target advance at different rates.
fn copy_mono<S: MixSample>(dst: &mut [S], src: &[u8]) -> CopyAmount {
    let n = (dst.len() / 2).min(src.len() / S::BYTES);
    for i in 0..n {
        let v = S::read(&src[i * S::BYTES..]);
        dst[2 * i] = v;
        dst[2 * i + 1] = v;
    }
    CopyAmount {
        target: 2 * n,
        src: n * S::BYTES,
    }
}

/// Fills `scratch` from a static voice, rewinding and counting loops
/// on source exhaustion. Returns samples written.
fn copy_static<S: MixSample>(voice: &mut Voice, scratch: &mut [S]) -> usize {
    let VoiceSource::Static(pcm) = &voice.source else {
        return 0;
    };
    let pcm = pcm.clone();
    if pcm.is_empty() {
        voice.state = VoiceState::Finished;
        return 0;
    }
    let copy: fn(&mut [S], &[u8]) -> CopyAmount = if pcm.channels().get() == 1 {
        copy_mono
    } else {
        copy_stereo
    };

    let src_all = pcm.as_slice();
    let mut total = 0;
    loop {
        // Finished from the loop counter crossing zero
        if voice.is_finished() {
            break;
        }

        let src_left = src_all.len() - voice.buffer_pos;
        let amount = copy(&mut scratch[total..], &src_all[voice.buffer_pos..]);
        total += amount.target;

        if amount.src < src_left {
            voice.buffer_pos += amount.src;
            break;
        }
        // reached the end of the source
        voice.decrement_loop_count();
        voice.buffer_pos = 0;
    }

    total
}

/// Fills `scratch` from a streaming voice. On exhausting the primary
/// side a non-blocking swap is attempted; when the secondary is not
/// ready the voice emits only what it got and retries next callback,
/// and a decoder error finishes the voice.
fn copy_streaming<S: MixSample>(voice: &mut Voice, scratch: &mut [S]) -> usize {
    let VoiceSource::Streaming(stream) = &voice.source else {
        return 0;
    };
    let stream = Arc::clone(stream);
    let copy: fn(&mut [S], &[u8]) -> CopyAmount = if stream.channels().get() == 1 {
        copy_mono
    } else {
        copy_stereo
    };

    let mut total = 0;
    loop {
        // Finished from the loop counter or an error while advancing
        if voice.is_finished() {
            break;
        }

        let (amount, src_left, size, end_at_size) = {
            let p = stream.lock_primary();
            let size = p.data.len();
            let src_left = match p.end_pos {
                Some(e) if e > voice.buffer_pos => e - voice.buffer_pos,
                _ => size - voice.buffer_pos,
            };
            let window = &p.data[voice.buffer_pos..voice.buffer_pos + src_left];
            let amount = copy(&mut scratch[total..], window);
            (amount, src_left, size, p.end_pos == Some(size))
        };
        total += amount.target;

        if amount.src < src_left {
            // neither the stream's end nor the side's end was reached
            voice.buffer_pos += amount.src;
            break;
        }
        if voice.buffer_pos + amount.src == size {
            if end_at_size && amount.target > 0 {
                // the cursor can already sit at the side's end from a
                // failed swap last callback; only a real copy crosses
                // the stream's end
                voice.decrement_loop_count();
            }
            if !voice.stream_swap(false) {
                break;
            }
        } else {
            // the stream ends inside the side; jump the cursor past
            // the end marker and keep copying the wrapped data
            voice.buffer_pos += amount.src;
            voice.decrement_loop_count();
        }
    }

    total
}

pub(crate) fn copy_voice<S: MixSample>(voice: &mut Voice, scratch: &mut [S]) -> usize {
    match voice.source {
        VoiceSource::Static(_) => copy_static(voice, scratch),
        VoiceSource::Streaming(_) => copy_streaming(voice, scratch),
    }
}

#[inline]
fn apply_gain<S: MixSample>(samples: &mut [S], left: f32, right: f32) {
    for pair in samples.chunks_exact_mut(2) {
        pair[0] = pair[0].scaled(left);
        pair[1] = pair[1].scaled(right);
    }
}

/// Applies a piecewise-linear gain ramp over the block: `steps + 1`
/// equal sub-spans, the last absorbing the remainder.
pub(crate) fn apply_ramp<S: MixSample>(samples: &mut [S], ramp: &VolumeRamp) {
    // keep each span a whole number of stereo pairs
    let span = (samples.len() / 2) / (ramp.steps as usize + 1) * 2;
    let mut pos = 0;

    for i in 0..ramp.steps {
        let lfade = ramp.left_fade + i as f32 * ramp.left_step;
        let rfade = ramp.right_fade + i as f32 * ramp.right_step;
        apply_gain(
            &mut samples[pos..pos + span],
            ramp.left * lfade,
            ramp.right * rfade,
        );
        pos += span;
    }

    let lfade = ramp.left_fade + ramp.steps as f32 * ramp.left_step;
    let rfade = ramp.right_fade + ramp.steps as f32 * ramp.right_step;
    apply_gain(&mut samples[pos..], ramp.left * lfade, ramp.right * rfade);
}

fn mix_into_f32(target: &mut [f32], source: &[f32]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t += *s;
    }
}

fn mix_into_i32(target: &mut [i32], source: &[i16]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t += *s as i32;
    }
}

fn clamp_f32(buf: &mut [f32]) {
    for v in buf {
        *v = v.clamp(-1.0, 1.0);
    }
}

fn clamp_i16(target: &mut [i16], source: &[i32]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t = (*s).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// The callback-side half of an [`Engine`](crate::Engine).
///
/// Owns the scratch buffers so the mix callback never allocates.
/// Arbitrary output lengths are split into callback-period blocks, so
/// the ramp math always sees the block size the engine was configured
/// with.
pub struct Renderer {
    engine: Arc<EngineInner>,
    scratch_f32: Vec<f32>,
    scratch_i16: Vec<i16>,
    sum: Vec<i32>,
    block_samples: usize,
}

impl Renderer {
    pub(crate) fn new(engine: Arc<EngineInner>) -> Renderer {
        let block_samples = engine.samples_per_callback * 2;
        let (scratch_f32, scratch_i16, sum) = match engine.format {
            OutputFormat::F32 => (vec![0.0; block_samples], Vec::new(), Vec::new()),
            OutputFormat::I16 => (Vec::new(), vec![0; block_samples], vec![0; block_samples]),
        };
        Renderer {
            engine,
            scratch_f32,
            scratch_i16,
            sum,
            block_samples,
        }
    }

    /// Renders interleaved stereo float output. The engine must have
    /// been created with [`OutputFormat::F32`]; otherwise silence is
    /// produced.
    pub fn render_f32(&mut self, out: &mut [f32]) {
        if self.engine.format != OutputFormat::F32 {
            out.fill(0.0);
            return;
        }
        let engine = Arc::clone(&self.engine);
        let _callback = engine.callback_lock.lock().unwrap();
        let block = self.block_samples;
        for chunk in out.chunks_mut(block) {
            self.mix_block_f32(chunk);
        }
    }

    /// Renders interleaved stereo 16-bit output. The engine must have
    /// been created with [`OutputFormat::I16`]; otherwise silence is
    /// produced.
    pub fn render_i16(&mut self, out: &mut [i16]) {
        if self.engine.format != OutputFormat::I16 {
            out.fill(0);
            return;
        }
        let engine = Arc::clone(&self.engine);
        let _callback = engine.callback_lock.lock().unwrap();
        let block = self.block_samples;
        for chunk in out.chunks_mut(block) {
            self.mix_block_i16(chunk);
        }
    }

    fn mix_block_f32(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let engine = Arc::clone(&self.engine);

        let mut mix = engine.mix.lock().unwrap();
        // voices added while the lock is released below are deferred
        // to the next block
        let count = mix.registry.slot_count();
        for i in 0..count {
            let Some(voice) = mix.registry.voice_at(i) else {
                continue;
            };
            if !voice.is_audible() {
                continue;
            }

            let scratch = &mut self.scratch_f32[..out.len()];
            let copied = copy_voice(voice, scratch);
            let ramp = voice.volume_ramp(engine.secs_per_callback);
            drop(mix);

            apply_ramp(&mut scratch[..copied], &ramp);
            mix_into_f32(&mut out[..copied], &scratch[..copied]);

            mix = engine.mix.lock().unwrap();
        }
        drop(mix);

        clamp_f32(out);
    }

    fn mix_block_i16(&mut self, out: &mut [i16]) {
        let sum = &mut self.sum[..out.len()];
        sum.fill(0);
        let engine = Arc::clone(&self.engine);

        let mut mix = engine.mix.lock().unwrap();
        let count = mix.registry.slot_count();
        for i in 0..count {
            let Some(voice) = mix.registry.voice_at(i) else {
                continue;
            };
            if !voice.is_audible() {
                continue;
            }

            let scratch = &mut self.scratch_i16[..out.len()];
            let copied = copy_voice(voice, scratch);
            let ramp = voice.volume_ramp(engine.secs_per_callback);
            drop(mix);

            apply_ramp(&mut scratch[..copied], &ramp);
            mix_into_i32(&mut sum[..copied], &scratch[..copied]);

            mix = engine.mix.lock().unwrap();
        }
        drop(mix);

        clamp_i16(out, sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PcmBuffer;
    use crate::engine::PlayParams;
    use crate::math::nz;
    use crate::voice::VolumeRamp;

    fn static_voice(pcm: PcmBuffer, loops: i32) -> Voice {
        let params = PlayParams {
            loops,
            ..PlayParams::default()
        };
        Voice::new(VoiceSource::Static(pcm), &params, 0, 2048.0 / 44_100.0)
    }

    #[test]
    fn mono_samples_are_duplicated() {
        let pcm = PcmBuffer::from_f32_samples(&[0.1, 0.2, 0.3], nz!(1));
        let mut voice = static_voice(pcm, 0);
        let mut scratch = [0.0f32; 6];
        let copied = copy_voice(&mut voice, &mut scratch);
        assert_eq!(copied, 6);
        assert_eq!(scratch, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        assert!(voice.is_finished());
    }

    #[test]
    fn stereo_copy_is_lossless() {
        let data = [0.1, -0.2, 0.3, -0.4];
        let pcm = PcmBuffer::from_f32_samples(&data, nz!(2));
        let mut voice = static_voice(pcm, 0);
        let mut scratch = [0.0f32; 8];
        let copied = copy_voice(&mut voice, &mut scratch);
        assert_eq!(copied, 4);
        assert_eq!(&scratch[..4], &data);
    }

    #[test]
    fn looping_refills_the_block() {
        let pcm = PcmBuffer::from_f32_samples(&[1.0, 1.0], nz!(2));
        let mut voice = static_voice(pcm, 2);
        let mut scratch = [0.0f32; 4];
        let copied = copy_voice(&mut voice, &mut scratch);
        // one source pass is 2 samples; two passes fill the block
        assert_eq!(copied, 4);
        assert_eq!(voice.loop_count, 0);
        assert!(!voice.is_finished());

        // the third and final pass finishes the voice
        let copied = copy_voice(&mut voice, &mut scratch);
        assert_eq!(copied, 2);
        assert!(voice.is_finished());
    }

    #[test]
    fn partial_block_on_finish() {
        let pcm = PcmBuffer::from_f32_samples(&[0.5, 0.5], nz!(2));
        let mut voice = static_voice(pcm, 0);
        let mut scratch = [9.0f32; 8];
        let copied = copy_voice(&mut voice, &mut scratch);
        assert_eq!(copied, 2);
        assert!(voice.is_finished());
        // the mixer only sums `copied` samples; the rest is stale scratch
        assert_eq!(&scratch[..2], &[0.5, 0.5]);
    }

    #[test]
    fn flat_ramp_scales_uniformly() {
        let mut samples = [1.0f32; 8];
        let ramp = VolumeRamp {
            left: 0.5,
            right: 0.25,
            left_fade: 1.0,
            right_fade: 1.0,
            left_step: 0.0,
            right_step: 0.0,
            steps: 0,
        };
        apply_ramp(&mut samples, &ramp);
        assert_eq!(samples, [0.5, 0.25, 0.5, 0.25, 0.5, 0.25, 0.5, 0.25]);
    }

    #[test]
    fn stepped_ramp_descends_monotonically() {
        let mut samples = [1.0f32; 64];
        let ramp = VolumeRamp {
            left: 1.0,
            right: 1.0,
            left_fade: 1.0,
            right_fade: 1.0,
            left_step: -0.25,
            right_step: -0.25,
            steps: 3,
        };
        apply_ramp(&mut samples, &ramp);
        let left: Vec<f32> = samples.iter().step_by(2).copied().collect();
        assert!(left.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(left[0], 1.0);
        // last span carries fade 1.0 - 3 * 0.25
        assert_eq!(*left.last().unwrap(), 0.25);
    }

    #[test]
    fn i16_clamps_on_overflow() {
        let mut out = [0i16; 4];
        let sum = [40_000, -40_000, 100, -100];
        clamp_i16(&mut out, &sum);
        assert_eq!(out, [i16::MAX, i16::MIN, 100, -100]);
    }

    #[test]
    fn f32_clamps_to_unit_range() {
        let mut buf = [1.5f32, -1.5, 0.5, -0.5];
        clamp_f32(&mut buf);
        assert_eq!(buf, [1.0, -1.0, 0.5, -0.5]);
    }
}
