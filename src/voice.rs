//! One active playback occurrence and its gain math.
//!
//! A [`Voice`] couples a source (a whole [`PcmBuffer`] or a streamed
//! [`StreamBuffer`]) with a byte cursor, a loop counter and the state
//! machine driving pause, fade and finish transitions. All gain
//! changes, including pan and pause ramps, are expressed as a
//! [`VolumeRamp`] over one callback block so the applied gain is
//! continuous from block to block and never steps audibly.

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use crate::buffer::PcmBuffer;
use crate::engine::PlayParams;
use crate::registry::GroupId;
use crate::stream_buffer::{StreamBuffer, SwapOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoiceState {
    Playing,
    Pausing,
    Paused,
    Unpausing,
    Finished,
}

pub(crate) enum VoiceSource {
    Static(PcmBuffer),
    Streaming(Arc<StreamBuffer>),
}

/// Piecewise-linear gain over one callback block.
///
/// The block is split into `steps + 1` equal sub-spans (the last one
/// absorbs the remainder); samples of sub-span `k` are scaled by
/// `left * (left_fade + k * left_step)` and the right-channel
/// analogue. Steps are sized so no sub-span moves the gain by more
/// than about 2%, capped at 50.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VolumeRamp {
    pub left: f32,
    pub right: f32,
    pub left_fade: f32,
    pub right_fade: f32,
    pub left_step: f32,
    pub right_step: f32,
    pub steps: u32,
}

const FADE_STEP: f32 = 0.02;
const MAX_STEPS: u32 = 50;

pub(crate) struct Voice {
    pub(crate) source: VoiceSource,
    /// Byte cursor into the currently presented source block.
    pub(crate) buffer_pos: usize,
    /// -1 loops forever, 0 plays once, n loops n more times.
    pub(crate) loop_count: i32,
    pub(crate) state: VoiceState,
    pub(crate) group: Option<GroupId>,

    // user-set parameters, written by channel ops and facade setters
    pub(crate) volume: f32,
    pub(crate) x: f32,
    pub(crate) y: f32,
    pub(crate) max_distance: f32,

    // snapshots taken at creation and refreshed each update tick;
    // the mix callback reads only these
    pub(crate) mix_volume: f32,
    pub(crate) rel_x: f32,
    pub(crate) rel_y: f32,

    // last applied per-channel gain (volume * group * master * pan)
    pub(crate) lvolume: f32,
    pub(crate) rvolume: f32,

    /// Fade length in seconds; negative while fading out, zero when
    /// not fading.
    pub(crate) fade_total: f32,
    /// Elapsed time for a fade-in, time left for a fade-out.
    pub(crate) fade_time: f32,
}

impl Voice {
    pub(crate) fn new(
        source: VoiceSource,
        params: &PlayParams,
        buffer_pos: usize,
        secs_per_callback: f64,
    ) -> Voice {
        let mut voice = Voice {
            source,
            buffer_pos,
            loop_count: params.loops,
            state: if params.paused {
                VoiceState::Paused
            } else {
                VoiceState::Playing
            },
            group: params.group,
            volume: params.volume,
            x: params.x,
            y: params.y,
            max_distance: params.max_distance,
            mix_volume: params.volume,
            rel_x: 0.0,
            rel_y: 0.0,
            lvolume: params.volume,
            rvolume: params.volume,
            fade_total: 0.0,
            fade_time: 0.0,
        };
        if params.fade_secs > 0.0 {
            voice.set_fade_in(params.fade_secs, secs_per_callback);
        }
        voice
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.state == VoiceState::Playing
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == VoiceState::Finished
    }

    pub(crate) fn is_pause_changing(&self) -> bool {
        matches!(self.state, VoiceState::Pausing | VoiceState::Unpausing)
    }

    /// True when the mixer should produce samples for this voice.
    pub(crate) fn is_audible(&self) -> bool {
        self.is_playing() || self.is_pause_changing()
    }

    fn is_fading(&self) -> bool {
        self.fade_total != 0.0
    }

    fn is_fading_in(&self) -> bool {
        self.fade_total > 0.0
    }

    fn is_fading_out(&self) -> bool {
        self.fade_total < 0.0
    }

    pub(crate) fn set_fade_in(&mut self, fade: f32, secs_per_callback: f64) {
        if fade as f64 > secs_per_callback {
            self.fade_total = fade;
        } else {
            self.fade_total = secs_per_callback as f32;
        }
        self.fade_time = 0.0;
    }

    /// `fade_total` goes negative for a fade-out; anything shorter
    /// than one callback period (including `stop`'s negative
    /// sentinel) becomes a single-callback ramp.
    pub(crate) fn set_fade_out(&mut self, fade: f32, secs_per_callback: f64) {
        if fade as f64 > secs_per_callback {
            self.fade_total = -fade;
            self.fade_time = fade;
        } else {
            self.fade_total = -(secs_per_callback as f32);
            self.fade_time = secs_per_callback as f32;
        }
    }

    fn unset_fade(&mut self) {
        self.fade_total = 0.0;
        self.fade_time = 0.0;
    }

    pub(crate) fn pause(&mut self) {
        match self.state {
            VoiceState::Playing => self.state = VoiceState::Pausing,
            VoiceState::Unpausing => self.state = VoiceState::Paused,
            _ => {}
        }
    }

    pub(crate) fn unpause(&mut self) {
        match self.state {
            VoiceState::Paused => self.state = VoiceState::Unpausing,
            VoiceState::Pausing => self.state = VoiceState::Playing,
            _ => {}
        }
    }

    pub(crate) fn decrement_loop_count(&mut self) {
        if self.loop_count == 0 {
            self.state = VoiceState::Finished;
        } else if self.loop_count > 0 {
            self.loop_count -= 1;
        }
    }

    /// Refreshes the mix-side snapshot from the user parameters and
    /// the engine-wide volumes. Called under the mix mutex at
    /// creation and on every update tick; the mix callback itself
    /// never reads the group table or listener.
    pub(crate) fn refresh(&mut self, master_volume: f32, groups: &[f32], listener: (f32, f32)) {
        let mut v = self.volume * master_volume;
        if let Some(GroupId(idx)) = self.group {
            if let Some(group_volume) = groups.get(idx) {
                v *= group_volume;
            }
        }
        self.mix_volume = v;

        if self.max_distance > 0.0 {
            self.rel_x = (self.x - listener.0) / self.max_distance;
            self.rel_y = (self.y - listener.1) / self.max_distance;
        } else {
            self.rel_x = 0.0;
            self.rel_y = 0.0;
        }
    }

    /// Derives the gain ramp for the next block and advances the fade
    /// and pause state machines by one callback period.
    pub(crate) fn volume_ramp(&mut self, secs_per_callback: f64) -> VolumeRamp {
        let (pan_left, pan_right) = position_fade(self.rel_x, self.rel_y);
        let new_lvol = self.mix_volume * pan_left;
        let new_rvol = self.mix_volume * pan_right;
        let volume_changing = self.lvolume != new_lvol || self.rvolume != new_rvol;

        if !(self.is_fading() || self.is_pause_changing() || volume_changing) {
            return VolumeRamp {
                left: self.lvolume,
                right: self.rvolume,
                left_fade: 1.0,
                right_fade: 1.0,
                left_step: 0.0,
                right_step: 0.0,
                steps: 0,
            };
        }

        let mut start_fade = 1.0f32;
        let mut end_fade = 1.0f32;
        let mut adjust_fade_time = false;

        if self.is_fading_in() {
            start_fade = self.fade_time / self.fade_total;
            end_fade = (self.fade_time + secs_per_callback as f32) / self.fade_total;
            adjust_fade_time = true;
        } else if self.is_fading_out() {
            start_fade = self.fade_time / -self.fade_total;
            end_fade = (self.fade_time - secs_per_callback as f32) / -self.fade_total;
            adjust_fade_time = true;
        }

        let (mut start_lfade, mut start_rfade) = (start_fade, start_fade);
        let (mut end_lfade, mut end_rfade) = (end_fade, end_fade);

        // ramp from the previously played per-channel gain
        let mut left = self.lvolume;
        let mut right = self.rvolume;
        if volume_changing {
            // previous volume of 0 would divide out the whole ramp
            if left == 0.0 {
                left = 0.01;
            }
            if right == 0.0 {
                right = 0.01;
            }
            end_lfade *= new_lvol / left;
            end_rfade *= new_rvol / right;
            self.lvolume = new_lvol;
            self.rvolume = new_rvol;
        }

        match self.state {
            VoiceState::Pausing => {
                end_lfade = 0.0;
                end_rfade = 0.0;
                adjust_fade_time = false;
                self.state = VoiceState::Paused;
            }
            VoiceState::Unpausing => {
                start_lfade = 0.0;
                start_rfade = 0.0;
                adjust_fade_time = false;
                self.state = VoiceState::Playing;
            }
            _ => {}
        }

        let left_delta = end_lfade - start_lfade;
        let right_delta = end_rfade - start_rfade;
        let max_delta = left_delta.max(right_delta);
        let mut steps = (max_delta / FADE_STEP).abs() as u32;
        if steps > MAX_STEPS {
            steps = MAX_STEPS;
        }

        if adjust_fade_time {
            if self.is_fading_out() {
                self.fade_time -= secs_per_callback as f32;
                if self.fade_time <= 0.0 {
                    self.state = VoiceState::Finished;
                    self.unset_fade();
                }
            } else {
                self.fade_time += secs_per_callback as f32;
                if self.fade_time >= self.fade_total {
                    self.unset_fade();
                }
            }
        }

        VolumeRamp {
            left,
            right,
            left_fade: start_lfade,
            right_fade: start_rfade,
            left_step: left_delta / (steps + 1) as f32,
            right_step: right_delta / (steps + 1) as f32,
            steps,
        }
    }

    /// Tries to present the next stream side to this voice. Returns
    /// true when the cursor is on fresh data; on `Error` the voice is
    /// finished, and while the secondary is not ready the cursor
    /// parks at the side's end so the next callback retries.
    pub(crate) fn stream_swap(&mut self, blocking: bool) -> bool {
        let VoiceSource::Streaming(stream) = &self.source else {
            return false;
        };
        let stream = Arc::clone(stream);
        let outcome = if blocking {
            stream.swap_blocking()
        } else {
            stream.swap()
        };
        match outcome {
            SwapOutcome::Ready => {
                // EOF on the very first byte of the new side counts
                // as crossing the stream's end
                if stream.lock_primary().end_pos == Some(0) {
                    self.decrement_loop_count();
                }
                self.buffer_pos = 0;
                StreamBuffer::read_more_detached(&stream);
                true
            }
            SwapOutcome::Error => {
                self.state = VoiceState::Finished;
                false
            }
            _ => {
                self.buffer_pos = stream.size();
                false
            }
        }
    }
}

/// Stereo gain split from a position relative to the listener,
/// normalized by the source's max distance.
///
/// At distance 1 or beyond both channels are silent. Inside that,
/// both channels share a base attenuation of `(1 - d) / (1 + m)` with
/// `m = 0.3`, and the angle skews left against right by up to `±m`,
/// peaking on the x-axis and vanishing on the y-axis.
pub(crate) fn position_fade(rel_x: f32, rel_y: f32) -> (f32, f32) {
    if rel_x == 0.0 && rel_y == 0.0 {
        return (1.0, 1.0);
    }

    let distance = (rel_x * rel_x + rel_y * rel_y).sqrt();
    if distance >= 1.0 {
        return (0.0, 0.0);
    }

    // Left and right vary between 1.0 and (1-m)/(1+m), and sit at
    // 1/(1+m) directly in front of or behind the listener. With
    // m = 0.3 that is 1.0 to 0.54, and 0.77 front and back.
    const MAX_MOD: f32 = 0.3;
    let base = 1.0 / (1.0 + MAX_MOD) * (1.0 - distance);
    let mut left = base;
    let mut right = base;

    if rel_x != 0.0 {
        let rads = (rel_y / rel_x).atan();
        let (left_mod, right_mod) = if rel_y >= 0.0 {
            if rel_x > 0.0 {
                // quadrant 1
                let m = MAX_MOD - rads / FRAC_PI_2 * MAX_MOD;
                (1.0 - m, 1.0 + m)
            } else {
                // quadrant 2
                let m = MAX_MOD + rads / FRAC_PI_2 * MAX_MOD;
                (1.0 + m, 1.0 - m)
            }
        } else if rel_x < 0.0 {
            // quadrant 3
            let m = MAX_MOD - rads / FRAC_PI_2 * MAX_MOD;
            (1.0 + m, 1.0 - m)
        } else {
            // quadrant 4
            let m = MAX_MOD + rads / FRAC_PI_2 * MAX_MOD;
            (1.0 - m, 1.0 + m)
        };
        left *= left_mod;
        right *= right_mod;
    }

    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PlayParams;
    use crate::math::nz;
    use approx::assert_relative_eq;

    const CALLBACK: f64 = 2048.0 / 44_100.0;

    fn test_voice() -> Voice {
        let pcm = PcmBuffer::from_f32_samples(&[0.0; 64], nz!(2));
        Voice::new(
            VoiceSource::Static(pcm),
            &PlayParams::default(),
            0,
            CALLBACK,
        )
    }

    #[test]
    fn pan_is_symmetric_on_axis() {
        assert_eq!(position_fade(0.0, 0.0), (1.0, 1.0));
        let (l, r) = position_fade(0.0, 0.5);
        assert_relative_eq!(l, r);
    }

    #[test]
    fn pan_silences_beyond_unit_distance() {
        assert_eq!(position_fade(1.0, 0.0), (0.0, 0.0));
        assert_eq!(position_fade(0.8, 0.8), (0.0, 0.0));
    }

    #[test]
    fn pan_skews_toward_source_side() {
        let (l, r) = position_fade(-0.5, 0.0);
        assert!(l > r);
        let (l, r) = position_fade(0.5, 0.0);
        assert!(r > l);
    }

    #[test]
    fn steady_voice_has_flat_ramp() {
        let mut v = test_voice();
        let ramp = v.volume_ramp(CALLBACK);
        assert_eq!(ramp.steps, 0);
        assert_eq!(ramp.left_fade, 1.0);
        assert_eq!(ramp.left_step, 0.0);
        assert_eq!(ramp.left, 1.0);
    }

    #[test]
    fn ramp_is_continuous_across_blocks() {
        let mut v = test_voice();
        v.volume = 0.4;
        v.refresh(1.0, &[], (0.0, 0.0));

        let ramp = v.volume_ramp(CALLBACK);
        let end_gain = ramp.left * (ramp.left_fade + (ramp.steps + 1) as f32 * ramp.left_step);
        let next = v.volume_ramp(CALLBACK);
        let start_gain = next.left * next.left_fade;
        assert_relative_eq!(end_gain, start_gain, max_relative = 1e-5);
        assert_relative_eq!(start_gain, 0.4, max_relative = 1e-5);
    }

    #[test]
    fn fade_out_finishes_after_total() {
        let mut v = test_voice();
        v.set_fade_out(-1.0, CALLBACK);
        assert!(v.is_fading_out());
        let ramp = v.volume_ramp(CALLBACK);
        assert_eq!(ramp.left_fade, 1.0);
        let end = ramp.left_fade + (ramp.steps + 1) as f32 * ramp.left_step;
        assert_relative_eq!(end, 0.0, epsilon = 1e-6);
        assert!(v.is_finished());
    }

    #[test]
    fn fade_in_progresses_and_clears() {
        let mut v = test_voice();
        v.set_fade_in(2.0 * CALLBACK as f32, CALLBACK);
        let ramp = v.volume_ramp(CALLBACK);
        assert_eq!(ramp.left_fade, 0.0);
        let ramp = v.volume_ramp(CALLBACK);
        assert_relative_eq!(ramp.left_fade, 0.5, max_relative = 1e-5);
        let _ = v.volume_ramp(CALLBACK);
        assert_eq!(v.fade_total, 0.0);
        assert!(v.is_playing());
    }

    #[test]
    fn pause_ramps_down_then_parks() {
        let mut v = test_voice();
        v.pause();
        assert_eq!(v.state, VoiceState::Pausing);
        let ramp = v.volume_ramp(CALLBACK);
        let end = ramp.left_fade + (ramp.steps + 1) as f32 * ramp.left_step;
        assert_relative_eq!(end, 0.0, epsilon = 1e-6);
        assert_eq!(v.state, VoiceState::Paused);

        v.unpause();
        assert_eq!(v.state, VoiceState::Unpausing);
        let ramp = v.volume_ramp(CALLBACK);
        assert_eq!(ramp.left_fade, 0.0);
        assert_eq!(v.state, VoiceState::Playing);
    }

    #[test]
    fn pause_is_idempotent() {
        let mut v = test_voice();
        v.pause();
        let _ = v.volume_ramp(CALLBACK);
        v.pause();
        assert_eq!(v.state, VoiceState::Paused);
        v.unpause();
        v.unpause();
        assert_eq!(v.state, VoiceState::Unpausing);
    }

    #[test]
    fn loop_count_reaches_finish() {
        let mut v = test_voice();
        v.loop_count = 1;
        v.decrement_loop_count();
        assert_eq!(v.loop_count, 0);
        assert!(!v.is_finished());
        v.decrement_loop_count();
        assert!(v.is_finished());
    }

    #[test]
    fn infinite_loop_never_finishes() {
        let mut v = test_voice();
        v.loop_count = -1;
        for _ in 0..100 {
            v.decrement_loop_count();
        }
        assert!(!v.is_finished());
    }

    #[test]
    fn group_and_master_scale_snapshot() {
        let mut v = test_voice();
        v.group = Some(GroupId(0));
        v.refresh(0.5, &[0.5], (0.0, 0.0));
        assert_relative_eq!(v.mix_volume, 0.25);
    }
}
