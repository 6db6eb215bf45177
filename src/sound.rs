//! User-facing handle to a fully decoded sound.
//!
//! A [`Sound`] owns a [`PcmBuffer`] plus the default playback
//! parameters future plays start with. It holds at most one live
//! [`Channel`]; starting it again retires the previous voice with the
//! minimum fade-out, and the parameter setters write through to the
//! live voice so a moving sound keeps panning while it plays.

use crate::buffer::PcmBuffer;
use crate::engine::{Engine, PlayParams};
use crate::registry::{Channel, GroupId};

pub struct Sound {
    engine: Engine,
    pcm: PcmBuffer,
    volume: f32,
    x: f32,
    y: f32,
    max_distance: f32,
    group: Option<GroupId>,
    channel: Channel,
}

impl Sound {
    pub(crate) fn new(engine: Engine, pcm: PcmBuffer) -> Sound {
        Sound {
            engine,
            pcm,
            volume: 1.0,
            x: 0.0,
            y: 0.0,
            max_distance: 0.0,
            group: None,
            channel: Channel::UNSET,
        }
    }

    /// The decoded data. Cloning the buffer shares it.
    pub fn pcm(&self) -> &PcmBuffer {
        &self.pcm
    }

    /// The channel of the most recent play. May be stale.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.engine.set_volume(self.channel, volume);
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.x = x;
        self.y = y;
        self.engine.set_position(self.channel, x, y);
    }

    pub fn move_by(&mut self, dx: f32, dy: f32) {
        self.set_position(self.x + dx, self.y + dy);
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    /// Distance at which this sound becomes inaudible; zero disables
    /// positional panning.
    pub fn set_max_distance(&mut self, distance: f32) {
        self.max_distance = distance;
        self.engine.set_max_distance(self.channel, distance);
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn set_group(&mut self, group: Option<GroupId>) {
        self.group = group;
        self.engine.set_group(self.channel, group);
    }

    /// Plays from the start. `loops` of -1 repeats forever.
    pub fn play(&mut self, loops: i32) -> Channel {
        self.start(0.0, loops, 0.0, false)
    }

    /// Plays from `sec` seconds in.
    pub fn play_at(&mut self, sec: f64, loops: i32) -> Channel {
        self.start(sec, loops, 0.0, false)
    }

    /// Plays with a fade-in of `fade_secs`.
    pub fn fade_in(&mut self, fade_secs: f32, loops: i32) -> Channel {
        self.start(0.0, loops, fade_secs, false)
    }

    /// Plays from `sec` seconds in with a fade-in.
    pub fn fade_in_at(&mut self, sec: f64, fade_secs: f32, loops: i32) -> Channel {
        self.start(sec, loops, fade_secs, false)
    }

    /// Full-control play; fields not present on the sound
    /// (`start_sec`, `loops`, `fade_secs`, `paused`) come from
    /// `params`, the rest from this sound's defaults.
    pub fn play_with(&mut self, params: &PlayParams) -> Channel {
        self.start(params.start_sec, params.loops, params.fade_secs, params.paused)
    }

    fn start(&mut self, start_sec: f64, loops: i32, fade_secs: f32, paused: bool) -> Channel {
        let params = PlayParams {
            start_sec,
            loops,
            volume: self.volume,
            fade_secs,
            x: self.x,
            y: self.y,
            max_distance: self.max_distance,
            group: self.group,
            paused,
        };
        self.channel = self.engine.play_sound(&self.pcm, self.channel, &params);
        self.channel
    }

    /// Stops immediately.
    pub fn halt(&mut self) {
        self.engine.halt(self.channel);
    }

    /// Stops with the minimum fade-out.
    pub fn stop(&mut self) {
        self.engine.stop(self.channel);
    }

    pub fn fade_out(&mut self, fade_secs: f32) {
        self.engine.fade_out(self.channel, fade_secs);
    }

    /// Gives up control of the playing voice without stopping it: the
    /// voice plays out in the mixer on its own, and this handle (or
    /// dropping it) no longer affects it. A paused voice is unpaused
    /// first, since nothing could ever resume it afterwards.
    pub fn detach(&mut self) {
        self.engine.unpause(self.channel);
        self.channel = Channel::UNSET;
    }

    pub fn pause(&mut self) {
        self.engine.pause(self.channel);
    }

    pub fn unpause(&mut self) {
        self.engine.unpause(self.channel);
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing(self.channel)
    }

    pub fn is_paused(&self) -> bool {
        self.engine.is_paused(self.channel)
    }

    pub fn set_loop_count(&mut self, loops: i32) {
        self.engine.set_loop_count(self.channel, loops);
    }
}

impl Drop for Sound {
    fn drop(&mut self) {
        // voices keep their own buffer reference, so a playing voice
        // outlives the handle; fade it out instead of cutting
        self.engine.stop(self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::math::nz;

    fn sound() -> Sound {
        let engine = Engine::new(EngineSettings::default());
        let pcm = PcmBuffer::from_f32_samples(&[0.25f32; 256], nz!(2));
        engine.sound_from_pcm(pcm)
    }

    #[test]
    fn setters_apply_before_and_during_playback() {
        let mut s = sound();
        s.set_volume(0.5);
        s.set_position(1.0, 2.0);
        s.set_max_distance(10.0);
        assert_eq!(s.volume(), 0.5);

        let c = s.play(0);
        assert!(s.is_playing());
        // defaults were carried into the voice
        let engine = s.engine.clone();
        assert_eq!(engine.volume(c), 0.5);
        assert_eq!(engine.position(c), (1.0, 2.0));
        assert_eq!(engine.max_distance(c), 10.0);

        // live write-through
        s.set_volume(0.7);
        assert_eq!(engine.volume(c), 0.7);
    }

    #[test]
    fn replay_swaps_channels() {
        let mut s = sound();
        let first = s.play(0);
        let second = s.play(0);
        assert_ne!(first, second);
        assert_eq!(s.channel(), second);
        assert_eq!(s.engine.number_playing(), 2);
    }

    #[test]
    fn pause_round_trip() {
        let mut s = sound();
        s.play(0);
        s.pause();
        assert!(s.is_paused());
        assert!(!s.is_playing());
        s.unpause();
        assert!(s.is_playing());
    }

    #[test]
    fn detach_leaves_the_voice_playing() {
        let mut s = sound();
        let engine = s.engine.clone();
        let c = s.play(0);
        s.detach();
        assert_eq!(s.channel(), Channel::UNSET);
        assert!(!s.is_playing());
        // the voice itself is untouched
        assert!(engine.is_playing(c));

        // ops on the detached handle are no-ops for the old voice
        s.halt();
        s.stop();
        assert!(engine.is_playing(c));

        // fire and forget: each play starts a fresh voice, none are
        // retired by the next
        let second = s.play(0);
        s.detach();
        let third = s.play(0);
        s.detach();
        assert!(engine.is_playing(c));
        assert!(engine.is_playing(second));
        assert!(engine.is_playing(third));
        assert_eq!(engine.number_playing(), 3);
    }

    #[test]
    fn detach_unpauses_first() {
        let mut s = sound();
        let engine = s.engine.clone();
        let c = s.play(0);
        s.pause();
        s.detach();
        // a detached voice could never be resumed, so it comes back
        // on its way out
        assert!(engine.is_playing(c));
        drop(s);
        assert!(engine.is_playing(c));
    }
}
