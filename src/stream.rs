//! User-facing handle to a streamed music or ambience track.
//!
//! A [`Stream`] wraps a shared [`StreamBuffer`] plus default playback
//! parameters, mirroring [`Sound`](crate::Sound). The important
//! difference: a stream buffer can only feed one voice, so starting a
//! stream that is already playing halts the previous voice instead of
//! fading it.

use std::sync::Arc;

use crate::engine::{Engine, PlayParams};
use crate::registry::{Channel, GroupId};
use crate::stream_buffer::StreamBuffer;

pub struct Stream {
    engine: Engine,
    buffer: Arc<StreamBuffer>,
    volume: f32,
    x: f32,
    y: f32,
    max_distance: f32,
    group: Option<GroupId>,
    channel: Channel,
}

impl Stream {
    pub(crate) fn new(engine: Engine, buffer: Arc<StreamBuffer>) -> Stream {
        Stream {
            engine,
            buffer,
            volume: 1.0,
            x: 0.0,
            y: 0.0,
            max_distance: 0.0,
            group: None,
            channel: Channel::UNSET,
        }
    }

    /// The shared double buffer backing this stream.
    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    /// Total duration in seconds.
    pub fn total_time(&self) -> f64 {
        self.buffer.total_time()
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

    /// Plays from the stream's buffered position.
    pub fn play(&mut self, loops: i32) -> Channel {
        self.start(0.0, loops, 0.0, false)
    }

    /// Plays from `sec`. Blocks only when `sec` is not already inside
    /// the buffer.
    pub fn play_at(&mut self, sec: f64, loops: i32) -> Channel {
        self.start(sec, loops, 0.0, false)
    }

    pub fn fade_in(&mut self, fade_secs: f32, loops: i32) -> Channel {
        self.start(0.0, loops, fade_secs, false)
    }

    pub fn fade_in_at(&mut self, sec: f64, fade_secs: f32, loops: i32) -> Channel {
        self.start(sec, loops, fade_secs, false)
    }

    /// Full-control play, as [`Sound::play_with`](crate::Sound::play_with).
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
        self.channel = self.engine.play_stream(&self.buffer, self.channel, &params);
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
    /// voice plays out in the mixer on its own (it holds its own
    /// reference to the stream buffer), and this handle no longer
    /// affects it. A paused voice is unpaused first, since nothing
    /// could ever resume it afterwards.
    ///
    /// Do not start this stream again before the detached voice has
    /// finished: a stream buffer can only feed one voice, and a
    /// detached voice can no longer be retired by `play`.
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

impl Drop for Stream {
    fn drop(&mut self) {
        // the buffer must not be swapped under a live voice once the
        // handle is gone
        self.engine.halt(self.channel);
    }
}
