//! The mixer engine: lifecycle, the update tick and the
//! channel-handle control surface.
//!
//! An [`Engine`] is a cheaply cloneable handle to one mixer instance.
//! The host creates it with the output configuration, pulls a
//! [`Renderer`] for the device callback (or opens a device via the
//! `playback` feature), and drives [`Engine::update`] once per frame
//! to reap finished voices and publish parameter changes to the mix
//! thread.
//!
//! Lock order, never violated: callback lock → mix mutex → stream
//! secondary → stream primary. The callback lock is the equivalent of
//! the audio backend's device lock: the renderer holds it for a whole
//! callback, and `update` and the play paths take it first, which is
//! what guarantees a voice added mid-callback is deferred to the next
//! one.

use std::num::NonZero;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::buffer::PcmBuffer;
use crate::common::{ChannelCount, OutputFormat, SampleRate};
use crate::decoder::{self, DecoderError, OutputSpec};
use crate::math::nz;
use crate::mixer::Renderer;
use crate::registry::{Channel, GroupId, Registry};
use crate::sound::Sound;
use crate::stream::Stream;
use crate::stream_buffer::StreamBuffer;
use crate::voice::{Voice, VoiceSource, VoiceState};

/// Output configuration for a new [`Engine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Output sample rate in Hz.
    pub sample_rate: SampleRate,
    /// Stereo samples produced per device callback. Together with the
    /// sample rate this sets the callback period, the unit all fade
    /// and ramp math works in.
    pub samples_per_callback: NonZero<u32>,
    /// Sample format of the output and of all decoded data.
    pub format: OutputFormat,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sample_rate: nz!(44_100),
            samples_per_callback: nz!(2048),
            format: OutputFormat::F32,
        }
    }
}

/// Options for starting one playback occurrence.
///
/// The unset channel plus `PlayParams::default()` plays a sound once
/// from the start at full volume with no fade and no panning.
#[derive(Debug, Clone, Copy)]
pub struct PlayParams {
    /// Start offset in seconds; out-of-range offsets play from 0.
    pub start_sec: f64,
    /// -1 loops forever, 0 plays once, n loops n more times.
    pub loops: i32,
    /// Pre-pan, pre-group volume scalar.
    pub volume: f32,
    /// Fade-in length in seconds; zero or negative means none.
    pub fade_secs: f32,
    /// World position, only meaningful with a positive max distance.
    pub x: f32,
    pub y: f32,
    /// Distance at which the sound is inaudible; zero disables
    /// positional panning entirely.
    pub max_distance: f32,
    /// Mixer group, or None for ungrouped.
    pub group: Option<GroupId>,
    /// Start in the paused state.
    pub paused: bool,
}

impl Default for PlayParams {
    fn default() -> Self {
        PlayParams {
            start_sec: 0.0,
            loops: 0,
            volume: 1.0,
            fade_secs: 0.0,
            x: 0.0,
            y: 0.0,
            max_distance: 0.0,
            group: None,
            paused: false,
        }
    }
}

pub(crate) struct MixState {
    pub(crate) registry: Registry,
    pub(crate) groups: Vec<f32>,
    pub(crate) listener: (f32, f32),
    pub(crate) master_volume: f32,
}

pub(crate) struct EngineInner {
    pub(crate) sample_rate: SampleRate,
    pub(crate) samples_per_callback: usize,
    pub(crate) format: OutputFormat,
    pub(crate) secs_per_callback: f64,
    /// Device-lock equivalent; held across a whole render.
    pub(crate) callback_lock: Mutex<()>,
    pub(crate) mix: Mutex<MixState>,
}

/// Handle to a mixer instance. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates a new engine with the given output configuration.
    pub fn new(settings: EngineSettings) -> Engine {
        let samples_per_callback = settings.samples_per_callback.get() as usize;
        Engine {
            inner: Arc::new(EngineInner {
                sample_rate: settings.sample_rate,
                samples_per_callback,
                format: settings.format,
                secs_per_callback: samples_per_callback as f64
                    / settings.sample_rate.get() as f64,
                callback_lock: Mutex::new(()),
                mix: Mutex::new(MixState {
                    registry: Registry::new(),
                    groups: Vec::new(),
                    listener: (0.0, 0.0),
                    master_volume: 1.0,
                }),
            }),
        }
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.inner.sample_rate
    }

    pub fn format(&self) -> OutputFormat {
        self.inner.format
    }

    /// Output channel count; the mixer always produces stereo.
    pub fn channels(&self) -> ChannelCount {
        nz!(2)
    }

    pub fn samples_per_callback(&self) -> usize {
        self.inner.samples_per_callback
    }

    /// Seconds of audio produced per device callback.
    pub fn secs_per_callback(&self) -> f64 {
        self.inner.secs_per_callback
    }

    /// The configuration decoders must produce data in.
    pub fn output_spec(&self) -> OutputSpec {
        OutputSpec {
            sample_rate: self.inner.sample_rate,
            format: self.inner.format,
        }
    }

    /// Creates the callback-side renderer. Feed its output straight
    /// to the audio device; multiple renderers are possible but
    /// pointless.
    pub fn renderer(&self) -> Renderer {
        Renderer::new(Arc::clone(&self.inner))
    }

    //
    // Engine-wide state
    //

    pub fn master_volume(&self) -> f32 {
        self.inner.mix.lock().unwrap().master_volume
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.inner.mix.lock().unwrap().master_volume = volume;
    }

    pub fn listener(&self) -> (f32, f32) {
        self.inner.mix.lock().unwrap().listener
    }

    pub fn set_listener(&self, x: f32, y: f32) {
        self.inner.mix.lock().unwrap().listener = (x, y);
    }

    /// Creates a new mixer group at full volume. Group ids stay valid
    /// until shutdown.
    pub fn create_group(&self) -> GroupId {
        let mut mix = self.inner.mix.lock().unwrap();
        mix.groups.push(1.0);
        GroupId(mix.groups.len() - 1)
    }

    pub fn set_group_volume(&self, group: GroupId, volume: f32) {
        let mut mix = self.inner.mix.lock().unwrap();
        if let Some(v) = mix.groups.get_mut(group.0) {
            *v = volume;
        }
    }

    pub fn group_volume(&self, group: GroupId) -> f32 {
        let mix = self.inner.mix.lock().unwrap();
        mix.groups.get(group.0).copied().unwrap_or(1.0)
    }

    /// Number of live voices. May include finished voices that the
    /// next [`update`](Engine::update) will reap.
    pub fn number_playing(&self) -> usize {
        self.inner.mix.lock().unwrap().registry.playing()
    }

    //
    // Loading
    //

    /// Decodes a whole file into memory and wraps it in a [`Sound`].
    pub fn load_sound(&self, path: impl AsRef<Path>) -> Result<Sound, DecoderError> {
        let pcm = decoder::decode_whole(path.as_ref(), self.output_spec())?;
        Ok(Sound::new(self.clone(), pcm))
    }

    /// Wraps host-generated PCM in a [`Sound`].
    pub fn sound_from_pcm(&self, pcm: PcmBuffer) -> Sound {
        Sound::new(self.clone(), pcm)
    }

    /// Opens a file for streamed playback. The first half second is
    /// decoded synchronously; a detached task primes the second
    /// buffer so playback can start without touching the disk.
    pub fn load_stream(&self, path: impl AsRef<Path>) -> Result<Stream, DecoderError> {
        self.load_stream_at(path, 0.0)
    }

    /// Like [`load_stream`](Engine::load_stream), but the buffer is
    /// positioned at `start_sec` so a later `play` from there is
    /// immediate.
    pub fn load_stream_at(
        &self,
        path: impl AsRef<Path>,
        start_sec: f64,
    ) -> Result<Stream, DecoderError> {
        let source = decoder::open_stream(path.as_ref(), self.output_spec(), start_sec)?;
        let buffer = Arc::new(StreamBuffer::open(source, self.output_spec(), start_sec)?);
        StreamBuffer::read_more_detached(&buffer);
        Ok(Stream::new(self.clone(), buffer))
    }

    //
    // Starting playback
    //

    /// Starts a voice over an in-memory buffer. A set `prior`
    /// channel is retired first with the minimum fade-out. The voice
    /// is mixed from the first callback that begins after this call
    /// returns.
    pub fn play_sound(&self, pcm: &PcmBuffer, prior: Channel, params: &PlayParams) -> Channel {
        let inner = &*self.inner;
        let _callback = inner.callback_lock.lock().unwrap();
        let mut mix = inner.mix.lock().unwrap();

        if prior.is_set() {
            if let Some(voice) = mix.registry.get_mut(prior) {
                if !voice.is_finished() {
                    voice.set_fade_out(-1.0, inner.secs_per_callback);
                }
            }
        }

        let block = pcm.sample_block_bytes();
        let sample_pos = (params.start_sec * inner.sample_rate.get() as f64) as i64;
        let mut byte_pos = sample_pos.saturating_mul(block as i64);
        if byte_pos < 0 || byte_pos >= pcm.len() as i64 {
            byte_pos = 0;
        }

        let mut voice = Voice::new(
            VoiceSource::Static(pcm.clone()),
            params,
            byte_pos as usize,
            inner.secs_per_callback,
        );
        let MixState {
            registry,
            groups,
            listener,
            master_volume,
        } = &mut *mix;
        voice.refresh(*master_volume, groups, *listener);
        registry.insert(voice)
    }

    /// Starts a voice over a stream buffer. A set `prior` channel is
    /// halted (a stream buffer must never feed two voices). Blocks
    /// only if `start_sec` is not already inside the buffer.
    ///
    /// Returns the unset channel when the stream cannot seek to the
    /// requested position.
    pub fn play_stream(
        &self,
        stream: &Arc<StreamBuffer>,
        prior: Channel,
        params: &PlayParams,
    ) -> Channel {
        let inner = &*self.inner;

        let start = params.start_sec;
        let start = if start < 0.0 || start >= stream.total_time() {
            0.0
        } else {
            start
        };

        let byte_pos = {
            let _callback = inner.callback_lock.lock().unwrap();
            let mut mix = inner.mix.lock().unwrap();
            if prior.is_set() {
                if let Some(voice) = mix.registry.get_mut(prior) {
                    voice.state = VoiceState::Finished;
                }
            }
            if start == 0.0 {
                stream.start_pos()
            } else {
                stream.pos_at(start)
            }
        };

        let byte_pos = match byte_pos {
            Some(pos) => pos,
            None => {
                // the position is not buffered; refill the primary
                // outside the locks so the callback keeps running
                if !stream.seek(start, true) {
                    return Channel::UNSET;
                }
                StreamBuffer::read_more_detached(stream);
                0
            }
        };

        let _callback = inner.callback_lock.lock().unwrap();
        let mut mix = inner.mix.lock().unwrap();
        let mut voice = Voice::new(
            VoiceSource::Streaming(Arc::clone(stream)),
            params,
            byte_pos,
            inner.secs_per_callback,
        );
        let MixState {
            registry,
            groups,
            listener,
            master_volume,
        } = &mut *mix;
        voice.refresh(*master_volume, groups, *listener);
        registry.insert(voice)
    }

    //
    // Update tick
    //

    /// Host-thread sweep, typically once per rendered frame.
    ///
    /// Reaps finished voices (the only place slots return to the
    /// free-list), refreshes every live voice's volume and position
    /// snapshot, and performs the blocking stream swap the mixer's
    /// non-blocking attempt may have failed.
    ///
    /// Must be serialized by the host against its own play and load
    /// calls; it excludes the device callback internally.
    pub fn update(&self) {
        let inner = &*self.inner;
        let _callback = inner.callback_lock.lock().unwrap();
        let mut mix = inner.mix.lock().unwrap();
        let MixState {
            registry,
            groups,
            listener,
            master_volume,
        } = &mut *mix;

        for i in 0..registry.slot_count() {
            let finished = match registry.voice_at(i) {
                None => continue,
                Some(voice) => {
                    if !voice.is_finished() {
                        if let VoiceSource::Streaming(stream) = &voice.source {
                            let at_side_end = voice.buffer_pos == stream.size();
                            // the mixer's try-lock swap failed; do it
                            // here where blocking is allowed
                            if at_side_end {
                                voice.stream_swap(true);
                            }
                        }
                        if !voice.is_finished() {
                            voice.refresh(*master_volume, groups, *listener);
                        }
                    }
                    voice.is_finished()
                }
            };
            if finished {
                registry.free_slot(i);
            }
        }
    }

    /// Halts and reaps every voice. Sounds and streams stay loaded;
    /// dropping the engine's handles after this releases everything.
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        let _callback = inner.callback_lock.lock().unwrap();
        let mut mix = inner.mix.lock().unwrap();
        for i in 0..mix.registry.slot_count() {
            mix.registry.free_slot(i);
        }
    }

    //
    // Channel operations. All of them are no-ops on unset or stale
    // channels; queries return the defaults of a finished voice.
    //

    fn with_live_voice<R>(&self, c: Channel, default: R, f: impl FnOnce(&mut Voice) -> R) -> R {
        if !c.is_set() {
            return default;
        }
        let mut mix = self.inner.mix.lock().unwrap();
        match mix.registry.get_mut(c) {
            Some(voice) if !voice.is_finished() => f(voice),
            _ => default,
        }
    }

    /// Stops the voice immediately, without a fade. It stops being
    /// mixed from the current callback's end at the latest and is
    /// reaped on the next tick.
    pub fn halt(&self, c: Channel) {
        self.with_live_voice(c, (), |voice| voice.state = VoiceState::Finished);
    }

    /// Stops the voice with the minimum (one callback) fade-out.
    pub fn stop(&self, c: Channel) {
        self.fade_out(c, -1.0);
    }

    /// Fades the voice out over `fade_secs`, then finishes it.
    /// Anything up to one callback period becomes the minimum fade.
    pub fn fade_out(&self, c: Channel, fade_secs: f32) {
        let secs_per_callback = self.inner.secs_per_callback;
        self.with_live_voice(c, (), |voice| {
            voice.set_fade_out(fade_secs, secs_per_callback);
        });
    }

    /// Pauses with a half-block ramp-down; never a hard step.
    pub fn pause(&self, c: Channel) {
        self.with_live_voice(c, (), |voice| voice.pause());
    }

    /// Resumes with a half-block ramp-up.
    pub fn unpause(&self, c: Channel) {
        self.with_live_voice(c, (), |voice| voice.unpause());
    }

    pub fn is_playing(&self, c: Channel) -> bool {
        self.with_live_voice(c, false, |voice| {
            matches!(voice.state, VoiceState::Playing | VoiceState::Unpausing)
        })
    }

    pub fn is_paused(&self, c: Channel) -> bool {
        self.with_live_voice(c, false, |voice| {
            matches!(voice.state, VoiceState::Paused | VoiceState::Pausing)
        })
    }

    /// True once the voice finished or the handle no longer resolves.
    pub fn is_finished(&self, c: Channel) -> bool {
        if !c.is_set() {
            return true;
        }
        let mix = self.inner.mix.lock().unwrap();
        match mix.registry.get(c) {
            Some(voice) => voice.is_finished(),
            None => true,
        }
    }

    pub fn set_loop_count(&self, c: Channel, loops: i32) {
        self.with_live_voice(c, (), |voice| voice.loop_count = loops);
    }

    pub fn loop_count(&self, c: Channel) -> i32 {
        self.with_live_voice(c, 0, |voice| voice.loop_count)
    }

    /// Moves the sound in the 2-D field. Takes effect on the next
    /// update tick.
    pub fn set_position(&self, c: Channel, x: f32, y: f32) {
        self.with_live_voice(c, (), |voice| {
            voice.x = x;
            voice.y = y;
        });
    }

    pub fn position(&self, c: Channel) -> (f32, f32) {
        self.with_live_voice(c, (0.0, 0.0), |voice| (voice.x, voice.y))
    }

    pub fn set_max_distance(&self, c: Channel, distance: f32) {
        self.with_live_voice(c, (), |voice| voice.max_distance = distance);
    }

    pub fn max_distance(&self, c: Channel) -> f32 {
        self.with_live_voice(c, 0.0, |voice| voice.max_distance)
    }

    pub fn set_group(&self, c: Channel, group: Option<GroupId>) {
        self.with_live_voice(c, (), |voice| voice.group = group);
    }

    pub fn group(&self, c: Channel) -> Option<GroupId> {
        self.with_live_voice(c, None, |voice| voice.group)
    }

    /// Sets the voice's volume. Audible from the next update tick.
    pub fn set_volume(&self, c: Channel, volume: f32) {
        self.with_live_voice(c, (), |voice| voice.volume = volume);
    }

    /// The voice's user-set volume, or 1.0 once it is finished.
    pub fn volume(&self, c: Channel) -> f32 {
        self.with_live_voice(c, 1.0, |voice| voice.volume)
    }
}
