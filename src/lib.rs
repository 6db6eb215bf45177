//! Real-time 2-D positional audio mixer for games.
//!
//! polymix mixes any number of concurrently playing sounds into one
//! interleaved stereo output block per device callback. Short effects
//! are decoded whole into shared [`PcmBuffer`]s; music and long
//! ambience stream from disk through a double-buffered
//! [`StreamBuffer`] topped up by background decoder tasks, so the mix
//! callback never waits on I/O.
//!
//! Playing a sound yields a [`Channel`] handle with pause/unpause,
//! fade-in/out, looping, volume and 2-D positional panning relative
//! to a listener. All gain changes are applied as short linear ramps,
//! never as steps, so there are no clicks on pause, stop or volume
//! changes. The host drives [`Engine::update`] once per frame to reap
//! finished voices and publish parameter changes.
//!
//! ```no_run
//! use polymix::{Engine, EngineSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineSettings::default());
//! let _device = engine.open_output()?;
//!
//! let mut music = engine.load_stream("music.ogg")?;
//! music.play(-1);
//!
//! let mut shot = engine.load_sound("shot.wav")?;
//! shot.set_position(4.0, 0.0);
//! shot.set_max_distance(10.0);
//! shot.play(0);
//!
//! loop {
//!     engine.update();
//!     # break;
//!     // render a frame...
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod buffer;
mod common;
pub mod conversions;
pub mod decoder;
#[cfg(feature = "playback")]
mod device;
mod engine;
mod math;
mod mixer;
mod registry;
mod sound;
mod stream;
mod stream_buffer;
mod voice;

pub use buffer::PcmBuffer;
pub use common::{ChannelCount, OutputFormat, Sample, SampleRate};
pub use decoder::{DecoderError, FillInfo, OutputSpec, StreamSource};
#[cfg(feature = "playback")]
pub use device::{DeviceError, OutputDevice};
pub use engine::{Engine, EngineSettings, PlayParams};
pub use mixer::Renderer;
pub use registry::{Channel, GroupId};
pub use sound::Sound;
pub use stream::Stream;
pub use stream_buffer::{StreamBuffer, SwapOutcome};
