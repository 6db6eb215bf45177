//! Decodes audio files into the engine's output format.
//!
//! Two entry points exist: [`decode_whole`] reads an entire file into
//! a [`PcmBuffer`] for short effects, and [`open_stream`] returns a
//! [`StreamSource`] that a [`StreamBuffer`](crate::StreamBuffer)
//! drains incrementally for music and long ambience.
//!
//! Both are backed by symphonia and emit interleaved samples already
//! converted to the engine's sample rate and output format, mono or
//! stereo. Mono material stays mono; the mixer widens it at mix time.

use std::path::Path;

use crate::buffer::PcmBuffer;
use crate::common::{assert_error_traits, ChannelCount, OutputFormat, SampleRate};

mod symphonia;

pub(crate) use self::symphonia::SymphoniaStream;

/// The output configuration decoders must match: the engine's sample
/// rate and sample format.
#[derive(Debug, Clone, Copy)]
pub struct OutputSpec {
    pub sample_rate: SampleRate,
    pub format: OutputFormat,
}

/// Error that can occur when loading or decoding a sound.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecoderError {
    /// The container or codec is not recognized or not enabled.
    #[error("Unrecognized container or codec")]
    UnrecognizedFormat,

    /// An IO error occurred while reading or probing the file.
    #[error("IO error while decoding: {0}")]
    IoError(String),

    /// The decoder failed on malformed data.
    #[error("Decode error: {0}")]
    DecodeError(&'static str),

    /// The file contains no audio track a decoder could play.
    #[error("The file has no supported audio track")]
    NoStreams,

    /// Seeking to a requested position failed.
    #[error("Seek failed: {0}")]
    SeekError(&'static str),
}
assert_error_traits!(DecoderError);

/// What one [`StreamSource::fill`] call produced.
#[derive(Debug, Clone, Copy)]
pub struct FillInfo {
    /// Bytes written; always a whole number of sample blocks.
    pub bytes: usize,
    /// True when the end of the file was reached during this call.
    /// The source stays positioned at the end; the caller decides
    /// whether to [`seek`](StreamSource::seek) back to zero and keep
    /// filling.
    pub hit_eof: bool,
}

/// Incremental decoder feeding a stream buffer.
///
/// `fill` writes interleaved output-format bytes until the window is
/// full or EOF is reached, whichever comes first, so EOF is observed
/// at most once per call and the caller can record the exact byte
/// offset of the stream's end.
pub trait StreamSource: Send {
    /// Channel count of the decoded data: 1 or 2.
    fn channels(&self) -> ChannelCount;

    /// Total duration of the stream in seconds. `f64::INFINITY` when
    /// the container does not declare a length.
    fn total_time(&self) -> f64;

    /// Decode into `out` (length must be block-aligned). See the
    /// trait docs for the EOF contract.
    fn fill(&mut self, out: &mut [u8]) -> Result<FillInfo, DecoderError>;

    /// Reposition the decoder at `sec` seconds.
    fn seek(&mut self, sec: f64) -> Result<(), DecoderError>;
}

/// Decodes an entire file into a [`PcmBuffer`] in the given spec.
pub fn decode_whole(path: &Path, spec: OutputSpec) -> Result<PcmBuffer, DecoderError> {
    symphonia::decode_whole(path, spec)
}

/// Opens a file for incremental decoding, positioned at `start_sec`.
pub fn open_stream(
    path: &Path,
    spec: OutputSpec,
    start_sec: f64,
) -> Result<Box<dyn StreamSource>, DecoderError> {
    let stream = SymphoniaStream::open(path, spec, start_sec)?;
    Ok(Box::new(stream))
}
