use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{self, Time};
use symphonia::default::{get_codecs, get_probe};

use dasp_sample::Sample as DaspSample;

use crate::buffer::PcmBuffer;
use crate::common::{ChannelCount, OutputFormat, SampleRate};
use crate::conversions::{ChannelMapper, LinearResampler};
use crate::math::nz;

use super::{DecoderError, FillInfo, OutputSpec, StreamSource};

// Decoder errors are not considered fatal. The correct action is to
// get a new packet and try again, but more than 3 consecutive
// failures is fatal.
const MAX_DECODE_ERRORS: usize = 3;

/// Raw symphonia-backed sample source: interleaved `f32` at the
/// file's native rate and channel layout.
struct RawSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    buffer: SampleBuffer<f32>,
    offset: usize,
    spec: SignalSpec,
    total_frames: Option<u64>,
    /// Set on a fatal mid-stream failure; the iterator then ends.
    error: Option<&'static str>,
}

impl RawSource {
    fn open(path: &Path) -> Result<RawSource, DecoderError> {
        let file = File::open(path).map_err(|e| DecoderError::IoError(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts: MetadataOptions = Default::default();

        let probed = get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(map_symphonia_error)?;
        let mut format = probed.format;

        let (track_id, total_frames, codec_params) = {
            let track = format.default_track().ok_or(DecoderError::NoStreams)?;
            (track.id, track.codec_params.n_frames, track.codec_params.clone())
        };

        let mut decoder = get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;

        // decode one packet up front to learn the signal spec
        let mut decode_errors = 0;
        let decoded = loop {
            let packet = format.next_packet().map_err(map_symphonia_error)?;
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) => break decoded,
                Err(Error::DecodeError(_)) => {
                    decode_errors += 1;
                    if decode_errors > MAX_DECODE_ERRORS {
                        return Err(DecoderError::DecodeError("too many corrupt packets"));
                    }
                }
                Err(e) => return Err(map_symphonia_error(e)),
            }
        };

        let spec = decoded.spec().to_owned();
        let duration = units::Duration::from(decoded.capacity() as u64);
        let mut buffer = SampleBuffer::<f32>::new(duration, spec);
        buffer.copy_interleaved_ref(decoded);

        Ok(RawSource {
            format,
            decoder,
            track_id,
            buffer,
            offset: 0,
            spec,
            total_frames,
            error: None,
        })
    }

    fn sample_rate(&self) -> u32 {
        self.spec.rate
    }

    fn channels(&self) -> usize {
        self.spec.channels.count()
    }

    fn total_time(&self) -> f64 {
        match self.total_frames {
            Some(frames) if self.spec.rate > 0 => frames as f64 / self.spec.rate as f64,
            _ => f64::INFINITY,
        }
    }

    fn seek(&mut self, sec: f64) -> Result<(), DecoderError> {
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(sec),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|_| DecoderError::SeekError("position not reachable"))?;
        self.decoder.reset();
        // mark the buffered packet consumed; the next pull decodes
        // from the new position
        self.offset = self.buffer.len();
        self.error = None;
        Ok(())
    }
}

impl Iterator for RawSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.offset == self.buffer.len() {
            let mut decode_errors = 0;
            let decoded = loop {
                let packet = match self.format.next_packet() {
                    Ok(packet) => packet,
                    Err(Error::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return None;
                    }
                    Err(_) => {
                        self.error = Some("packet read failed mid-stream");
                        return None;
                    }
                };
                if packet.track_id() != self.track_id {
                    continue;
                }
                match self.decoder.decode(&packet) {
                    Ok(decoded) => break decoded,
                    Err(Error::DecodeError(_)) => {
                        decode_errors += 1;
                        if decode_errors > MAX_DECODE_ERRORS {
                            self.error = Some("too many corrupt packets");
                            return None;
                        }
                    }
                    Err(_) => {
                        self.error = Some("decoder failed mid-stream");
                        return None;
                    }
                }
            };
            self.buffer.copy_interleaved_ref(decoded);
            self.offset = 0;
            if self.buffer.len() == 0 {
                return None;
            }
        }

        let sample = *self.buffer.samples().get(self.offset)?;
        self.offset += 1;
        Some(sample)
    }
}

type Pipeline = LinearResampler<ChannelMapper<RawSource>>;

fn build_pipeline(raw: RawSource, spec: &OutputSpec) -> (Pipeline, ChannelCount) {
    let native_channels =
        ChannelCount::new((raw.channels() as u16).max(1)).unwrap_or(nz!(1));
    let target_channels = native_channels.min(nz!(2));
    let native_rate = SampleRate::new(raw.sample_rate()).unwrap_or(spec.sample_rate);

    let mapped = ChannelMapper::new(raw, native_channels, target_channels);
    let resampled = LinearResampler::new(mapped, native_rate, spec.sample_rate, target_channels);
    (resampled, target_channels)
}

fn write_sample(out: &mut Vec<u8>, sample: f32, format: OutputFormat) {
    match format {
        OutputFormat::F32 => out.extend_from_slice(&sample.to_ne_bytes()),
        OutputFormat::I16 => {
            let s: i16 = sample.to_sample();
            out.extend_from_slice(&s.to_ne_bytes());
        }
    }
}

/// Decodes a whole file into a [`PcmBuffer`] matching `spec`.
pub(crate) fn decode_whole(path: &Path, spec: OutputSpec) -> Result<PcmBuffer, DecoderError> {
    let raw = RawSource::open(path)?;
    let estimated_frames = raw.total_frames.unwrap_or(0) as usize;
    let (mut pipeline, channels) = build_pipeline(raw, &spec);

    let mut bytes = Vec::with_capacity(
        estimated_frames * channels.get() as usize * spec.format.sample_bytes(),
    );
    for sample in &mut pipeline {
        write_sample(&mut bytes, sample, spec.format);
    }

    if let Some(error) = pipeline.inner().inner().error {
        return Err(DecoderError::DecodeError(error));
    }
    if bytes.is_empty() {
        return Err(DecoderError::NoStreams);
    }

    Ok(PcmBuffer::new(bytes, channels, spec.format))
}

/// Streamed decoding of a WAV or Ogg/Vorbis file through symphonia.
pub(crate) struct SymphoniaStream {
    pipeline: Option<Pipeline>,
    channels: ChannelCount,
    total_time: f64,
    spec: OutputSpec,
}

impl SymphoniaStream {
    pub(crate) fn open(
        path: &Path,
        spec: OutputSpec,
        start_sec: f64,
    ) -> Result<SymphoniaStream, DecoderError> {
        let mut raw = RawSource::open(path)?;
        let total_time = raw.total_time();
        if start_sec > 0.0 {
            raw.seek(start_sec)?;
        }
        let (pipeline, channels) = build_pipeline(raw, &spec);
        Ok(SymphoniaStream {
            pipeline: Some(pipeline),
            channels,
            total_time,
            spec,
        })
    }
}

impl StreamSource for SymphoniaStream {
    fn channels(&self) -> ChannelCount {
        self.channels
    }

    fn total_time(&self) -> f64 {
        self.total_time
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<FillInfo, DecoderError> {
        let block = self.channels.get() as usize * self.spec.format.sample_bytes();
        debug_assert_eq!(out.len() % block, 0);
        let pipeline = match self.pipeline.as_mut() {
            Some(p) => p,
            None => return Err(DecoderError::DecodeError("stream source lost")),
        };

        let mut written = 0;
        let mut hit_eof = false;
        let mut frame = [0.0f32; 2];

        'fill: while written + block <= out.len() {
            for slot in frame.iter_mut().take(self.channels.get() as usize) {
                match pipeline.next() {
                    Some(sample) => *slot = sample,
                    None => {
                        if let Some(error) = pipeline.inner().inner().error {
                            return Err(DecoderError::DecodeError(error));
                        }
                        hit_eof = true;
                        break 'fill;
                    }
                }
            }
            for &sample in frame.iter().take(self.channels.get() as usize) {
                match self.spec.format {
                    OutputFormat::F32 => {
                        out[written..written + 4].copy_from_slice(&sample.to_ne_bytes());
                        written += 4;
                    }
                    OutputFormat::I16 => {
                        let s: i16 = sample.to_sample();
                        out[written..written + 2].copy_from_slice(&s.to_ne_bytes());
                        written += 2;
                    }
                }
            }
        }

        Ok(FillInfo {
            bytes: written,
            hit_eof,
        })
    }

    fn seek(&mut self, sec: f64) -> Result<(), DecoderError> {
        let pipeline = match self.pipeline.take() {
            Some(p) => p,
            None => return Err(DecoderError::SeekError("stream source lost")),
        };
        let mut raw = pipeline.into_inner().into_inner();
        let result = raw.seek(sec);
        let (pipeline, _) = build_pipeline(raw, &self.spec);
        self.pipeline = Some(pipeline);
        result
    }
}

fn map_symphonia_error(e: Error) -> DecoderError {
    match e {
        Error::IoError(e) => DecoderError::IoError(e.to_string()),
        Error::DecodeError(e) => DecoderError::DecodeError(e),
        Error::SeekError(_) => DecoderError::SeekError("container seek failed"),
        Error::Unsupported(_) => DecoderError::UnrecognizedFormat,
        Error::LimitError(e) => DecoderError::DecodeError(e),
        Error::ResetRequired => DecoderError::DecodeError("decoder reset required"),
    }
}
