//! Double-buffered streaming of long audio files.
//!
//! A [`StreamBuffer`] keeps two half-second sides of decoded PCM: the
//! primary, which the mixer reads, and the secondary, which a
//! background decoder task fills. When the mixer exhausts the primary
//! it swaps the sides with a non-blocking protocol; the host's update
//! tick performs a blocking swap if the mixer could not.
//!
//! The mix callback never waits on disk: if the secondary is not
//! ready the voice simply emits what the primary had left and retries
//! on the next callback.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::common::ChannelCount;
use crate::decoder::{DecoderError, OutputSpec, StreamSource};

/// Result of a swap attempt on a [`StreamBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The sides were swapped (or the whole stream is buffered and no
    /// swap is ever needed).
    Ready,
    /// The secondary lock is held elsewhere; try again later.
    NotReady,
    /// The decoder failed; the stream cannot continue.
    Error,
    /// The secondary holds no data yet.
    NoData,
    /// The secondary was filled by a seek, not a sequential read.
    PosSet,
    /// A seek-swap was requested but no seek data is pending.
    PosNotSet,
}

pub(crate) struct Primary {
    pub(crate) data: Vec<u8>,
    /// One past the last byte of the logical stream inside this side;
    /// `Some(0)` means EOF was hit on the very first byte, `None`
    /// means the end is not in this side.
    pub(crate) end_pos: Option<usize>,
    /// Seconds into the stream at the first byte of this side.
    pub(crate) time: f64,
}

struct Secondary {
    data: Vec<u8>,
    end_pos: Option<usize>,
    time: f64,
    /// The data came from `seek`, not `read_more`.
    pos_set: bool,
    /// A fill failed; latched until a successful `seek`.
    error: bool,
    source: Box<dyn StreamSource>,
}

/// Producer/consumer buffer between a decoder task and the mixer.
///
/// Locking: the secondary mutex serializes every write path
/// (`read_more`, `seek`, the swap variants); the primary mutex
/// protects the side the mixer reads so time queries are race-free.
/// A swap takes the secondary first, then the primary.
pub struct StreamBuffer {
    total_time: f64,
    channels: ChannelCount,
    block_bytes: usize,
    sample_rate: u32,
    side_len: usize,
    fully_buffered: bool,
    primary: Mutex<Primary>,
    secondary: Mutex<Secondary>,
}

impl StreamBuffer {
    /// Creates a buffer over `source` and synchronously fills the
    /// primary starting at `start_sec`, so playback can begin without
    /// touching the disk again.
    ///
    /// If the whole stream fits in one side it is read in full and
    /// marked fully buffered; no decoding happens after that.
    pub fn open(
        mut source: Box<dyn StreamSource>,
        spec: OutputSpec,
        start_sec: f64,
    ) -> Result<StreamBuffer, DecoderError> {
        let channels = source.channels();
        let block_bytes = channels.get() as usize * spec.format.sample_bytes();
        let sample_rate = spec.sample_rate.get();
        let side_len = (sample_rate as usize / 2).max(1) * block_bytes;
        let total_time = source.total_time();

        let estimated_bytes = if total_time.is_finite() {
            (total_time * sample_rate as f64).ceil() as usize * block_bytes
        } else {
            usize::MAX
        };
        let fully_buffered = estimated_bytes <= side_len;

        let mut sec = start_sec;
        if sec < 0.0 || sec >= total_time || fully_buffered {
            sec = 0.0;
        }
        if sec > 0.0 {
            source.seek(sec)?;
        }

        // the estimate can undershoot, so a fully buffered read gets
        // both sides' worth of room
        let window = if fully_buffered { side_len * 2 } else { side_len };
        let mut data = vec![0u8; window];
        let (size, end_pos) = fill_side(source.as_mut(), &mut data, fully_buffered)?;
        if size == 0 {
            return Err(DecoderError::NoStreams);
        }
        data.truncate(size);
        let end_pos = if fully_buffered && end_pos.is_none() {
            Some(size)
        } else {
            end_pos
        };

        Ok(StreamBuffer {
            total_time,
            channels,
            block_bytes,
            sample_rate,
            side_len,
            fully_buffered,
            primary: Mutex::new(Primary {
                data,
                end_pos,
                time: sec,
            }),
            secondary: Mutex::new(Secondary {
                data: Vec::with_capacity(side_len),
                end_pos: None,
                time: 0.0,
                pos_set: false,
                error: false,
                source,
            }),
        })
    }

    /// Total duration of the stream in seconds.
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Channel count of the decoded data: 1 or 2.
    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    /// Size in bytes of one sample across all channels.
    pub fn sample_block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// True when the entire stream fit in one side at open time.
    pub fn fully_buffered(&self) -> bool {
        self.fully_buffered
    }

    /// Seconds into the stream at the start of the primary side.
    pub fn time(&self) -> f64 {
        self.primary.lock().unwrap().time
    }

    /// Bytes of decoded data currently in the primary side.
    pub fn size(&self) -> usize {
        self.primary.lock().unwrap().data.len()
    }

    pub(crate) fn lock_primary(&self) -> MutexGuard<'_, Primary> {
        self.primary.lock().unwrap()
    }

    /// Byte offset of the stream's first sample inside the primary,
    /// if present.
    pub(crate) fn start_pos(&self) -> Option<usize> {
        let p = self.primary.lock().unwrap();
        if p.time == 0.0 {
            Some(0)
        } else {
            match p.end_pos {
                Some(e) if e != p.data.len() => Some(e),
                _ => None,
            }
        }
    }

    /// Byte offset of the sample at `sec` inside the primary, if
    /// present. May equal the side's size, in which case a swap is
    /// due before reading.
    pub(crate) fn pos_at(&self, sec: f64) -> Option<usize> {
        let p = self.primary.lock().unwrap();
        let sample_pos = ((sec - p.time) * self.sample_rate as f64) as i64;
        let byte_pos = sample_pos * self.block_bytes as i64;
        if byte_pos < 0 || byte_pos > p.data.len() as i64 {
            None
        } else {
            Some(byte_pos as usize)
        }
    }

    /// Fills the secondary with the next run of the stream
    /// (decoder-task side). Returns true if the secondary holds data
    /// afterwards, false if decoding failed.
    ///
    /// Never needed when the stream is fully buffered.
    pub fn read_more(&self) -> bool {
        if self.fully_buffered {
            return true;
        }

        let mut s = self.secondary.lock().unwrap();
        if !s.data.is_empty() {
            return true;
        }
        // failed last read, so will fail again
        if s.error {
            return false;
        }

        let mut buf = std::mem::take(&mut s.data);
        buf.resize(self.side_len, 0);
        match fill_side(s.source.as_mut(), &mut buf, false) {
            Ok((size, end_pos)) if size > 0 => {
                buf.truncate(size);
                s.data = buf;
                s.end_pos = end_pos;
                s.time = self.next_side_time(end_pos);
                true
            }
            result => {
                s.error = true;
                if let Err(_e) = result {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("stream decode failed: {_e}");
                }
                false
            }
        }
    }

    /// Fills the secondary starting at `sec`, marking it as seek
    /// data. With `swap_now` the sides are exchanged before
    /// returning, which the load/play path uses when nothing is
    /// being mixed yet.
    pub fn seek(&self, sec: f64, swap_now: bool) -> bool {
        if self.fully_buffered {
            return true;
        }

        let mut s = self.secondary.lock().unwrap();
        s.data.clear();
        s.end_pos = None;
        s.time = 0.0;
        s.pos_set = false;
        // latched until this seek succeeds
        s.error = true;

        let sec = if sec < 0.0 || sec >= self.total_time {
            0.0
        } else {
            sec
        };
        if s.source.seek(sec).is_err() {
            return false;
        }

        let mut buf = std::mem::take(&mut s.data);
        buf.resize(self.side_len, 0);
        match fill_side(s.source.as_mut(), &mut buf, false) {
            Ok((size, end_pos)) if size > 0 => {
                buf.truncate(size);
                s.data = buf;
                s.end_pos = end_pos;
                s.time = sec;
                s.pos_set = true;
                if swap_now {
                    self.swap_sides(&mut s);
                }
                s.error = false;
                true
            }
            _ => false,
        }
    }

    /// Swap only if the secondary came from `read_more` (the normal
    /// end-of-primary transition while mixing). Non-blocking.
    pub fn advance(&self) -> SwapOutcome {
        if self.fully_buffered {
            return SwapOutcome::Ready;
        }
        let Ok(mut s) = self.secondary.try_lock() else {
            return SwapOutcome::NotReady;
        };
        if !s.data.is_empty() && !s.pos_set {
            self.swap_sides(&mut s);
            return SwapOutcome::Ready;
        }
        if s.error {
            SwapOutcome::Error
        } else if s.pos_set {
            SwapOutcome::PosSet
        } else {
            SwapOutcome::NoData
        }
    }

    /// Swap only if the secondary came from `seek`. Non-blocking.
    pub fn update_pos(&self) -> SwapOutcome {
        if self.fully_buffered {
            return SwapOutcome::Ready;
        }
        let Ok(mut s) = self.secondary.try_lock() else {
            return SwapOutcome::NotReady;
        };
        if s.pos_set {
            // pos_set implies the secondary has data
            self.swap_sides(&mut s);
            return SwapOutcome::Ready;
        }
        if s.error {
            SwapOutcome::Error
        } else {
            SwapOutcome::PosNotSet
        }
    }

    /// Swap if the secondary holds any data. Non-blocking.
    pub fn swap(&self) -> SwapOutcome {
        if self.fully_buffered {
            return SwapOutcome::Ready;
        }
        let Ok(mut s) = self.secondary.try_lock() else {
            return SwapOutcome::NotReady;
        };
        self.swap_any(&mut s)
    }

    /// Swap if the secondary holds any data, waiting for the
    /// secondary lock. Used by the update tick after the mixer's
    /// non-blocking attempt failed.
    pub(crate) fn swap_blocking(&self) -> SwapOutcome {
        if self.fully_buffered {
            return SwapOutcome::Ready;
        }
        let mut s = self.secondary.lock().unwrap();
        self.swap_any(&mut s)
    }

    fn swap_any(&self, s: &mut Secondary) -> SwapOutcome {
        if !s.data.is_empty() {
            self.swap_sides(s);
            return SwapOutcome::Ready;
        }
        if s.error {
            SwapOutcome::Error
        } else {
            SwapOutcome::NoData
        }
    }

    fn swap_sides(&self, s: &mut Secondary) {
        let mut p = self.primary.lock().unwrap();
        std::mem::swap(&mut p.data, &mut s.data);
        p.time = s.time;
        s.time = 0.0;
        p.end_pos = s.end_pos.take();
        s.data.clear();
        s.pos_set = false;
    }

    /// Spawns a detached task that fills the secondary. The task
    /// holds its own strong reference, so the buffer outlives it.
    pub(crate) fn read_more_detached(this: &Arc<StreamBuffer>) {
        if this.fully_buffered {
            return;
        }
        let buf = Arc::clone(this);
        thread::spawn(move || {
            buf.read_more();
        });
    }

    /// Stream time at the first byte the next `read_more` side holds.
    fn next_side_time(&self, end_pos2: Option<usize>) -> f64 {
        let freq = self.sample_rate as f64;
        let block = self.block_bytes as f64;
        match end_pos2 {
            // EOF hit immediately, so the side is the stream's start
            Some(0) => 0.0,
            // the side ends `e` bytes before the stream's end
            Some(e) => self.total_time - (e as f64 / block) / freq,
            None => {
                let p = self.primary.lock().unwrap();
                match p.end_pos {
                    Some(e) if e == p.data.len() => 0.0,
                    Some(e) => ((p.data.len() - e) as f64 / block) / freq,
                    None => p.time + (p.data.len() as f64 / block) / freq,
                }
            }
        }
    }
}

/// Fills `buf` from `source`, recording where the stream's end lands.
///
/// EOF is observed at most once: the first occurrence is recorded and
/// the source is wrapped to sample zero; a second occurrence ends the
/// call with the source left at EOF, so the next fill starts with the
/// `end_pos = 0` case.
fn fill_side(
    source: &mut dyn StreamSource,
    buf: &mut [u8],
    stop_at_eof: bool,
) -> Result<(usize, Option<usize>), DecoderError> {
    let mut written = 0;
    let mut end_pos = None;

    while written < buf.len() {
        let info = source.fill(&mut buf[written..])?;
        written += info.bytes;
        if info.hit_eof {
            if end_pos.is_none() {
                end_pos = Some(written);
                if stop_at_eof {
                    break;
                }
                source.seek(0.0)?;
            } else {
                break;
            }
        } else if info.bytes == 0 {
            break;
        }
    }

    Ok((written, end_pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FillInfo;
    use crate::math::nz;

    /// Mono f32 source yielding frame-index sample values.
    struct PatternSource {
        frames: usize,
        pos: usize,
        rate: u32,
        /// Report an unknown duration to force double buffering even
        /// for tiny streams.
        hide_len: bool,
    }

    impl PatternSource {
        fn new(frames: usize, rate: u32) -> PatternSource {
            PatternSource {
                frames,
                pos: 0,
                rate,
                hide_len: false,
            }
        }
    }

    impl StreamSource for PatternSource {
        fn channels(&self) -> ChannelCount {
            nz!(1)
        }

        fn total_time(&self) -> f64 {
            if self.hide_len {
                f64::INFINITY
            } else {
                self.frames as f64 / self.rate as f64
            }
        }

        fn fill(&mut self, out: &mut [u8]) -> Result<FillInfo, DecoderError> {
            let room = out.len() / 4;
            let left = self.frames - self.pos;
            let n = room.min(left);
            for i in 0..n {
                let v = (self.pos + i) as f32;
                out[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
            }
            self.pos += n;
            Ok(FillInfo {
                bytes: n * 4,
                hit_eof: self.pos == self.frames,
            })
        }

        fn seek(&mut self, sec: f64) -> Result<(), DecoderError> {
            self.pos = ((sec * self.rate as f64) as usize).min(self.frames);
            Ok(())
        }
    }

    fn spec(rate: u32) -> OutputSpec {
        OutputSpec {
            sample_rate: SampleRate::new(rate).unwrap(),
            format: OutputFormat::F32,
        }
    }

    use crate::common::{OutputFormat, SampleRate};

    fn frame_at(p: &[u8], i: usize) -> f32 {
        f32::from_ne_bytes(p[i * 4..i * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn tiny_stream_is_fully_buffered() {
        // 3 frames at 8 Hz, side holds 4 frames
        let buf = StreamBuffer::open(Box::new(PatternSource::new(3, 8)), spec(8), 0.0).unwrap();
        assert!(buf.fully_buffered());
        assert_eq!(buf.size(), 12);
        assert_eq!(buf.lock_primary().end_pos, Some(12));
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        assert_eq!(buf.swap(), SwapOutcome::Ready);
    }

    #[test]
    fn sequential_reads_and_swaps() {
        // 12 frames at 8 Hz: three sides of 4 frames
        let buf = StreamBuffer::open(Box::new(PatternSource::new(12, 8)), spec(8), 0.0).unwrap();
        assert!(!buf.fully_buffered());
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.time(), 0.0);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 0.0);

        // nothing to swap until the decoder task ran
        assert_eq!(buf.advance(), SwapOutcome::NoData);

        assert!(buf.read_more());
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        assert_eq!(buf.time(), 0.5);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 4.0);
        assert_eq!(buf.lock_primary().end_pos, None);
    }

    #[test]
    fn eof_at_side_boundary() {
        let buf = StreamBuffer::open(Box::new(PatternSource::new(12, 8)), spec(8), 0.0).unwrap();
        assert!(buf.read_more());
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        // third side holds frames 8..12; EOF lands exactly at its end
        assert!(buf.read_more());
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        let p = buf.lock_primary();
        assert_eq!(p.end_pos, Some(16));
        assert_eq!(p.data.len(), 16);
        assert_eq!(frame_at(&p.data, 3), 11.0);
        drop(p);
        // the wrap already happened inside the fill, so the next side
        // restarts at frame 0
        assert!(buf.read_more());
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        assert_eq!(buf.time(), 0.0);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 0.0);
    }

    #[test]
    fn second_eof_leaves_source_at_end() {
        // a 1-frame stream with hidden length: each side crosses EOF
        // twice, so fills stop at the second crossing
        let mut src = PatternSource::new(1, 8);
        src.hide_len = true;
        let buf = StreamBuffer::open(Box::new(src), spec(8), 0.0).unwrap();
        assert!(!buf.fully_buffered());
        // primary: frame 0, wrap, frame 0 again, stop at second EOF
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.lock_primary().end_pos, Some(4));

        // the source was left at EOF, so the next side sees EOF on
        // its first byte
        assert!(buf.read_more());
        assert_eq!(buf.advance(), SwapOutcome::Ready);
        let p = buf.lock_primary();
        assert_eq!(p.end_pos, Some(0));
        assert_eq!(p.data.len(), 4);
    }

    #[test]
    fn seek_sets_position_data() {
        let buf = StreamBuffer::open(Box::new(PatternSource::new(16, 8)), spec(8), 0.0).unwrap();
        assert!(buf.seek(1.0, false));
        // a plain advance refuses seek data; update_pos takes it
        assert_eq!(buf.advance(), SwapOutcome::PosSet);
        assert_eq!(buf.update_pos(), SwapOutcome::Ready);
        assert_eq!(buf.time(), 1.0);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 8.0);
    }

    #[test]
    fn seek_with_immediate_swap() {
        let buf = StreamBuffer::open(Box::new(PatternSource::new(16, 8)), spec(8), 0.0).unwrap();
        assert!(buf.seek(1.5, true));
        assert_eq!(buf.time(), 1.5);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 12.0);
        // secondary is empty again after the swap
        assert_eq!(buf.advance(), SwapOutcome::NoData);
    }

    #[test]
    fn open_at_offset() {
        let buf = StreamBuffer::open(Box::new(PatternSource::new(16, 8)), spec(8), 1.0).unwrap();
        assert_eq!(buf.time(), 1.0);
        assert_eq!(frame_at(&buf.lock_primary().data, 0), 8.0);
        assert_eq!(buf.start_pos(), None);
        assert_eq!(buf.pos_at(1.25), Some(8));
        assert_eq!(buf.pos_at(0.5), None);
    }
}
