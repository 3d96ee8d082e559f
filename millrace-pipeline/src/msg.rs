//! Pipeline message algebra.
//!
//! Everything that flows between elements is a [`Msg`]. The set of kinds
//! is closed and their relative order inside a stream is part of the
//! contract: `Mode` before `Track` before `EncodedStream` before audio,
//! `DecodedStream` before decoded audio, `Quit` last of all. An element
//! receiving a kind it has no business seeing treats that as a wiring
//! error and panics rather than guessing.
//!
//! Audio payload bytes live in pooled buffers ([`crate::pool`]) shared by
//! `Arc`, so splitting a message is cheap: the halves reference disjoint
//! jiffy ranges of the same buffer. Ramps travel as metadata
//! ([`crate::ramp::Ramp`]) and are only multiplied into the bytes when a
//! message is rendered to [`PlayableAudio`].

use std::fmt;
use std::sync::{Arc, Mutex};

use millrace_common::jiffies;

use crate::element::StreamHandler;
use crate::pool::{BufferPool, PooledBuffer};
use crate::ramp::{Direction, Ramp, RampApplicator, RAMP_MAX, RAMP_MIN};

/// Sample encoding of a decoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm,
    Dsd,
}

/// Describes the source mode now in effect. First message of any stream
/// sequence.
pub struct ModeInfo {
    pub name: String,
    /// Whether the mode's sources expect receiver-side latency handling.
    pub supports_latency: bool,
    pub clock_puller: Option<Arc<dyn crate::element::ClockPuller>>,
}

pub struct TrackInfo {
    pub uri: String,
    pub metadata: String,
    pub id: u32,
}

/// Describes an encoded stream about to start.
pub struct EncodedStreamInfo {
    pub uri: String,
    pub stream_id: u32,
    pub total_bytes: u64,
    pub seekable: bool,
    pub live: bool,
    pub stream_handler: Arc<dyn StreamHandler>,
}

/// Describes decoded audio that follows, emitted by the codec.
pub struct DecodedStreamInfo {
    pub stream_id: u32,
    pub bit_rate: u32,
    pub bit_depth: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec_name: String,
    pub track_length_jiffies: u64,
    pub sample_start: u64,
    pub lossless: bool,
    pub seekable: bool,
    pub live: bool,
    pub format: AudioFormat,
    pub stream_handler: Arc<dyn StreamHandler>,
}

/// One-shot acknowledgement attached to `Drain` and `Halt` messages.
/// Cloned copies share the acknowledgement; it fires at most once.
#[derive(Clone)]
pub struct AckToken {
    callback: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl AckToken {
    pub fn new(callback: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            callback: Arc::new(Mutex::new(Some(callback))),
        }
    }

    pub fn none() -> Self {
        Self {
            callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Fire the acknowledgement. Subsequent calls are no-ops.
    pub fn acknowledge(&self) {
        if let Some(cb) = self.callback.lock().unwrap().take() {
            cb();
        }
    }
}

/// Encoded audio bytes, pooled. Clones share the buffer.
#[derive(Clone)]
pub struct EncodedAudio {
    data: Arc<PooledBuffer>,
}

impl EncodedAudio {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decoded audio payload shared by the `AudioPcm`, `AudioDsd` and
/// `Silence` kinds. `Silence` carries no buffer and renders as zeros.
pub struct DecodedAudio {
    data: Option<Arc<PooledBuffer>>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    /// Jiffy offset of this fragment within `data`.
    offset_jiffies: u32,
    size_jiffies: u32,
    /// Position of the first sample within the track, in samples, where
    /// known. Silence has no track position.
    pub track_offset: Option<u64>,
    ramp: Ramp,
    /// DSD only; words per interleaved channel block.
    pub dsd_block_words: u32,
}

impl DecodedAudio {
    pub fn size_jiffies(&self) -> u32 {
        self.size_jiffies
    }

    /// Whether this fragment carries real bytes (false for silence).
    pub fn has_payload(&self) -> bool {
        self.data.is_some()
    }

    /// Cheap copy sharing the underlying pooled buffer.
    pub fn share(&self) -> DecodedAudio {
        DecodedAudio {
            data: self.data.clone(),
            format: self.format,
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            channels: self.channels,
            offset_jiffies: self.offset_jiffies,
            size_jiffies: self.size_jiffies,
            track_offset: self.track_offset,
            ramp: self.ramp,
            dsd_block_words: self.dsd_block_words,
        }
    }

    pub fn ramp(&self) -> &Ramp {
        &self.ramp
    }

    pub fn clear_ramp(&mut self) {
        self.ramp.reset();
    }

    pub fn set_muted(&mut self) {
        self.ramp.set_muted();
    }

    /// Smallest jiffy granularity this fragment can be split at. DSD is
    /// byte-packed, so splits align to eight samples per channel.
    fn split_granularity(&self) -> u32 {
        let per = jiffies::per_sample(self.sample_rate);
        match self.format {
            AudioFormat::Pcm => per,
            AudioFormat::Dsd => per * 8,
        }
    }

    /// Split off and return the tail of this fragment, leaving the first
    /// `at_jiffies` (rounded down to the sample grid, minimum one grain)
    /// in `self`.
    pub fn split(&mut self, at_jiffies: u32) -> DecodedAudio {
        let grain = self.split_granularity();
        let mut at = at_jiffies - at_jiffies % grain;
        if at == 0 {
            at = grain;
        }
        assert!(
            at < self.size_jiffies,
            "split position {at} out of range (size {})",
            self.size_jiffies
        );
        self.do_split(at)
    }

    /// Like [`split`](Self::split), but returns `None` when the position
    /// rounds to either end of the fragment. Callers treat that as "take
    /// the whole fragment"; the error is under one sample.
    pub fn try_split(&mut self, at_jiffies: u32) -> Option<DecodedAudio> {
        let grain = self.split_granularity();
        if self.size_jiffies <= grain {
            return None;
        }
        let mut at = at_jiffies - at_jiffies % grain;
        if at == 0 {
            at = grain;
        }
        if at >= self.size_jiffies {
            return None;
        }
        Some(self.do_split(at))
    }

    fn do_split(&mut self, at: u32) -> DecodedAudio {
        // An un-ramped fragment must not spawn a ramped tail.
        let tail_ramp = if self.ramp.is_enabled() {
            self.ramp.split(at, self.size_jiffies)
        } else {
            Ramp::new()
        };
        let tail = DecodedAudio {
            data: self.data.clone(),
            format: self.format,
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            channels: self.channels,
            offset_jiffies: self.offset_jiffies + at,
            size_jiffies: self.size_jiffies - at,
            track_offset: self
                .track_offset
                .map(|o| o + jiffies::to_samples(at, self.sample_rate) as u64),
            ramp: tail_ramp,
            dsd_block_words: self.dsd_block_words,
        };
        self.size_jiffies = at;
        tail
    }

    /// Overlay a ramp segment. Mutates `remaining_duration` by this
    /// fragment's size (zeroing it on early arrival at the ramp's target)
    /// and returns the value the ramp reaches, plus a split-off tail when
    /// the new segment crossed an existing opposite-direction ramp.
    pub fn set_ramp(
        &mut self,
        start: u32,
        remaining_duration: &mut u32,
        direction: Direction,
    ) -> (u32, Option<DecodedAudio>) {
        if direction == Direction::Mute {
            self.ramp.set_muted();
            return (RAMP_MIN, None);
        }
        // A residue smaller than this fragment completes on it.
        let total_remaining = (*remaining_duration).max(self.size_jiffies);
        *remaining_duration = remaining_duration.saturating_sub(self.size_jiffies);
        let (ramp_end, split) =
            match self.ramp.set(start, self.size_jiffies, total_remaining, direction) {
                Some((tail_ramp, split_pos)) => match self.try_split(split_pos) {
                    Some(mut tail) => {
                        tail.ramp = tail_ramp;
                        (tail_ramp.end(), Some(tail))
                    }
                    // Crossing point within one sample of an edge; keep the
                    // fragment whole under the head ramp.
                    None => (self.ramp.end(), None),
                },
                None => (self.ramp.end(), None),
            };
        if (direction == Direction::Up && ramp_end == RAMP_MAX)
            || (direction == Direction::Down && ramp_end == RAMP_MIN)
        {
            *remaining_duration = 0;
        }
        (ramp_end, split)
    }

    fn byte_range(&self) -> (usize, usize) {
        let frame_bytes = (self.bit_depth / 8).max(1) as usize * self.channels as usize;
        let (start, len) = match self.format {
            AudioFormat::Pcm => {
                let start =
                    jiffies::to_samples(self.offset_jiffies, self.sample_rate) as usize * frame_bytes;
                let (_, len) =
                    jiffies::to_bytes(self.size_jiffies, self.sample_rate, self.channels, self.bit_depth);
                (start, len)
            }
            AudioFormat::Dsd => {
                // 1 bit per sample per channel, byte-packed.
                let start = jiffies::to_samples(self.offset_jiffies, self.sample_rate) as usize
                    * self.channels as usize
                    / 8;
                let len = jiffies::to_samples(self.size_jiffies, self.sample_rate) as usize
                    * self.channels as usize
                    / 8;
                (start, len)
            }
        };
        (start, len)
    }

    /// Render to raw playable bytes, applying any pending ramp.
    pub fn render(&self) -> PlayableAudio {
        let data = match (&self.data, self.format) {
            (Some(buf), AudioFormat::Pcm) => {
                let (start, len) = self.byte_range();
                let mut bytes = buf[start..start + len].to_vec();
                if self.ramp.is_enabled() {
                    RampApplicator::new(&self.ramp, self.bit_depth, self.channels)
                        .apply(&mut bytes);
                }
                bytes
            }
            (Some(buf), AudioFormat::Dsd) => {
                let (start, len) = self.byte_range();
                if self.ramp.is_enabled() && self.ramp.end() == RAMP_MIN {
                    // DSD has no cheap per-sample gain; a ramp that has
                    // reached silence renders as the DSD silence pattern.
                    vec![DSD_SILENCE; len]
                } else {
                    buf[start..start + len].to_vec()
                }
            }
            (None, format) => {
                let len = match format {
                    AudioFormat::Pcm => {
                        jiffies::to_bytes(
                            self.size_jiffies,
                            self.sample_rate,
                            self.channels,
                            self.bit_depth,
                        )
                        .1
                    }
                    AudioFormat::Dsd => {
                        jiffies::to_samples(self.size_jiffies, self.sample_rate) as usize
                            * self.channels as usize
                            / 8
                    }
                };
                let fill = if format == AudioFormat::Dsd { DSD_SILENCE } else { 0 };
                vec![fill; len]
            }
        };
        PlayableAudio {
            data,
            format: self.format,
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            channels: self.channels,
            size_jiffies: self.size_jiffies,
        }
    }
}

/// Idle DSD bitstream pattern (alternating ones and zeros).
const DSD_SILENCE: u8 = 0x69;

/// Fully rendered audio: ramps applied, bytes ready for the animator.
pub struct PlayableAudio {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub size_jiffies: u32,
}

/// The closed set of pipeline message kinds.
pub enum Msg {
    Mode(Arc<ModeInfo>),
    Track(Arc<TrackInfo>),
    Drain(AckToken),
    Delay {
        remaining_jiffies: u32,
        total_jiffies: u32,
    },
    EncodedStream(Arc<EncodedStreamInfo>),
    StreamSegment {
        id: String,
    },
    AudioEncoded(EncodedAudio),
    MetaText(Arc<String>),
    StreamInterrupted,
    Halt {
        id: u32,
        ack: AckToken,
    },
    Flush {
        id: u32,
    },
    Wait,
    DecodedStream(Arc<DecodedStreamInfo>),
    BitRate {
        bits_per_sec: u32,
    },
    AudioPcm(DecodedAudio),
    AudioDsd(DecodedAudio),
    Silence(DecodedAudio),
    Playable(PlayableAudio),
    Quit,
}

impl Msg {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Msg::Mode(_) => "Mode",
            Msg::Track(_) => "Track",
            Msg::Drain(_) => "Drain",
            Msg::Delay { .. } => "Delay",
            Msg::EncodedStream(_) => "EncodedStream",
            Msg::StreamSegment { .. } => "StreamSegment",
            Msg::AudioEncoded(_) => "AudioEncoded",
            Msg::MetaText(_) => "MetaText",
            Msg::StreamInterrupted => "StreamInterrupted",
            Msg::Halt { .. } => "Halt",
            Msg::Flush { .. } => "Flush",
            Msg::Wait => "Wait",
            Msg::DecodedStream(_) => "DecodedStream",
            Msg::BitRate { .. } => "BitRate",
            Msg::AudioPcm(_) => "AudioPcm",
            Msg::AudioDsd(_) => "AudioDsd",
            Msg::Silence(_) => "Silence",
            Msg::Playable(_) => "Playable",
            Msg::Quit => "Quit",
        }
    }

    /// Jiffies of decoded audio this message carries, zero for non-audio.
    pub fn jiffies(&self) -> u32 {
        match self {
            Msg::AudioPcm(a) | Msg::AudioDsd(a) | Msg::Silence(a) => a.size_jiffies(),
            Msg::Playable(p) => p.size_jiffies,
            _ => 0,
        }
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Creates pooled audio messages. Cheap to clone; clones share pools.
#[derive(Clone)]
pub struct MsgFactory {
    encoded_pool: BufferPool,
    decoded_pool: BufferPool,
}

impl MsgFactory {
    pub fn new(config: &millrace_common::config::PoolConfig) -> Self {
        Self {
            encoded_pool: BufferPool::new(
                "encoded-audio",
                config.encoded_audio,
                config.encoded_audio_bytes,
            ),
            decoded_pool: BufferPool::new(
                "decoded-audio",
                config.decoded_audio,
                config.decoded_audio_bytes,
            ),
        }
    }

    /// Wrap encoded bytes in a pooled message. Blocks while the encoded
    /// pool is exhausted. `bytes` must fit one pool buffer.
    pub fn audio_encoded(&self, bytes: &[u8]) -> Msg {
        let mut buf = self.encoded_pool.take();
        buf.append(bytes);
        Msg::AudioEncoded(EncodedAudio { data: Arc::new(buf) })
    }

    /// Deep copy: new pooled buffer, same bytes. Used where one copy will
    /// be consumed downstream while the other is retained for replay.
    pub fn clone_audio_encoded(&self, audio: &EncodedAudio) -> EncodedAudio {
        let mut buf = self.encoded_pool.take();
        buf.append(audio.bytes());
        EncodedAudio { data: Arc::new(buf) }
    }

    pub fn audio_pcm(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
        track_offset: u64,
    ) -> Msg {
        self.pcm_inner(bytes, sample_rate, bit_depth, channels, Some(track_offset))
    }

    /// PCM with no track position. Used for synthesized audio.
    pub fn audio_pcm_untracked(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
    ) -> Msg {
        self.pcm_inner(bytes, sample_rate, bit_depth, channels, None)
    }

    fn pcm_inner(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
        track_offset: Option<u64>,
    ) -> Msg {
        let frame_bytes = (bit_depth / 8) as usize * channels as usize;
        assert_eq!(bytes.len() % frame_bytes, 0, "partial sample in pcm payload");
        let samples = (bytes.len() / frame_bytes) as u32;
        let mut buf = self.decoded_pool.take();
        buf.append(bytes);
        Msg::AudioPcm(DecodedAudio {
            data: Some(Arc::new(buf)),
            format: AudioFormat::Pcm,
            sample_rate,
            bit_depth,
            channels,
            offset_jiffies: 0,
            size_jiffies: jiffies::from_samples(samples, sample_rate),
            track_offset,
            ramp: Ramp::new(),
            dsd_block_words: 0,
        })
    }

    pub fn audio_dsd(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        channels: u32,
        block_words: u32,
        track_offset: u64,
    ) -> Msg {
        let samples = (bytes.len() * 8 / channels as usize) as u32;
        let mut buf = self.decoded_pool.take();
        buf.append(bytes);
        Msg::AudioDsd(DecodedAudio {
            data: Some(Arc::new(buf)),
            format: AudioFormat::Dsd,
            sample_rate,
            bit_depth: 1,
            channels,
            offset_jiffies: 0,
            size_jiffies: jiffies::from_samples(samples, sample_rate),
            track_offset: Some(track_offset),
            ramp: Ramp::new(),
            dsd_block_words: block_words,
        })
    }

    /// Create a silence message of at most `*size_jiffies`, rounded down
    /// to a whole number of samples; `size_jiffies` is updated to the
    /// size actually created.
    pub fn silence(
        &self,
        size_jiffies: &mut u32,
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
    ) -> Msg {
        let rounded = jiffies::round_down(*size_jiffies, sample_rate)
            .max(jiffies::per_sample(sample_rate));
        *size_jiffies = rounded;
        Msg::Silence(DecodedAudio {
            data: None,
            format: AudioFormat::Pcm,
            sample_rate,
            bit_depth,
            channels,
            offset_jiffies: 0,
            size_jiffies: rounded,
            track_offset: None,
            ramp: Ramp::new(),
            dsd_block_words: 0,
        })
    }

    pub fn silence_dsd(
        &self,
        size_jiffies: &mut u32,
        sample_rate: u32,
        channels: u32,
        block_words: u32,
    ) -> Msg {
        let grain = jiffies::per_sample(sample_rate) * 8;
        let rounded = (*size_jiffies - *size_jiffies % grain).max(grain);
        *size_jiffies = rounded;
        Msg::Silence(DecodedAudio {
            data: None,
            format: AudioFormat::Dsd,
            sample_rate,
            bit_depth: 1,
            channels,
            offset_jiffies: 0,
            size_jiffies: rounded,
            track_offset: None,
            ramp: Ramp::new(),
            dsd_block_words: block_words,
        })
    }
}
