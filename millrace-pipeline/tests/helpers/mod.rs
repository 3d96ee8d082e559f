//! Shared test doubles for the flow-control element tests.
//!
//! Provides scripted upstream elements, recording stream handlers and
//! observers, and message builders with sensible PCM/DSD defaults.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use millrace_common::config::PoolConfig;
use millrace_pipeline::element::{
    Animator, ClockPuller, DelayObserver, FormatUnsupported, StreamHandler, StreamPlay,
};
use millrace_pipeline::msg::{
    AudioFormat, DecodedAudio, DecodedStreamInfo, EncodedStreamInfo, ModeInfo, Msg, MsgFactory,
    TrackInfo,
};
use millrace_pipeline::UpstreamElement;

pub fn factory() -> MsgFactory {
    MsgFactory::new(&PoolConfig::default())
}

/// Upstream element fed from a fixed script. Panics if pulled past the
/// end, so tests fail loudly on unexpected extra pulls.
pub struct ScriptedUpstream {
    msgs: VecDeque<Msg>,
}

impl ScriptedUpstream {
    pub fn new(msgs: Vec<Msg>) -> Self {
        Self { msgs: msgs.into() }
    }
}

impl UpstreamElement for ScriptedUpstream {
    fn pull(&mut self) -> Msg {
        self.msgs.pop_front().expect("upstream script exhausted")
    }
}

/// Upstream element fed from a channel, for elements that pull on their
/// own thread. Blocks until the test sends the next message.
pub struct ChannelUpstream {
    rx: mpsc::Receiver<Msg>,
}

pub fn channel_upstream() -> (mpsc::Sender<Msg>, ChannelUpstream) {
    let (tx, rx) = mpsc::channel();
    (tx, ChannelUpstream { rx })
}

impl UpstreamElement for ChannelUpstream {
    fn pull(&mut self) -> Msg {
        self.rx.recv().expect("upstream script channel closed")
    }
}

/// Stream handler that records every escalation it receives.
#[derive(Default)]
pub struct RecordingHandler {
    pub seek_calls: Mutex<Vec<(u32, u64)>>,
    pub stop_calls: Mutex<Vec<u32>>,
    pub discard_calls: Mutex<Vec<u32>>,
    pub starving_events: Mutex<Vec<(String, u32, bool)>>,
    /// Flush id returned from `try_discard`; zero means "cannot service".
    pub discard_flush_id: AtomicU32,
    pub stop_flush_id: AtomicU32,
}

impl StreamHandler for RecordingHandler {
    fn ok_to_play(&self, _stream_id: u32) -> StreamPlay {
        StreamPlay::Yes
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        self.seek_calls.lock().unwrap().push((stream_id, offset));
        0
    }

    fn try_discard(&self, jiffies: u32) -> u32 {
        self.discard_calls.lock().unwrap().push(jiffies);
        self.discard_flush_id.load(Ordering::Acquire)
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        self.stop_calls.lock().unwrap().push(stream_id);
        self.stop_flush_id.load(Ordering::Acquire)
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        self.starving_events
            .lock()
            .unwrap()
            .push((mode.to_string(), stream_id, starving));
    }
}

/// Clock puller counting start/stop calls.
#[derive(Default)]
pub struct CountingPuller {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl ClockPuller for CountingPuller {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::AcqRel);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
    }
}

/// Delay observer recording every notification.
#[derive(Default)]
pub struct RecordingDelayObserver {
    pub notifications: Mutex<Vec<u32>>,
}

impl DelayObserver for RecordingDelayObserver {
    fn notify_delay_applied(&self, jiffies: u32) {
        self.notifications.lock().unwrap().push(jiffies);
    }
}

/// Animator with a fixed latency for every format.
pub struct FixedAnimator {
    pub latency_jiffies: u32,
    pub block_words: u32,
}

impl Animator for FixedAnimator {
    fn delay_jiffies(
        &self,
        _format: AudioFormat,
        _sample_rate: u32,
        _bit_depth: u32,
        _channels: u32,
    ) -> Result<u32, FormatUnsupported> {
        Ok(self.latency_jiffies)
    }

    fn dsd_block_words(&self) -> Result<u32, FormatUnsupported> {
        Ok(self.block_words)
    }

    fn max_bit_depth(&self) -> u32 {
        24
    }
}

pub fn mode(name: &str) -> Msg {
    Msg::Mode(Arc::new(ModeInfo {
        name: name.to_string(),
        supports_latency: true,
        clock_puller: None,
    }))
}

pub fn mode_with_puller(name: &str, puller: Arc<dyn ClockPuller>) -> Msg {
    Msg::Mode(Arc::new(ModeInfo {
        name: name.to_string(),
        supports_latency: true,
        clock_puller: Some(puller),
    }))
}

pub fn track(id: u32) -> Msg {
    Msg::Track(Arc::new(TrackInfo {
        uri: format!("test://track/{id}"),
        metadata: String::new(),
        id,
    }))
}

pub fn encoded_stream(stream_id: u32, handler: Arc<dyn StreamHandler>) -> Msg {
    Msg::EncodedStream(Arc::new(EncodedStreamInfo {
        uri: format!("test://stream/{stream_id}"),
        stream_id,
        total_bytes: 0,
        seekable: true,
        live: false,
        stream_handler: handler,
    }))
}

/// 44.1kHz / 16-bit / stereo PCM stream descriptor.
pub fn decoded_stream(stream_id: u32, handler: Arc<dyn StreamHandler>) -> Msg {
    Msg::DecodedStream(Arc::new(DecodedStreamInfo {
        stream_id,
        bit_rate: 1_411_200,
        bit_depth: 16,
        sample_rate: 44_100,
        channels: 2,
        codec_name: "test-pcm".to_string(),
        track_length_jiffies: 0,
        sample_start: 0,
        lossless: true,
        seekable: true,
        live: false,
        format: AudioFormat::Pcm,
        stream_handler: handler,
    }))
}

/// DSD64 stereo stream descriptor.
pub fn decoded_stream_dsd(stream_id: u32, handler: Arc<dyn StreamHandler>) -> Msg {
    Msg::DecodedStream(Arc::new(DecodedStreamInfo {
        stream_id,
        bit_rate: 5_644_800,
        bit_depth: 1,
        sample_rate: 2_822_400,
        channels: 2,
        codec_name: "test-dsd".to_string(),
        track_length_jiffies: 0,
        sample_start: 0,
        lossless: true,
        seekable: false,
        live: false,
        format: AudioFormat::Dsd,
        stream_handler: handler,
    }))
}

/// PCM audio of `samples` stereo 16-bit frames, 0x4040 per subsample so
/// ramp attenuation is observable in the rendered bytes.
pub fn pcm(factory: &MsgFactory, samples: u32, track_offset: u64) -> Msg {
    let bytes = vec![0x40u8; samples as usize * 4];
    factory.audio_pcm(&bytes, 44_100, 16, 2, track_offset)
}

/// DSD64 stereo audio of `samples` frames (must be a multiple of 8).
pub fn dsd(factory: &MsgFactory, samples: u32, track_offset: u64) -> Msg {
    assert_eq!(samples % 8, 0);
    let bytes = vec![0x55u8; samples as usize * 2 / 8];
    factory.audio_dsd(&bytes, 2_822_400, 2, 16, track_offset)
}

pub fn expect_audio(msg: Msg) -> DecodedAudio {
    match msg {
        Msg::AudioPcm(a) | Msg::AudioDsd(a) | Msg::Silence(a) => a,
        other => panic!("expected audio, got {other:?}"),
    }
}

pub fn expect_pcm(msg: Msg) -> DecodedAudio {
    match msg {
        Msg::AudioPcm(a) => a,
        other => panic!("expected AudioPcm, got {other:?}"),
    }
}

pub fn expect_silence(msg: Msg) -> DecodedAudio {
    match msg {
        Msg::Silence(a) => a,
        other => panic!("expected Silence, got {other:?}"),
    }
}

pub fn encoded_bytes(msg: Msg) -> Vec<u8> {
    match msg {
        Msg::AudioEncoded(a) => a.bytes().to_vec(),
        other => panic!("expected AudioEncoded, got {other:?}"),
    }
}
