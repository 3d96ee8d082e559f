//! Flywheel audio synthesis for starvation concealment.
//!
//! When the pipeline runs dry mid-stream there is no real audio left to
//! ramp down over, so a short tail is synthesized from the most recent
//! audio and ramped to silence instead. [`FlywheelInput`] renders the
//! retained training window into per-channel samples, a [`FlywheelSynth`]
//! extrapolates it, and [`RampGenerator`] runs the synth on its own
//! thread so the time-critical puller never waits on signal processing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use millrace_common::{jiffies, Semaphore};
use tracing::debug;

use crate::msg::{Msg, MsgFactory};
use crate::queue::MsgQueue;
use crate::ramp::{Direction, RAMP_MIN};

/// Training audio, de-interleaved: one signed 32-bit (left-aligned)
/// sample vector per channel.
pub struct TrainingBuffer {
    pub channels: Vec<Vec<i32>>,
    pub sample_rate: u32,
}

impl TrainingBuffer {
    pub fn sample_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// Extrapolates a continuation of the training signal. Implementations
/// must be cheap enough to run to completion within one output block
/// period on the generator thread.
pub trait FlywheelSynth: Send {
    fn synthesize(&mut self, training: &TrainingBuffer, sample_count: usize) -> Vec<Vec<i32>>;
}

/// Default synth: loops the tail window of the training audio. Crude next
/// to model-based prediction, but artefact-free over the ~20ms it is
/// audible for, since the output is ramped to silence throughout.
pub struct WindowedRepeat {
    /// Window length as a fraction of the training buffer.
    window_divisor: usize,
}

impl Default for WindowedRepeat {
    fn default() -> Self {
        Self { window_divisor: 4 }
    }
}

impl FlywheelSynth for WindowedRepeat {
    fn synthesize(&mut self, training: &TrainingBuffer, sample_count: usize) -> Vec<Vec<i32>> {
        let train_len = training.sample_count();
        training
            .channels
            .iter()
            .map(|samples| {
                if train_len == 0 {
                    return vec![0; sample_count];
                }
                let window = (train_len / self.window_divisor).max(1);
                let tail = &samples[train_len - window..];
                (0..sample_count).map(|i| tail[i % window]).collect()
            })
            .collect()
    }
}

/// Renders queued audio messages into a [`TrainingBuffer`].
pub struct FlywheelInput;

impl FlywheelInput {
    /// Consume `queue` (decoded PCM and silence only), clearing any ramps
    /// so the synth trains on the unramped signal.
    pub fn prepare(queue: &mut MsgQueue, sample_rate: u32, channels: u32) -> TrainingBuffer {
        let mut out: Vec<Vec<i32>> = (0..channels).map(|_| Vec::new()).collect();
        while let Some(msg) = queue.dequeue() {
            let mut audio = match msg {
                Msg::AudioPcm(a) | Msg::Silence(a) => a,
                other => unreachable!("{} in flywheel training queue", other.kind_name()),
            };
            audio.clear_ramp();
            let playable = audio.render();
            debug_assert_eq!(playable.sample_rate, sample_rate);
            debug_assert_eq!(playable.channels, channels);
            deinterleave(&playable.data, playable.bit_depth, channels, &mut out);
        }
        TrainingBuffer {
            channels: out,
            sample_rate,
        }
    }
}

fn deinterleave(data: &[u8], bit_depth: u32, channels: u32, out: &mut [Vec<i32>]) {
    let sub = (bit_depth / 8) as usize;
    let mut offset = 0;
    while offset + sub * channels as usize <= data.len() {
        for channel in out.iter_mut() {
            let bytes = &data[offset..offset + sub];
            let value = match sub {
                1 => (bytes[0] as i8 as i32) << 24,
                2 => (i16::from_be_bytes([bytes[0], bytes[1]]) as i32) << 16,
                3 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]),
                4 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                _ => unreachable!("unsupported subsample width"),
            };
            channel.push(value);
            offset += sub;
        }
    }
}

fn interleave(channels: &[Vec<i32>], bit_depth: u32, range: std::ops::Range<usize>) -> Vec<u8> {
    let sub = (bit_depth / 8) as usize;
    let mut data = Vec::with_capacity(range.len() * sub * channels.len());
    for i in range {
        for channel in channels {
            let be = channel[i].to_be_bytes();
            data.extend_from_slice(&be[..sub]);
        }
    }
    data
}

struct WorkItem {
    training: TrainingBuffer,
    channels: u32,
    bit_depth: u32,
    ramp_start: u32,
    remaining_ramp: u32,
}

struct GeneratorShared {
    work: Mutex<Option<WorkItem>>,
    work_sem: Semaphore,
    out: Mutex<MsgQueue>,
    out_sem: Semaphore,
    active: AtomicBool,
    exit: AtomicBool,
}

/// Owns the flywheel worker thread. `start` hands over a training buffer;
/// the thread emits ramped-down PCM blocks which the pipeline consumer
/// pulls via `try_get_audio` until the synthesized tail is exhausted.
pub struct RampGenerator {
    shared: Arc<GeneratorShared>,
    ramp_jiffies: u32,
    thread: Option<JoinHandle<()>>,
}

impl RampGenerator {
    pub fn new(
        factory: MsgFactory,
        ramp_jiffies: u32,
        block_jiffies: u32,
        mut synth: Box<dyn FlywheelSynth>,
    ) -> Self {
        let shared = Arc::new(GeneratorShared {
            work: Mutex::new(None),
            work_sem: Semaphore::new(0),
            out: Mutex::new(MsgQueue::new()),
            out_sem: Semaphore::new(0),
            active: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("flywheel-ramper".into())
            .spawn(move || loop {
                worker.work_sem.wait();
                if worker.exit.load(Ordering::Acquire) {
                    break;
                }
                let item = worker.work.lock().unwrap().take();
                if let Some(item) = item {
                    generate(&worker, &factory, &mut *synth, item, block_jiffies);
                }
            })
            .expect("spawn flywheel thread");
        Self {
            shared,
            ramp_jiffies,
            thread: Some(thread),
        }
    }

    /// Kick off generation of a ramped tail continuing `training`.
    pub fn start(
        &self,
        training: TrainingBuffer,
        channels: u32,
        bit_depth: u32,
        ramp_start: u32,
    ) {
        let sample_rate = training.sample_rate;
        let gen_samples = jiffies::to_samples(self.ramp_jiffies, sample_rate);
        let remaining_ramp = jiffies::per_sample(sample_rate) * gen_samples;
        debug!(ramp_start, sample_rate, "starting flywheel ramp");
        *self.shared.work.lock().unwrap() = Some(WorkItem {
            training,
            channels,
            bit_depth,
            ramp_start,
            remaining_ramp,
        });
        self.shared.out_sem.clear();
        self.shared.active.store(true, Ordering::Release);
        self.shared.work_sem.signal();
    }

    /// Next block of synthesized audio, or `None` once the tail is spent.
    /// Blocks while generation is still in progress.
    pub fn try_get_audio(&self) -> Option<Msg> {
        let idle = |shared: &GeneratorShared| {
            !shared.active.load(Ordering::Acquire) && shared.out.lock().unwrap().is_empty()
        };
        if idle(&self.shared) {
            return None;
        }
        self.shared.out_sem.wait();
        if idle(&self.shared) {
            return None;
        }
        self.shared.out.lock().unwrap().dequeue()
    }
}

impl Drop for RampGenerator {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.work_sem.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn generate(
    shared: &GeneratorShared,
    factory: &MsgFactory,
    synth: &mut dyn FlywheelSynth,
    item: WorkItem,
    block_jiffies: u32,
) {
    let sample_rate = item.training.sample_rate;
    let per_sample = jiffies::per_sample(sample_rate);
    let total_samples = (item.remaining_ramp / per_sample) as usize;
    let synthesized = synth.synthesize(&item.training, total_samples);
    let block_samples = jiffies::to_samples(block_jiffies, sample_rate).max(1) as usize;

    let mut current_ramp = item.ramp_start;
    let mut remaining_ramp = item.remaining_ramp;
    let mut offset = 0;
    while offset < total_samples {
        let end = (offset + block_samples).min(total_samples);
        let bytes = interleave(&synthesized, item.bit_depth, offset..end);
        let mut audio = match factory.audio_pcm_untracked(
            &bytes,
            sample_rate,
            item.bit_depth,
            item.channels,
        ) {
            Msg::AudioPcm(a) => a,
            other => unreachable!("{} from factory", other.kind_name()),
        };
        if current_ramp == RAMP_MIN {
            audio.set_muted();
        } else {
            let (end_value, split) =
                audio.set_ramp(current_ramp, &mut remaining_ramp, Direction::Down);
            debug_assert!(split.is_none(), "fresh audio cannot split on ramp");
            current_ramp = end_value;
        }
        shared.out.lock().unwrap().enqueue(Msg::AudioPcm(audio));
        shared.out_sem.signal();
        offset = end;
    }
    shared.active.store(false, Ordering::Release);
    shared.out_sem.signal();
}
