//! Starvation concealment at the tail of the decoded chain.
//!
//! A dedicated puller thread keeps a bounded reservoir topped up from
//! upstream so the time-critical consumer never waits on the network or
//! codec. When the reservoir empties mid-stream anyway, the element ramps
//! into a synthesized flywheel tail ([`crate::flywheel`]) instead of
//! going silent abruptly, tells the stream handler it is starving, emits
//! a halt, and ramps back up once real audio returns.
//!
//! Audio leaves in chunks of at most `MAX_AUDIO_OUT_JIFFIES` so a
//! starvation event is detected within a few milliseconds of audio
//! rather than at the end of whatever oversized message was in flight.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use millrace_common::observer::{NotifierThread, NotifyId};
use millrace_common::{jiffies, Semaphore};
use tracing::{debug, trace, warn};

use crate::element::{StreamHandler, UpstreamElement, FLUSH_ID_INVALID, HALT_ID_NONE};
use crate::flywheel::{FlywheelInput, FlywheelSynth, RampGenerator};
use crate::msg::{AckToken, AudioFormat, DecodedAudio, Msg, MsgFactory};
use crate::queue::{MsgQueue, Reservoir};
use crate::ramp::{Direction, RAMP_MAX, RAMP_MIN};

/// Audio retained for flywheel training.
pub const TRAINING_JIFFIES: u32 = jiffies::PER_MS;
/// Length of a synthesized (or emergency) ramp down.
pub const RAMP_DOWN_JIFFIES: u32 = 20 * jiffies::PER_MS;
/// Largest audio chunk passed downstream.
pub const MAX_AUDIO_OUT_JIFFIES: u32 = 5 * jiffies::PER_MS;
/// Floor applied when a `Delay` message resizes the reservoir.
const MIN_DELAY_CEILING_JIFFIES: u64 = 140 * jiffies::PER_MS as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    RampingDown,
    FlywheelRamping,
    RampingUp,
    Halted,
    Flushing,
}

/// State shared with the puller thread.
struct Shared {
    reservoir: Mutex<Reservoir>,
    /// Signalled per enqueued message; the consumer's blocking dequeue.
    items_sem: Semaphore,
    /// Puller parks here while the reservoir is full.
    space_sem: Semaphore,
    start_occupancy_sem: Semaphore,
    start_occupancy_jiffies: AtomicU64,
    max_jiffies: AtomicU64,
    max_stream_count: usize,
    track_stream_count: AtomicU32,
    drain_count: AtomicU32,
    halt_count: AtomicU32,
    pending_flush_id: AtomicU32,
    start_drain: AtomicBool,
    draining: AtomicBool,
    exit: AtomicBool,
}

impl Shared {
    fn is_full(&self, reservoir: &Reservoir) -> bool {
        reservoir.jiffies() >= self.max_jiffies.load(Ordering::Acquire)
            || reservoir.decoded_stream_count() >= self.max_stream_count
    }

    fn jiffies(&self) -> u64 {
        self.reservoir.lock().unwrap().jiffies()
    }
}

pub struct StarvationRamper {
    factory: MsgFactory,
    shared: Arc<Shared>,
    generator: RampGenerator,
    puller: Option<JoinHandle<()>>,

    state: State,
    exit: bool,
    mode: String,
    starving: bool,
    stream_id: u32,
    sample_rate: u32,
    bit_depth: u32,
    channels: u32,
    format: Option<AudioFormat>,
    stream_handler: Option<Arc<dyn StreamHandler>>,
    current_ramp: u32,
    remaining_ramp: u32,
    target_flush_id: u32,
    last_pulled_ramp: u32,
    ramp_up_jiffies: u32,
    recent_audio: MsgQueue,
    recent_audio_jiffies: u32,

    // Buffering notifications are debounced through the notifier thread
    // so rapid empty/full flapping produces at most one callback.
    notifier: Arc<NotifierThread>,
    event_id: NotifyId,
    event_buffering: Arc<AtomicBool>,
}

impl StarvationRamper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: MsgFactory,
        upstream: Box<dyn UpstreamElement + Send>,
        notifier: Arc<NotifierThread>,
        on_buffering: Box<dyn Fn(bool) + Send + Sync>,
        max_jiffies: u32,
        ramp_up_jiffies: u32,
        max_stream_count: usize,
        synth: Box<dyn FlywheelSynth>,
    ) -> Self {
        let shared = Arc::new(Shared {
            reservoir: Mutex::new(Reservoir::new()),
            items_sem: Semaphore::new(0),
            space_sem: Semaphore::new(0),
            start_occupancy_sem: Semaphore::new(0),
            start_occupancy_jiffies: AtomicU64::new(0),
            max_jiffies: AtomicU64::new(max_jiffies as u64),
            max_stream_count,
            track_stream_count: AtomicU32::new(0),
            drain_count: AtomicU32::new(0),
            halt_count: AtomicU32::new(0),
            pending_flush_id: AtomicU32::new(FLUSH_ID_INVALID),
            start_drain: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        });

        let event_buffering = Arc::new(AtomicBool::new(false));
        let event_id = {
            let flag = Arc::clone(&event_buffering);
            let last = Mutex::new(false);
            notifier.register(Box::new(move || {
                let buffering = flag.load(Ordering::Acquire);
                let mut last = last.lock().unwrap();
                if buffering != *last {
                    on_buffering(buffering);
                    *last = buffering;
                }
            }))
        };

        let generator = RampGenerator::new(
            factory.clone(),
            RAMP_DOWN_JIFFIES,
            MAX_AUDIO_OUT_JIFFIES,
            synth,
        );

        let puller = {
            let shared = Arc::clone(&shared);
            let mut upstream = upstream;
            std::thread::Builder::new()
                .name("starvation-ramper".into())
                .spawn(move || puller_thread(&shared, upstream.as_mut()))
                .expect("spawn puller thread")
        };

        let mut ramper = Self {
            factory,
            shared,
            generator,
            puller: Some(puller),
            state: State::Halted,
            exit: false,
            mode: String::new(),
            starving: false,
            stream_id: 0,
            sample_rate: 0,
            bit_depth: 0,
            channels: 0,
            format: None,
            stream_handler: None,
            current_ramp: RAMP_MIN,
            remaining_ramp: 0,
            target_flush_id: FLUSH_ID_INVALID,
            last_pulled_ramp: RAMP_MAX,
            ramp_up_jiffies,
            recent_audio: MsgQueue::new(),
            recent_audio_jiffies: 0,
            notifier,
            event_id,
            event_buffering,
        };
        ramper.set_buffering(true);
        ramper
    }

    /// Decoded audio currently buffered.
    pub fn jiffies(&self) -> u64 {
        self.shared.jiffies()
    }

    /// Begin a ramp down, then discard everything until the flush with
    /// this id emerges. Callable from any thread; takes effect at the
    /// next pull.
    pub fn flush(&self, id: u32) {
        self.shared.pending_flush_id.store(id, Ordering::Release);
    }

    /// Discard all buffered audio until the pending `Drain` emerges.
    pub fn drain_all_audio(&self) {
        self.shared.start_drain.store(true, Ordering::Release);
    }

    /// Defer the next pull until at least `target_jiffies` are buffered.
    /// Ignored when a drain or halt is already queued, since those imply
    /// no more audio is coming.
    pub fn wait_for_occupancy(&self, target_jiffies: u32) {
        if self.shared.drain_count.load(Ordering::Acquire) > 0
            || self.shared.halt_count.load(Ordering::Acquire) > 0
        {
            return;
        }
        self.shared.start_occupancy_sem.clear();
        self.shared
            .start_occupancy_jiffies
            .store(target_jiffies as u64, Ordering::Release);
    }

    pub fn pull(&mut self) -> Msg {
        self.take_pending_flush();
        self.occupancy_gate();

        let start_drain = self.shared.start_drain.load(Ordering::Acquire);
        if self.shared.reservoir.lock().unwrap().is_empty() || start_drain {
            self.set_buffering(true);
            if start_drain {
                self.shared.start_drain.store(false, Ordering::Release);
                self.shared.draining.store(true, Ordering::Release);
            }
            if (self.state == State::Running
                || (self.state == State::RampingUp && self.current_ramp != RAMP_MIN))
                && !self.exit
            {
                self.start_flywheel_ramp();
            }
        }

        loop {
            if let Some(msg) = self.generator.try_get_audio() {
                return msg;
            }
            if self.state == State::FlywheelRamping {
                // Flywheel tail fully played out; announce the gap and
                // arm the ramp up for when audio returns.
                self.state = State::RampingUp;
                self.current_ramp = RAMP_MIN;
                self.remaining_ramp = self.ramp_up_jiffies;
                return Msg::Halt {
                    id: HALT_ID_NONE,
                    ack: AckToken::none(),
                };
            }

            let was_flushing = self.state == State::Flushing;
            let msg = self.dequeue_blocking();
            let out = self.process_msg_out(msg);
            if was_flushing && self.state == State::Flushing && out.is_some() {
                continue;
            }
            if let Some(msg) = out {
                return msg;
            }
        }
    }

    fn take_pending_flush(&mut self) {
        let id = self
            .shared
            .pending_flush_id
            .swap(FLUSH_ID_INVALID, Ordering::AcqRel);
        if id != FLUSH_ID_INVALID {
            debug!(flush_id = id, "ramping down towards flush");
            self.target_flush_id = id;
            self.current_ramp = RAMP_MAX;
            self.remaining_ramp = RAMP_DOWN_JIFFIES;
            self.state = State::RampingDown;
        }
    }

    fn occupancy_gate(&self) {
        let target = self.shared.start_occupancy_jiffies.load(Ordering::Acquire);
        if target > 0
            && self.shared.drain_count.load(Ordering::Acquire) == 0
            && self.shared.halt_count.load(Ordering::Acquire) == 0
        {
            if self.shared.jiffies() < target {
                self.shared.start_occupancy_sem.wait();
            }
            self.shared.start_occupancy_jiffies.store(0, Ordering::Release);
        }
    }

    fn dequeue_blocking(&self) -> Msg {
        self.shared.items_sem.wait();
        let mut reservoir = self.shared.reservoir.lock().unwrap();
        let msg = reservoir.dequeue().expect("items_sem out of step");
        if !self.shared.is_full(&reservoir) {
            self.shared.space_sem.signal();
        }
        msg
    }

    fn enqueue_at_head(&self, msg: Msg) {
        self.shared.reservoir.lock().unwrap().enqueue_at_head(msg);
        self.shared.items_sem.signal();
    }

    fn new_stream(&mut self) {
        self.state = State::Starting;
        self.recent_audio.clear();
        self.recent_audio_jiffies = 0;
        self.stream_id = 0;
        self.last_pulled_ramp = RAMP_MAX;
    }

    fn set_buffering(&self, buffering: bool) {
        let prev = self.event_buffering.swap(buffering, Ordering::AcqRel);
        if prev != buffering {
            self.notifier.schedule(self.event_id);
        }
    }

    fn notify_starving(&mut self, starving: bool) {
        self.starving = starving;
        if let Some(handler) = &self.stream_handler {
            handler.notify_starving(&self.mode, self.stream_id, starving);
        }
    }

    fn start_flywheel_ramp(&mut self) {
        debug!(
            buffered_ms = jiffies::to_ms(self.recent_audio_jiffies),
            "starting flywheel ramp"
        );
        if self.format == Some(AudioFormat::Dsd) {
            // No flywheel for DSD; jump straight to the post-tail state
            // so the next pull emits a halt.
            self.recent_audio.clear();
            self.recent_audio_jiffies = 0;
            self.state = State::FlywheelRamping;
            self.notify_starving(true);
            return;
        }
        if self.recent_audio_jiffies > TRAINING_JIFFIES {
            // Trim the oldest audio down to the training window.
            let mut excess = self.recent_audio_jiffies - TRAINING_JIFFIES;
            while excess > 0 {
                let mut audio = match self.recent_audio.dequeue() {
                    Some(Msg::AudioPcm(a)) | Some(Msg::Silence(a)) => a,
                    other => unreachable!("{:?} in training queue", other),
                };
                if audio.size_jiffies() > excess {
                    if let Some(tail) = audio.try_split(excess) {
                        self.recent_audio.enqueue_at_head(Msg::AudioPcm(tail));
                    }
                }
                let dropped = audio.size_jiffies();
                excess = excess.saturating_sub(dropped);
                self.recent_audio_jiffies -= dropped;
            }
        } else {
            // Pad the front with silence so the synth always trains on a
            // full window.
            let mut remaining = TRAINING_JIFFIES - self.recent_audio_jiffies;
            while remaining > 0 {
                let mut size = remaining.min(MAX_AUDIO_OUT_JIFFIES);
                let silence = self.factory.silence(
                    &mut size,
                    self.sample_rate,
                    self.bit_depth,
                    self.channels,
                );
                self.recent_audio.enqueue_at_head(silence);
                remaining = remaining.saturating_sub(size);
                self.recent_audio_jiffies += size;
            }
        }

        let training =
            FlywheelInput::prepare(&mut self.recent_audio, self.sample_rate, self.channels);
        self.recent_audio_jiffies = 0;
        self.generator
            .start(training, self.channels, self.bit_depth, self.current_ramp);
        self.state = State::FlywheelRamping;
        self.notify_starving(true);
    }

    /// Track recent audio for flywheel training, capped to the training
    /// window, and clear any starvation flag now that audio is flowing.
    fn process_audio_out(&mut self, audio: &DecodedAudio, silence: bool) {
        if self.starving {
            self.notify_starving(false);
        }
        if self.format == Some(AudioFormat::Dsd) {
            return;
        }
        self.last_pulled_ramp = audio.ramp().end();

        let clone = audio.share();
        self.recent_audio_jiffies += clone.size_jiffies();
        self.recent_audio.enqueue(if silence {
            Msg::Silence(clone)
        } else {
            Msg::AudioPcm(clone)
        });
        if self.recent_audio_jiffies > TRAINING_JIFFIES && self.recent_audio.len() > 1 {
            let audio = match self.recent_audio.dequeue() {
                Some(msg) => msg,
                None => return,
            };
            let size = audio.jiffies();
            self.recent_audio_jiffies -= size;
            if self.recent_audio_jiffies < TRAINING_JIFFIES {
                self.recent_audio.enqueue_at_head(audio);
                self.recent_audio_jiffies += size;
            }
        }
    }

    fn apply_ramp(&mut self, audio: &mut DecodedAudio) {
        if audio.size_jiffies() > self.remaining_ramp {
            if let Some(tail) = audio.try_split(self.remaining_ramp) {
                self.enqueue_at_head(wrap_audio(tail));
            }
        }
        let direction = if self.state == State::RampingUp {
            Direction::Up
        } else {
            Direction::Down
        };
        let (end, split) = audio.set_ramp(self.current_ramp, &mut self.remaining_ramp, direction);
        self.current_ramp = end;
        if let Some(split) = split {
            self.enqueue_at_head(wrap_audio(split));
        }
        if self.remaining_ramp == 0 {
            if self.state == State::RampingUp {
                self.state = State::Running;
            } else if self.target_flush_id != FLUSH_ID_INVALID {
                self.state = State::Flushing;
            } else {
                // Emergency ramp complete; route through the flywheel
                // state so a halt is emitted before ramping back up.
                self.state = State::FlywheelRamping;
            }
        }
    }

    fn process_msg_out(&mut self, msg: Msg) -> Option<Msg> {
        match msg {
            Msg::Mode(info) => {
                self.new_stream();
                self.mode = info.name.clone();
                Some(Msg::Mode(info))
            }
            Msg::Track(_) => {
                self.new_stream();
                self.shared.track_stream_count.fetch_sub(1, Ordering::AcqRel);
                None
            }
            Msg::Drain(ack) => {
                self.shared.drain_count.fetch_sub(1, Ordering::AcqRel);
                self.shared.draining.store(false, Ordering::Release);
                if self.state == State::Running
                    || (self.state == State::RampingUp && self.current_ramp != RAMP_MIN)
                {
                    // Ramp to silence before acknowledging the drain.
                    self.enqueue_at_head(Msg::Drain(ack));
                    self.set_buffering(true);
                    self.start_flywheel_ramp();
                    None
                } else {
                    Some(Msg::Drain(ack))
                }
            }
            Msg::MetaText(_) | Msg::Wait => None,
            Msg::Halt { id, ack } => {
                self.state = State::Halted;
                self.shared.halt_count.fetch_sub(1, Ordering::AcqRel);
                Some(Msg::Halt { id, ack })
            }
            Msg::Flush { id } => {
                if self.target_flush_id != FLUSH_ID_INVALID && id == self.target_flush_id {
                    if self.state == State::RampingDown {
                        self.start_flywheel_ramp();
                    } else if self.state == State::Flushing {
                        self.state = State::Halted;
                        self.target_flush_id = FLUSH_ID_INVALID;
                        return Some(Msg::Halt {
                            id: HALT_ID_NONE,
                            ack: AckToken::none(),
                        });
                    }
                }
                None
            }
            Msg::DecodedStream(info) => {
                self.new_stream();
                self.shared.track_stream_count.fetch_sub(1, Ordering::AcqRel);
                self.stream_id = info.stream_id;
                self.stream_handler = Some(Arc::clone(&info.stream_handler));
                self.sample_rate = info.sample_rate;
                self.bit_depth = info.bit_depth;
                self.channels = info.channels;
                self.format = Some(info.format);
                self.current_ramp = RAMP_MAX;
                Some(Msg::DecodedStream(info))
            }
            Msg::AudioPcm(audio) => self.process_pcm_out(audio),
            Msg::AudioDsd(audio) => self.process_dsd_out(audio),
            Msg::Silence(mut audio) => {
                if self.shared.draining.load(Ordering::Acquire) {
                    return None;
                }
                if self.state == State::Halted {
                    self.state = State::Starting;
                }
                if audio.size_jiffies() > MAX_AUDIO_OUT_JIFFIES {
                    let tail = audio.split(MAX_AUDIO_OUT_JIFFIES);
                    self.enqueue_at_head(Msg::Silence(tail));
                }
                self.process_audio_out(&audio, true);
                Some(Msg::Silence(audio))
            }
            Msg::Delay {
                remaining_jiffies,
                total_jiffies,
            } => Some(Msg::Delay {
                remaining_jiffies,
                total_jiffies,
            }),
            Msg::StreamInterrupted => Some(Msg::StreamInterrupted),
            Msg::BitRate { bits_per_sec } => Some(Msg::BitRate { bits_per_sec }),
            Msg::Quit => {
                self.exit = true;
                Some(Msg::Quit)
            }
            other => unreachable!("{} at starvation ramper", other.kind_name()),
        }
    }

    fn process_pcm_out(&mut self, mut audio: DecodedAudio) -> Option<Msg> {
        if self.shared.draining.load(Ordering::Acquire) {
            return None;
        }
        if self.state == State::Starting || self.state == State::Halted {
            self.state = State::Running;
        }
        if audio.size_jiffies() > MAX_AUDIO_OUT_JIFFIES {
            let tail = audio.split(MAX_AUDIO_OUT_JIFFIES);
            self.enqueue_at_head(Msg::AudioPcm(tail));
        }
        if (self.state == State::RampingUp || self.state == State::RampingDown)
            && self.remaining_ramp > 0
        {
            if audio.size_jiffies() > self.remaining_ramp {
                if let Some(tail) = audio.try_split(self.remaining_ramp) {
                    self.enqueue_at_head(Msg::AudioPcm(tail));
                }
            }
            let direction = if self.state == State::RampingUp {
                Direction::Up
            } else {
                Direction::Down
            };
            let (end, split) =
                audio.set_ramp(self.current_ramp, &mut self.remaining_ramp, direction);
            self.current_ramp = end;
            if let Some(split) = split {
                self.enqueue_at_head(Msg::AudioPcm(split));
            }
            if self.remaining_ramp == 0 {
                if self.state == State::RampingUp {
                    self.state = State::Running;
                } else {
                    self.state = State::Flushing;
                }
            }
        }
        self.process_audio_out(&audio, false);
        self.set_buffering(false);
        Some(Msg::AudioPcm(audio))
    }

    /// DSD cannot be flywheel-extended, so starvation is pre-empted: as
    /// soon as the buffer drops below one ramp's worth of audio, ramp
    /// down over everything that remains.
    fn process_dsd_out(&mut self, mut audio: DecodedAudio) -> Option<Msg> {
        if self.shared.draining.load(Ordering::Acquire) {
            return None;
        }
        if self.state == State::Starting || self.state == State::Halted {
            self.state = State::Running;
        }
        if audio.size_jiffies() > MAX_AUDIO_OUT_JIFFIES {
            let tail = audio.split(MAX_AUDIO_OUT_JIFFIES);
            self.enqueue_at_head(Msg::AudioDsd(tail));
        }
        let buffered = self.shared.jiffies();
        let low_water = buffered <= RAMP_DOWN_JIFFIES as u64
            && self.shared.halt_count.load(Ordering::Acquire) == 0
            && self.shared.track_stream_count.load(Ordering::Acquire) == 0;
        match self.state {
            State::Running => {
                if low_water {
                    self.state = State::RampingDown;
                    self.current_ramp = RAMP_MAX;
                    self.remaining_ramp = audio.size_jiffies() + buffered as u32;
                    self.apply_ramp(&mut audio);
                }
            }
            State::RampingDown => {
                self.apply_ramp(&mut audio);
                if self.state == State::FlywheelRamping {
                    self.notify_starving(true);
                }
            }
            State::RampingUp => {
                if low_water {
                    // Less audio than a full emergency ramp needs; head
                    // back towards silence immediately.
                    if self.current_ramp == RAMP_MIN {
                        audio.set_muted();
                    } else {
                        self.state = State::RampingDown;
                        self.remaining_ramp = audio.size_jiffies() + buffered as u32;
                        self.apply_ramp(&mut audio);
                    }
                } else {
                    self.apply_ramp(&mut audio);
                }
            }
            _ => {}
        }
        self.process_audio_out(&audio, false);
        self.set_buffering(false);
        Some(Msg::AudioDsd(audio))
    }
}

fn wrap_audio(audio: DecodedAudio) -> Msg {
    if !audio.has_payload() {
        Msg::Silence(audio)
    } else if audio.format == AudioFormat::Dsd {
        Msg::AudioDsd(audio)
    } else {
        Msg::AudioPcm(audio)
    }
}

fn puller_thread(shared: &Shared, upstream: &mut dyn UpstreamElement) {
    loop {
        let msg = upstream.pull();
        process_msg_in(shared, &msg);
        let (is_full, trigger_start) = {
            let mut reservoir = shared.reservoir.lock().unwrap();
            reservoir.enqueue(msg);
            let is_full = shared.is_full(&reservoir);
            if is_full {
                shared.space_sem.clear();
            }
            let target = shared.start_occupancy_jiffies.load(Ordering::Acquire);
            (is_full, target > 0 && reservoir.jiffies() >= target)
        };
        shared.items_sem.signal();
        if trigger_start {
            shared.start_occupancy_sem.signal();
        }
        if is_full {
            trace!("reservoir full, puller waiting");
            shared.space_sem.wait();
        }
        if shared.exit.load(Ordering::Acquire) {
            break;
        }
    }
}

fn process_msg_in(shared: &Shared, msg: &Msg) {
    match msg {
        Msg::Track(_) | Msg::DecodedStream(_) => {
            shared.track_stream_count.fetch_add(1, Ordering::AcqRel);
        }
        Msg::Drain(_) => {
            shared.drain_count.fetch_add(1, Ordering::AcqRel);
            shared.start_occupancy_sem.signal();
        }
        Msg::Halt { .. } => {
            shared.halt_count.fetch_add(1, Ordering::AcqRel);
            shared.start_occupancy_sem.signal();
        }
        Msg::Delay {
            remaining_jiffies, ..
        } => {
            shared.max_jiffies.store(
                (*remaining_jiffies as u64).max(MIN_DELAY_CEILING_JIFFIES),
                Ordering::Release,
            );
        }
        Msg::Quit => {
            shared.exit.store(true, Ordering::Release);
        }
        _ => {}
    }
}

impl Drop for StarvationRamper {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.space_sem.signal();
        if let Some(puller) = self.puller.take() {
            if puller.join().is_err() {
                warn!("puller thread panicked");
            }
        }
    }
}
