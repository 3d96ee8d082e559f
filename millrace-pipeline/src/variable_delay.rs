//! Delay injection and removal with ramped transitions.
//!
//! A variable-delay element makes the pipeline's end-to-end latency
//! adjustable at runtime, typically for lip sync or songcast-style
//! synchronisation. Increasing the delay inserts silence; decreasing it
//! discards audio. Either way the audio first ramps down, the adjustment
//! is applied while silent, and the audio ramps back up, so the listener
//! hears a dip rather than a glitch.
//!
//! Two instances cooperate: `VariableDelayLeft` sits early in the decoded
//! chain and applies the bulk of a requested delay, reserving a fixed
//! allowance for downstream; `VariableDelayRight` sits just before the
//! animator, subtracts the animator's inherent latency from what is left
//! and applies the remainder. Left notifies an observer when its portion
//! is in effect; Right uses that notification to restart clock pulling
//! once the total delay is stable.

use std::sync::{Arc, Mutex};

use millrace_common::jiffies;
use tracing::debug;

use crate::element::{Animator, ClockPuller, DelayObserver, UpstreamElement, FLUSH_ID_INVALID};
use crate::msg::{AudioFormat, DecodedAudio, DecodedStreamInfo, Msg, MsgFactory};
use crate::queue::MsgQueue;
use crate::ramp::{Direction, RAMP_MAX, RAMP_MIN};

/// Longest silence message generated while applying a delay increase.
const MAX_SILENCE_JIFFIES: u32 = 2 * jiffies::PER_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Starting,
    Running,
    RampingDown,
    RampedDown,
    RampingUp,
}

/// Cross-thread state shared between `VariableDelayRight` and the
/// observer face it presents to `VariableDelayLeft`. Left's notification
/// arrives on whichever thread drives the left half of the pipeline.
struct RightLink {
    clock_puller: Option<Arc<dyn ClockPuller>>,
    delay_adjustment: i64,
}

/// Observer face of `VariableDelayRight`, registered with the left
/// element so the clock puller restarts only once both delays are in
/// effect.
pub struct RightDelayObserver {
    link: Arc<Mutex<RightLink>>,
}

impl DelayObserver for RightDelayObserver {
    fn notify_delay_applied(&self, _jiffies: u32) {
        let link = self.link.lock().unwrap();
        if link.delay_adjustment == 0 {
            if let Some(puller) = &link.clock_puller {
                puller.start();
            }
        }
    }
}

enum Side {
    Left {
        /// Delay reserved for elements downstream of this one.
        downstream_delay: u32,
        observer: Option<Arc<dyn DelayObserver>>,
    },
    Right {
        min_delay: u32,
        delay_total: u32,
        animator_latency: u32,
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
    },
}

struct DelayCore {
    factory: MsgFactory,
    upstream: Box<dyn UpstreamElement>,
    side: Side,
    name: &'static str,
    queue: MsgQueue,
    clock_puller: Option<Arc<dyn ClockPuller>>,
    animator: Option<Arc<dyn Animator>>,
    stream: Option<Arc<DecodedStreamInfo>>,
    pending_stream: Option<Msg>,
    delay_jiffies: u32,
    delay_adjustment: i64,
    ramp_duration: u32,
    target_flush_id: u32,
    dsd_block_words: u32,
    wait_for_audio_before_silence: bool,
    status: Status,
    ramp_direction: Direction,
    current_ramp: u32,
    remaining_ramp: u32,
}

impl DelayCore {
    fn new(
        factory: MsgFactory,
        upstream: Box<dyn UpstreamElement>,
        ramp_duration: u32,
        side: Side,
        name: &'static str,
    ) -> Self {
        Self {
            factory,
            upstream,
            side,
            name,
            queue: MsgQueue::new(),
            clock_puller: None,
            animator: None,
            stream: None,
            pending_stream: None,
            delay_jiffies: 0,
            delay_adjustment: 0,
            ramp_duration,
            target_flush_id: FLUSH_ID_INVALID,
            dsd_block_words: 0,
            wait_for_audio_before_silence: false,
            status: Status::Starting,
            ramp_direction: Direction::None,
            current_ramp: RAMP_MAX,
            remaining_ramp: ramp_duration,
        }
    }

    fn set_animator(&mut self, animator: Arc<dyn Animator>) {
        self.dsd_block_words = animator.dsd_block_words().unwrap_or(0);
        self.animator = Some(animator);
    }

    fn pull(&mut self) -> Msg {
        loop {
            if let Some(msg) = self.do_pull() {
                return msg;
            }
        }
    }

    fn do_pull(&mut self) -> Option<Msg> {
        if self.wait_for_audio_before_silence {
            loop {
                match self.next_msg() {
                    Some(msg) => {
                        if self.wait_for_audio_before_silence {
                            return Some(msg);
                        }
                        // Audio arrived during this call; park the msg and
                        // fall through to silence generation.
                        self.queue.enqueue(msg);
                        break;
                    }
                    None => {
                        if !self.wait_for_audio_before_silence {
                            break;
                        }
                    }
                }
            }
        }

        if (self.status == Status::Starting || self.status == Status::RampedDown)
            && self.delay_adjustment > 0
        {
            return Some(self.generate_silence());
        }
        self.next_msg()
    }

    fn generate_silence(&mut self) -> Msg {
        let stream = self
            .stream
            .as_ref()
            .expect("delay applied before any stream")
            .clone();
        let mut size = MAX_SILENCE_JIFFIES.min(self.delay_adjustment as u32);
        let silence = match stream.format {
            AudioFormat::Pcm => self.factory.silence(
                &mut size,
                stream.sample_rate,
                stream.bit_depth,
                stream.channels,
            ),
            AudioFormat::Dsd => self.factory.silence_dsd(
                &mut size,
                stream.sample_rate,
                stream.channels,
                self.dsd_block_words,
            ),
        };
        // Sub-sample requests get rounded up, which can overshoot.
        if size as i64 > self.delay_adjustment {
            self.delay_adjustment = 0;
        } else {
            self.delay_adjustment -= size as i64;
        }
        if self.delay_adjustment == 0 {
            self.local_delay_applied();
            if self.status == Status::RampedDown {
                self.status = Status::RampingUp;
                self.ramp_direction = Direction::Up;
                self.current_ramp = RAMP_MIN;
                self.remaining_ramp = self.ramp_duration;
            } else {
                self.status = Status::Running;
                self.ramp_direction = Direction::None;
                self.current_ramp = RAMP_MAX;
                self.remaining_ramp = 0;
            }
        }
        silence
    }

    fn next_msg(&mut self) -> Option<Msg> {
        if let Some(pending) = self.pending_stream.take() {
            // Already processed; re-processing would reset status.
            return Some(pending);
        }
        let msg = match self.queue.dequeue() {
            Some(msg) => msg,
            None => self.upstream.pull(),
        };
        self.process(msg)
    }

    fn process(&mut self, msg: Msg) -> Option<Msg> {
        match msg {
            Msg::Mode(info) => {
                if let Side::Right { delay_total, .. } = &mut self.side {
                    *delay_total = 0;
                }
                if let Some(puller) = &self.clock_puller {
                    puller.stop();
                }
                self.clock_puller = info.clock_puller.clone();
                self.delay_jiffies = 0;
                self.delay_adjustment = 0;
                self.wait_for_audio_before_silence = true;
                self.reset_status_and_ramp();
                Some(Msg::Mode(info))
            }
            Msg::Drain(ack) => {
                if let Some(puller) = &self.clock_puller {
                    puller.stop();
                }
                // The animator discards its buffered audio on a drain, so
                // our delay contribution must be rebuilt from scratch.
                self.delay_adjustment = self.delay_jiffies as i64;
                if self.delay_adjustment == 0 {
                    self.wait_for_audio_before_silence = false;
                    self.reset_status_and_ramp();
                } else {
                    self.wait_for_audio_before_silence = true;
                    self.ramp_direction = Direction::Down;
                    self.current_ramp = RAMP_MIN;
                    self.remaining_ramp = 0;
                    self.status = Status::RampedDown;
                }
                Some(Msg::Drain(ack))
            }
            Msg::Delay {
                remaining_jiffies,
                total_jiffies,
            } => Some(self.process_delay(remaining_jiffies, total_jiffies)),
            Msg::Flush { id } => {
                // Stream or delay changes since the discard request may
                // have moved us out of RampedDown; only resume then.
                if self.target_flush_id != FLUSH_ID_INVALID
                    && id == self.target_flush_id
                    && self.status == Status::RampedDown
                {
                    self.local_delay_applied();
                    self.status = Status::RampingUp;
                    self.ramp_direction = Direction::Up;
                    self.current_ramp = RAMP_MIN;
                    self.remaining_ramp = self.ramp_duration;
                }
                Some(Msg::Flush { id })
            }
            Msg::DecodedStream(info) => {
                let changed = self.stream_info_changed(&info);
                self.stream = Some(Arc::clone(&info));
                if changed {
                    self.reset_status_and_ramp();
                }
                if changed {
                    if let Side::Right {
                        sample_rate,
                        bit_depth,
                        channels,
                        ..
                    } = &mut self.side
                    {
                        *sample_rate = info.sample_rate;
                        *bit_depth = info.bit_depth;
                        *channels = info.channels;
                        self.adjust_delay_for_animator_latency();
                    }
                }
                Some(Msg::DecodedStream(info))
            }
            Msg::AudioPcm(audio) | Msg::AudioDsd(audio) => self.process_audio_decoded(audio),
            Msg::Silence(audio) => {
                // Silence absorbs transitions for free; collapse any
                // in-progress ramp.
                if self.status == Status::RampingUp {
                    self.remaining_ramp = 0;
                    self.current_ramp = RAMP_MAX;
                    self.status = Status::Running;
                } else if self.status == Status::RampingDown {
                    self.remaining_ramp = 0;
                    self.current_ramp = RAMP_MIN;
                    if self.delay_adjustment != 0 {
                        self.status = Status::RampedDown;
                    } else {
                        self.status = Status::RampingUp;
                        self.ramp_direction = Direction::Up;
                        self.remaining_ramp = self.ramp_duration;
                    }
                }
                Some(Msg::Silence(audio))
            }
            Msg::Track(_)
            | Msg::EncodedStream(_)
            | Msg::AudioEncoded(_)
            | Msg::MetaText(_)
            | Msg::StreamInterrupted
            | Msg::Halt { .. }
            | Msg::Wait
            | Msg::BitRate { .. }
            | Msg::Quit => Some(msg),
            other => unreachable!("{} at variable delay ({})", other.kind_name(), self.name),
        }
    }

    fn process_delay(&mut self, remaining_jiffies: u32, total_jiffies: u32) -> Msg {
        match &mut self.side {
            Side::Left {
                downstream_delay, ..
            } => {
                let downstream = *downstream_delay;
                let out = Msg::Delay {
                    remaining_jiffies: downstream.min(total_jiffies),
                    total_jiffies,
                };
                let delay = total_jiffies.saturating_sub(downstream);
                debug!(
                    name = self.name,
                    delay_ms = jiffies::to_ms(delay),
                    prev_ms = jiffies::to_ms(self.delay_jiffies),
                    "delay change"
                );
                self.handle_delay_change(delay);
                out
            }
            Side::Right {
                min_delay,
                delay_total,
                animator_latency,
                ..
            } => {
                let min_delay = *min_delay;
                let latency = *animator_latency;
                let total = remaining_jiffies.max(min_delay);
                *delay_total = total;
                let delay = total.saturating_sub(latency).max(min_delay);
                debug!(
                    name = self.name,
                    delay_ms = jiffies::to_ms(delay),
                    animator_ms = jiffies::to_ms(latency),
                    prev_ms = jiffies::to_ms(self.delay_jiffies),
                    "delay change"
                );
                self.handle_delay_change(delay);
                Msg::Delay {
                    remaining_jiffies: delay,
                    total_jiffies: total_jiffies.max(min_delay),
                }
            }
        }
    }

    fn process_audio_decoded(&mut self, audio: DecodedAudio) -> Option<Msg> {
        if self.wait_for_audio_before_silence {
            self.wait_for_audio_before_silence = false;
            self.queue.enqueue_at_head(wrap_audio(audio));
            return None;
        }
        if self.status == Status::Starting && self.delay_adjustment < 0 {
            self.status = Status::RampedDown;
        }
        let mut audio = audio;
        match self.status {
            Status::Starting | Status::Running => {
                self.status = Status::Running;
                Some(wrap_audio(audio))
            }
            Status::RampingDown => {
                self.ramp_msg(&mut audio);
                if self.remaining_ramp == 0 {
                    if self.delay_adjustment != 0 {
                        self.status = Status::RampedDown;
                        if self.delay_adjustment < 0 {
                            self.begin_discard();
                        }
                    } else {
                        self.status = Status::RampingUp;
                        self.ramp_direction = Direction::Up;
                        self.remaining_ramp = self.ramp_duration;
                    }
                }
                Some(wrap_audio(audio))
            }
            Status::RampedDown => {
                assert!(
                    self.delay_adjustment <= 0,
                    "positive adjustment while ramped down"
                );
                if self.delay_adjustment < 0 {
                    let mut size = audio.size_jiffies();
                    if size as i64 > -self.delay_adjustment {
                        if let Some(tail) = audio.try_split((-self.delay_adjustment) as u32) {
                            size = audio.size_jiffies();
                            self.queue.enqueue_at_head(wrap_audio(tail));
                        }
                    }
                    self.delay_adjustment += size as i64;
                }
                // A sub-sample residue consumes the whole fragment, which
                // can overshoot slightly.
                self.delay_adjustment = self.delay_adjustment.min(0);
                if self.delay_adjustment == 0 {
                    self.local_delay_applied();
                    self.status = Status::RampingUp;
                    self.ramp_direction = Direction::Up;
                    self.remaining_ramp = self.ramp_duration;
                    self.current_ramp = RAMP_MIN;
                    let sample_start = audio.track_offset.unwrap_or(0)
                        + jiffies::to_samples(audio.size_jiffies(), audio.sample_rate) as u64;
                    return Some(self.update_decoded_stream(sample_start));
                }
                None // discarded
            }
            Status::RampingUp => {
                self.ramp_msg(&mut audio);
                if self.remaining_ramp == 0 {
                    self.status = Status::Running;
                }
                Some(wrap_audio(audio))
            }
        }
    }

    /// The local queue cannot satisfy the whole removal; discard what it
    /// holds, then escalate the rest to the stream provider.
    fn begin_discard(&mut self) {
        let mut track_offset_samples = 0u64;
        let discarded = discard_audio(
            &mut self.queue,
            (-self.delay_adjustment) as u32,
            &mut track_offset_samples,
        );
        // Discarding is sample-granular and can overshoot a sub-sample
        // residue.
        self.delay_adjustment = (self.delay_adjustment + discarded as i64).min(0);
        let remaining = (-self.delay_adjustment) as u32;
        if remaining == 0 {
            self.delay_adjustment = 0;
            self.local_delay_applied();
            self.status = Status::RampingUp;
            self.ramp_direction = Direction::Up;
            self.current_ramp = RAMP_MIN;
            self.remaining_ramp = self.ramp_duration;
            let stream = self.update_decoded_stream(track_offset_samples);
            assert!(self.pending_stream.is_none());
            self.pending_stream = Some(stream);
        } else {
            let handler = self
                .stream
                .as_ref()
                .expect("discard before any stream")
                .stream_handler
                .clone();
            self.target_flush_id = handler.try_discard(remaining);
            if self.target_flush_id != FLUSH_ID_INVALID {
                self.delay_adjustment += remaining as i64;
            }
        }
    }

    fn ramp_msg(&mut self, audio: &mut DecodedAudio) {
        if audio.size_jiffies() > self.remaining_ramp {
            if let Some(tail) = audio.try_split(self.remaining_ramp) {
                self.queue.enqueue_at_head(wrap_audio(tail));
            }
        }
        let (end, split) =
            audio.set_ramp(self.current_ramp, &mut self.remaining_ramp, self.ramp_direction);
        self.current_ramp = end;
        if let Some(split) = split {
            self.queue.enqueue_at_head(wrap_audio(split));
        }
    }

    fn reset_status_and_ramp(&mut self) {
        self.status = Status::Starting;
        self.ramp_direction = Direction::None;
        self.current_ramp = RAMP_MAX;
        self.remaining_ramp = self.ramp_duration;
    }

    fn setup_ramp(&mut self) {
        self.wait_for_audio_before_silence = self.delay_adjustment > 0;
        debug!(
            name = self.name,
            delay_ms = jiffies::to_ms(self.delay_jiffies),
            adjustment_ms = (self.delay_adjustment / jiffies::PER_MS as i64),
            "delay ramp setup"
        );
        match self.status {
            Status::Starting => {
                self.ramp_direction = Direction::None;
                self.remaining_ramp = self.ramp_duration;
            }
            Status::Running => {
                if self.delay_adjustment != 0 {
                    self.status = Status::RampingDown;
                    self.ramp_direction = Direction::Down;
                    self.remaining_ramp = self.ramp_duration;
                }
            }
            Status::RampingDown => {
                if self.delay_adjustment == 0 {
                    if self.ramp_duration == self.remaining_ramp {
                        self.status = Status::Running;
                        self.ramp_direction = Direction::None;
                        self.remaining_ramp = 0;
                    } else {
                        // Resume from the current ramp value rather than
                        // restarting from silence.
                        self.status = Status::RampingUp;
                        self.ramp_direction = Direction::Up;
                        self.remaining_ramp = self.ramp_duration - self.remaining_ramp;
                    }
                }
            }
            Status::RampedDown => {
                if self.delay_adjustment == 0 {
                    self.status = Status::RampingUp;
                    self.ramp_direction = Direction::Up;
                    self.remaining_ramp = self.ramp_duration - self.remaining_ramp;
                }
            }
            Status::RampingUp => {
                self.status = Status::RampingDown;
                self.ramp_direction = Direction::Down;
                self.remaining_ramp = self.ramp_duration - self.remaining_ramp;
                if self.remaining_ramp == 0 {
                    self.status = Status::RampedDown;
                }
            }
        }
    }

    fn handle_delay_change(&mut self, new_delay: u32) {
        if new_delay == self.delay_jiffies {
            return;
        }
        self.delay_adjustment += new_delay as i64 - self.delay_jiffies as i64;
        self.delay_jiffies = new_delay;
        self.setup_ramp();
        if self.delay_adjustment != 0 {
            if let Some(puller) = &self.clock_puller {
                puller.stop();
            }
        }
    }

    fn stream_info_changed(&self, info: &DecodedStreamInfo) -> bool {
        match &self.stream {
            None => true,
            Some(current) => {
                current.format != info.format
                    || current.sample_rate != info.sample_rate
                    || current.bit_depth != info.bit_depth
                    || current.channels != info.channels
            }
        }
    }

    fn update_decoded_stream(&mut self, sample_start: u64) -> Msg {
        let current = self.stream.as_ref().expect("no stream to update");
        let updated = Arc::new(DecodedStreamInfo {
            stream_id: current.stream_id,
            bit_rate: current.bit_rate,
            bit_depth: current.bit_depth,
            sample_rate: current.sample_rate,
            channels: current.channels,
            codec_name: current.codec_name.clone(),
            track_length_jiffies: current.track_length_jiffies,
            sample_start,
            lossless: current.lossless,
            seekable: current.seekable,
            live: current.live,
            format: current.format,
            stream_handler: current.stream_handler.clone(),
        });
        self.stream = Some(Arc::clone(&updated));
        Msg::DecodedStream(updated)
    }

    fn local_delay_applied(&mut self) {
        match &self.side {
            Side::Left { observer, .. } => {
                if let Some(observer) = observer {
                    observer.notify_delay_applied(self.delay_jiffies);
                }
            }
            Side::Right { .. } => {
                if let Some(puller) = &self.clock_puller {
                    puller.start();
                }
            }
        }
    }

    fn adjust_delay_for_animator_latency(&mut self) {
        let (min_delay, delay_total, sample_rate, bit_depth, channels) = match &self.side {
            Side::Right {
                min_delay,
                delay_total,
                sample_rate,
                bit_depth,
                channels,
                ..
            } => (*min_delay, *delay_total, *sample_rate, *bit_depth, *channels),
            Side::Left { .. } => return,
        };
        if sample_rate == 0 {
            return;
        }
        let format = match &self.stream {
            Some(stream) => stream.format,
            None => return,
        };
        let animator = self.animator.as_ref().expect("animator not set");
        // An uncharacterised format gets no compensation.
        let latency = animator
            .delay_jiffies(format, sample_rate, bit_depth, channels)
            .unwrap_or(0);
        if let Side::Right {
            animator_latency, ..
        } = &mut self.side
        {
            *animator_latency = latency;
        }
        let delay = delay_total.saturating_sub(latency).max(min_delay);
        self.handle_delay_change(delay);
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

/// Drop up to `max_jiffies` of audio from the front of `queue`, tracking
/// the position just past the last discarded decoded audio.
fn discard_audio(queue: &mut MsgQueue, max_jiffies: u32, track_offset_samples: &mut u64) -> u32 {
    let mut discarded = 0u32;
    while discarded < max_jiffies {
        let mut audio = match queue.dequeue() {
            Some(Msg::AudioPcm(a)) | Some(Msg::AudioDsd(a)) | Some(Msg::Silence(a)) => a,
            Some(other) => unreachable!("{} during audio discard", other.kind_name()),
            None => break,
        };
        if discarded + audio.size_jiffies() > max_jiffies {
            if let Some(tail) = audio.try_split(max_jiffies - discarded) {
                queue.enqueue_at_head(wrap_audio(tail));
            }
        }
        discarded += audio.size_jiffies();
        if let Some(offset) = audio.track_offset {
            *track_offset_samples =
                offset + jiffies::to_samples(audio.size_jiffies(), audio.sample_rate) as u64;
        }
    }
    discarded
}

/// Upstream half of the delay pair.
pub struct VariableDelayLeft {
    core: DelayCore,
}

impl VariableDelayLeft {
    pub fn new(
        factory: MsgFactory,
        upstream: Box<dyn UpstreamElement>,
        ramp_duration: u32,
        downstream_delay: u32,
    ) -> Self {
        Self {
            core: DelayCore::new(
                factory,
                upstream,
                ramp_duration,
                Side::Left {
                    downstream_delay,
                    observer: None,
                },
                "left",
            ),
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn DelayObserver>) {
        if let Side::Left { observer: slot, .. } = &mut self.core.side {
            *slot = Some(observer);
        }
    }

    pub fn set_animator(&mut self, animator: Arc<dyn Animator>) {
        self.core.set_animator(animator);
    }
}

impl UpstreamElement for VariableDelayLeft {
    fn pull(&mut self) -> Msg {
        self.core.pull()
    }
}

/// Downstream half of the delay pair, animator-latency aware.
pub struct VariableDelayRight {
    core: DelayCore,
    link: Arc<Mutex<RightLink>>,
}

impl VariableDelayRight {
    pub fn new(
        factory: MsgFactory,
        upstream: Box<dyn UpstreamElement>,
        ramp_duration: u32,
        min_delay: u32,
    ) -> Self {
        let link = Arc::new(Mutex::new(RightLink {
            clock_puller: None,
            delay_adjustment: 0,
        }));
        Self {
            core: DelayCore::new(
                factory,
                upstream,
                ramp_duration,
                Side::Right {
                    min_delay,
                    delay_total: 0,
                    animator_latency: 0,
                    sample_rate: 0,
                    bit_depth: 0,
                    channels: 0,
                },
                "right",
            ),
            link,
        }
    }

    pub fn set_animator(&mut self, animator: Arc<dyn Animator>) {
        self.core.set_animator(animator);
    }

    /// Observer face to register with [`VariableDelayLeft::set_observer`].
    pub fn observer(&self) -> Arc<RightDelayObserver> {
        Arc::new(RightDelayObserver {
            link: Arc::clone(&self.link),
        })
    }
}

impl UpstreamElement for VariableDelayRight {
    fn pull(&mut self) -> Msg {
        let msg = self.core.pull();
        // Publish state the cross-thread observer face reads.
        let mut link = self.link.lock().unwrap();
        link.delay_adjustment = self.core.delay_adjustment;
        link.clock_puller = self.core.clock_puller.clone();
        msg
    }
}
