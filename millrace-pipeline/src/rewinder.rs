//! Lookahead/backtrack buffer for codec recognition.
//!
//! While buffering, every message passed downstream is also retained so
//! that [`Rewinder::rewind`] can replay the start of the stream for the
//! next codec trying to recognise it. Once a codec commits,
//! [`Rewinder::stop`] discards the retained messages and buffering stays
//! off until the next stream or segment boundary arrives.
//!
//! The element throttles itself: while buffering, [`Rewinder::pull`]
//! returns `None` instead of pulling upstream once the retained buffer
//! reaches its encoded-audio cap, so an unrecognisable stream cannot pin
//! unbounded memory.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::element::{StreamHandler, StreamPlay, UpstreamElement};
use crate::msg::{EncodedStreamInfo, Msg, MsgFactory};
use crate::queue::MsgQueue;

/// Retained messages plus the encoded-audio count the cap is applied to.
struct RewinderReservoir {
    queue: MsgQueue,
    encoded_audio_count: usize,
}

impl RewinderReservoir {
    fn new() -> Self {
        Self {
            queue: MsgQueue::new(),
            encoded_audio_count: 0,
        }
    }

    fn enqueue(&mut self, msg: Msg) {
        if matches!(msg, Msg::AudioEncoded(_)) {
            self.encoded_audio_count += 1;
        }
        self.queue.enqueue(msg);
    }

    fn dequeue(&mut self) -> Option<Msg> {
        let msg = self.queue.dequeue();
        if matches!(msg, Some(Msg::AudioEncoded(_))) {
            self.encoded_audio_count -= 1;
        }
        msg
    }

    fn is_full(&self, max_encoded_audio: usize) -> bool {
        self.encoded_audio_count >= max_encoded_audio
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.encoded_audio_count = 0;
    }
}

/// Stream-handler face of the rewinder, installed into re-issued
/// `EncodedStream` messages so downstream escalations route back through
/// here to the real upstream handler.
pub struct RewinderHandle {
    upstream_handler: Mutex<Option<Arc<dyn StreamHandler>>>,
}

impl RewinderHandle {
    fn handler(&self) -> Arc<dyn StreamHandler> {
        self.upstream_handler
            .lock()
            .unwrap()
            .clone()
            .expect("stream handler queried before any stream seen")
    }
}

impl StreamHandler for RewinderHandle {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay {
        self.handler().ok_to_play(stream_id)
    }

    fn try_seek(&self, stream_id: u32, offset: u64) -> u32 {
        self.handler().try_seek(stream_id, offset)
    }

    fn try_discard(&self, _jiffies: u32) -> u32 {
        // Discard requests are only meaningful on decoded audio, which
        // never reaches this point of the chain.
        unreachable!("try_discard on encoded stream chain");
    }

    fn try_stop(&self, stream_id: u32) -> u32 {
        self.handler().try_stop(stream_id)
    }

    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        let handler = self.upstream_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.notify_starving(mode, stream_id, starving);
        }
    }
}

pub struct Rewinder {
    factory: MsgFactory,
    upstream: Box<dyn UpstreamElement>,
    handle: Arc<RewinderHandle>,
    /// Messages to emit before pulling upstream again (replay after a
    /// rewind).
    queue_current: RewinderReservoir,
    /// Copies retained for the next rewind.
    queue_next: RewinderReservoir,
    buffering: bool,
    max_encoded_audio: usize,
}

impl Rewinder {
    pub fn new(
        factory: MsgFactory,
        upstream: Box<dyn UpstreamElement>,
        max_encoded_audio: usize,
    ) -> Self {
        Self {
            factory,
            upstream,
            handle: Arc::new(RewinderHandle {
                upstream_handler: Mutex::new(None),
            }),
            queue_current: RewinderReservoir::new(),
            queue_next: RewinderReservoir::new(),
            buffering: false,
            max_encoded_audio,
        }
    }

    /// Shareable stream-handler face, for wiring into downstream elements.
    pub fn handle(&self) -> Arc<RewinderHandle> {
        Arc::clone(&self.handle)
    }

    /// Pull the next message. Returns `None` when the retained buffer is
    /// at capacity; callers treat this as "try again after rewind/stop".
    pub fn pull(&mut self) -> Option<Msg> {
        if self.buffering && self.queue_next.is_full(self.max_encoded_audio) {
            return None;
        }
        if let Some(msg) = self.queue_current.dequeue() {
            if self.buffering {
                self.try_buffer(&msg);
            } else if should_start_buffering(&msg) {
                // Replayed msgs stay unbuffered after a stop() until the
                // next stream boundary, so a previously buffered
                // EncodedStream is not re-buffered and replayed after
                // every subsequent rewind.
                self.buffering = true;
            }
            return Some(msg);
        }
        let msg = self.upstream.pull();
        Some(self.process(msg))
    }

    /// Replay everything retained since buffering began. The next pulls
    /// re-emit those messages in their original order.
    pub fn rewind(&mut self) {
        assert!(self.buffering, "rewind while not buffering");
        debug!(retained = self.queue_next.queue.len(), "rewinding");
        while let Some(msg) = self.queue_current.dequeue() {
            self.queue_next.enqueue(msg);
        }
        std::mem::swap(&mut self.queue_current, &mut self.queue_next);
    }

    /// Codec recognition is complete; drop the retained copies and stop
    /// buffering until the next stream boundary.
    pub fn stop(&mut self) {
        assert!(self.buffering, "stop while not buffering");
        self.queue_next.clear();
        self.buffering = false;
    }

    fn process(&mut self, msg: Msg) -> Msg {
        match msg {
            Msg::Mode(_)
            | Msg::Track(_)
            | Msg::Delay { .. }
            | Msg::AudioEncoded(_)
            | Msg::MetaText(_)
            | Msg::Flush { .. } => {
                self.try_buffer(&msg);
                msg
            }
            Msg::EncodedStream(info) => {
                // Interpose on the stream handler so downstream seek/stop
                // escalations funnel through the rewinder.
                *self.handle.upstream_handler.lock().unwrap() =
                    Some(Arc::clone(&info.stream_handler));
                let reissued = Msg::EncodedStream(Arc::new(EncodedStreamInfo {
                    uri: info.uri.clone(),
                    stream_id: info.stream_id,
                    total_bytes: info.total_bytes,
                    seekable: info.seekable,
                    live: info.live,
                    stream_handler: self.handle.clone(),
                }));
                self.buffering = true;
                self.try_buffer(&reissued);
                reissued
            }
            Msg::StreamSegment { .. } => {
                self.buffering = true;
                self.try_buffer(&msg);
                msg
            }
            Msg::Drain(_) | Msg::StreamInterrupted | Msg::Halt { .. } | Msg::Wait | Msg::Quit => {
                msg
            }
            other => unreachable!("{} at rewinder", other.kind_name()),
        }
    }

    fn try_buffer(&mut self, msg: &Msg) {
        if self.buffering {
            let copy = self.clone_msg(msg);
            self.queue_next.enqueue(copy);
        }
    }

    /// Encoded audio is deep-copied (the downstream codec consumes its
    /// copy); everything else buffered here is immutable and shared.
    fn clone_msg(&self, msg: &Msg) -> Msg {
        match msg {
            Msg::Mode(info) => Msg::Mode(Arc::clone(info)),
            Msg::Track(info) => Msg::Track(Arc::clone(info)),
            Msg::Delay {
                remaining_jiffies,
                total_jiffies,
            } => Msg::Delay {
                remaining_jiffies: *remaining_jiffies,
                total_jiffies: *total_jiffies,
            },
            Msg::EncodedStream(info) => Msg::EncodedStream(Arc::clone(info)),
            Msg::StreamSegment { id } => Msg::StreamSegment { id: id.clone() },
            Msg::AudioEncoded(audio) => {
                Msg::AudioEncoded(self.factory.clone_audio_encoded(audio))
            }
            Msg::MetaText(text) => Msg::MetaText(Arc::clone(text)),
            Msg::Flush { id } => Msg::Flush { id: *id },
            other => unreachable!("{} buffered at rewinder", other.kind_name()),
        }
    }
}

/// Whether a replayed message marks a stream boundary that should restart
/// buffering after a stop().
fn should_start_buffering(msg: &Msg) -> bool {
    match msg {
        Msg::EncodedStream(_) | Msg::StreamSegment { .. } => true,
        Msg::Halt { .. } | Msg::Wait | Msg::Quit => {
            unreachable!("{} in rewind buffer", msg.kind_name())
        }
        Msg::DecodedStream(_)
        | Msg::AudioPcm(_)
        | Msg::AudioDsd(_)
        | Msg::Silence(_)
        | Msg::Playable(_) => unreachable!("{} in rewind buffer", msg.kind_name()),
        _ => false,
    }
}
