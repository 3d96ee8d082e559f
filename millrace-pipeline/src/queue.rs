//! Message queues and counting reservoirs.

use std::collections::VecDeque;

use crate::msg::Msg;

/// Plain FIFO of messages. Locking and blocking are the owning element's
/// concern; elements that need back-pressure wrap this with semaphores.
#[derive(Default)]
pub struct MsgQueue {
    queue: VecDeque<Msg>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, msg: Msg) {
        self.queue.push_back(msg);
    }

    /// Requeue at the front: used for the unconsumed remainder of a split
    /// audio message, which must be the next message dequeued.
    pub fn enqueue_at_head(&mut self, msg: Msg) {
        self.queue.push_front(msg);
    }

    pub fn dequeue(&mut self) -> Option<Msg> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// FIFO that tracks what it holds: total decoded-audio jiffies plus
/// per-kind counts the elements gate on.
#[derive(Default)]
pub struct Reservoir {
    queue: MsgQueue,
    jiffies: u64,
    encoded_bytes: usize,
    decoded_stream_count: usize,
    encoded_stream_count: usize,
    track_count: usize,
    halt_count: usize,
}

impl Reservoir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, msg: Msg) {
        self.account(&msg, 1);
        self.queue.enqueue(msg);
    }

    pub fn enqueue_at_head(&mut self, msg: Msg) {
        self.account(&msg, 1);
        self.queue.enqueue_at_head(msg);
    }

    pub fn dequeue(&mut self) -> Option<Msg> {
        let msg = self.queue.dequeue();
        if let Some(ref msg) = msg {
            self.account(msg, -1);
        }
        msg
    }

    fn account(&mut self, msg: &Msg, sign: i64) {
        let add = |v: &mut usize| {
            *v = (*v as i64 + sign) as usize;
        };
        match msg {
            Msg::AudioPcm(_) | Msg::AudioDsd(_) | Msg::Silence(_) => {
                self.jiffies = (self.jiffies as i64 + sign * msg.jiffies() as i64) as u64;
            }
            Msg::AudioEncoded(a) => {
                self.encoded_bytes = (self.encoded_bytes as i64 + sign * a.len() as i64) as usize;
            }
            Msg::DecodedStream(_) => add(&mut self.decoded_stream_count),
            Msg::EncodedStream(_) => add(&mut self.encoded_stream_count),
            Msg::Track(_) => add(&mut self.track_count),
            Msg::Halt { .. } => add(&mut self.halt_count),
            _ => {}
        }
    }

    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    pub fn encoded_bytes(&self) -> usize {
        self.encoded_bytes
    }

    pub fn decoded_stream_count(&self) -> usize {
        self.decoded_stream_count
    }

    pub fn encoded_stream_count(&self) -> usize {
        self.encoded_stream_count
    }

    pub fn track_count(&self) -> usize {
        self.track_count
    }

    pub fn halt_count(&self) -> usize {
        self.halt_count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{AckToken, MsgFactory};
    use millrace_common::config::PoolConfig;

    #[test]
    fn head_enqueue_dequeues_first() {
        let mut q = MsgQueue::new();
        q.enqueue(Msg::Wait);
        q.enqueue_at_head(Msg::Quit);
        assert!(matches!(q.dequeue(), Some(Msg::Quit)));
        assert!(matches!(q.dequeue(), Some(Msg::Wait)));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn reservoir_tracks_jiffies_and_counts() {
        let factory = MsgFactory::new(&PoolConfig::default());
        let mut r = Reservoir::new();
        let audio = factory.audio_pcm(&[0u8; 400], 44100, 16, 2, 0);
        let size = audio.jiffies();
        r.enqueue(audio);
        r.enqueue(Msg::Halt {
            id: 1,
            ack: AckToken::none(),
        });
        assert_eq!(r.jiffies(), size as u64);
        assert_eq!(r.halt_count(), 1);
        r.dequeue();
        assert_eq!(r.jiffies(), 0);
        r.dequeue();
        assert_eq!(r.halt_count(), 0);
    }
}
