//! Pipeline element and collaborator contracts
//!
//! The flow-control core has no wire format of its own; everything it
//! needs from the rest of the system arrives through the traits here.
//! Upstream sources implement [`StreamHandler`] to service seek / stop /
//! discard escalations, the hardware output layer implements [`Animator`]
//! to report achievable formats and latencies, and elements chain via
//! [`UpstreamElement::pull`].

use thiserror::Error;

use crate::msg::{AudioFormat, Msg};

/// Flush id meaning "no flush" — never assigned by a provider.
pub const FLUSH_ID_INVALID: u32 = 0;

/// Halt id used for halts synthesized inside the pipeline.
pub const HALT_ID_NONE: u32 = 0;

/// An element that can be pulled for the next message. Blocking; one
/// caller at a time.
pub trait UpstreamElement {
    fn pull(&mut self) -> Msg;
}

/// Answer to [`StreamHandler::ok_to_play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPlay {
    Yes,
    No,
    Later,
}

/// Implemented by the protocol/source layer; called by pipeline elements
/// to escalate starvation, seeks and stops.
///
/// `try_*` calls return the flush id that will confirm the request once
/// the matching `Flush` message has propagated down the chain, or
/// [`FLUSH_ID_INVALID`] if the request cannot be serviced.
pub trait StreamHandler: Send + Sync {
    fn ok_to_play(&self, stream_id: u32) -> StreamPlay;
    fn try_seek(&self, stream_id: u32, offset: u64) -> u32;
    fn try_discard(&self, jiffies: u32) -> u32;
    fn try_stop(&self, stream_id: u32) -> u32;
    fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool);
}

/// The animator cannot characterise the given format/rate/depth/channel
/// combination. Recoverable: callers assume zero additional latency.
#[derive(Debug, Error)]
#[error("format not supported by animator")]
pub struct FormatUnsupported;

/// Hardware-facing pipeline terminus, queried for inherent output latency.
pub trait Animator: Send + Sync {
    fn delay_jiffies(
        &self,
        format: AudioFormat,
        sample_rate: u32,
        bit_depth: u32,
        channels: u32,
    ) -> Result<u32, FormatUnsupported>;

    fn dsd_block_words(&self) -> Result<u32, FormatUnsupported>;

    fn max_bit_depth(&self) -> u32;
}

/// External clock-pulling logic, stopped around delay adjustments and
/// restarted once the pipeline's latency contribution is stable.
pub trait ClockPuller: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Observer for delay-applied notifications from `VariableDelayLeft`.
pub trait DelayObserver: Send + Sync {
    fn notify_delay_applied(&self, jiffies: u32);
}
