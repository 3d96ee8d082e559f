//! # Millrace Pipeline (millrace-pipeline)
//!
//! Flow-control core of a real-time audio pipeline: a chain of pull-based
//! elements that move encoded/decoded audio from sources through codecs
//! toward a hardware animator while absorbing jitter, stream transitions,
//! seeks and starvation without audible glitches.
//!
//! The three elements implemented here share one message algebra
//! ([`msg::Msg`], a closed set of kinds with strict ordering rules), one
//! concurrency model (single-consumer pull chains, with threads only where
//! [`starvation_ramper`] explicitly introduces them) and one
//! signal-processing discipline (sample-accurate [`ramp`]s so transitions
//! never click):
//!
//! - [`rewinder::Rewinder`] — lookahead/backtrack buffer that lets codec
//!   recognition replay the start of a stream segment without re-fetching.
//! - [`starvation_ramper::StarvationRamper`] — bounded threaded buffer that
//!   conceals underruns by synthesizing a decaying "flywheel" tail from
//!   recent audio.
//! - [`variable_delay`] — left/right pair injecting or removing latency
//!   through ramped transitions, compensating for animator latency.
//!
//! Device control, codecs and vendor streaming clients are out of scope;
//! they appear only behind the narrow traits in [`element`].

pub mod element;
pub mod flywheel;
pub mod msg;
pub mod pool;
pub mod queue;
pub mod ramp;
pub mod rewinder;
pub mod starvation_ramper;
pub mod variable_delay;

pub use element::{Animator, ClockPuller, StreamHandler, UpstreamElement};
pub use msg::{Msg, MsgFactory};
pub use rewinder::Rewinder;
pub use starvation_ramper::StarvationRamper;
pub use variable_delay::{VariableDelayLeft, VariableDelayRight};
