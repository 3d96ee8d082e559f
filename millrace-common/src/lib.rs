//! # Millrace Common (millrace-common)
//!
//! Shared substrate for the millrace audio pipeline: the jiffy time unit,
//! error types, configuration, the notification thread that delivers
//! observer callbacks off the real-time paths, and a counting semaphore.
//!
//! Nothing in this crate touches audio data; it exists so that
//! `millrace-pipeline` (and any future pipeline-adjacent crate) agree on
//! time arithmetic and ambient plumbing.

pub mod config;
pub mod error;
pub mod jiffies;
pub mod observer;
pub mod sync;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use observer::NotifierThread;
pub use sync::Semaphore;
