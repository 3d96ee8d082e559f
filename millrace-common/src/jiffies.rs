//! Jiffy time arithmetic
//!
//! The pipeline expresses every duration and offset in jiffies: a fixed
//! resolution chosen so that one sample is a whole number of jiffies at
//! every supported sample rate (56,448,000 = lcm of the 44.1k and 48k
//! rate families). Converting between jiffies, samples and milliseconds
//! is therefore exact, which is what lets ramps and splits stay
//! sample-accurate.

use crate::error::{Error, Result};

/// Jiffies per second. lcm(384000, 352800).
pub const PER_SECOND: u32 = 56_448_000;

/// Jiffies per millisecond.
pub const PER_MS: u32 = PER_SECOND / 1000;

/// Sample rates the pipeline accepts for PCM audio.
const PCM_RATES: &[u32] = &[
    7350, 8000, 11025, 12000, 14700, 16000, 22050, 24000, 29400, 32000, 44100, 48000, 88200,
    96000, 176400, 192000, 352800, 384000,
];

/// Sample rates only seen for DSD streams.
const DSD_RATES: &[u32] = &[1_411_200, 2_822_400, 5_644_800];

/// True if `rate` is a sample rate the pipeline supports (PCM or DSD).
pub fn is_valid_sample_rate(rate: u32) -> bool {
    PCM_RATES.contains(&rate) || DSD_RATES.contains(&rate)
}

/// Jiffies in one sample at `rate`.
///
/// Returns `Err(SampleRateInvalid)` for rates outside the supported table.
pub fn try_per_sample(rate: u32) -> Result<u32> {
    if is_valid_sample_rate(rate) {
        Ok(PER_SECOND / rate)
    } else {
        Err(Error::SampleRateInvalid(rate))
    }
}

/// Jiffies in one sample at `rate`.
///
/// An unsupported rate here means a stream with a bad header got past the
/// codec layer, which is a contract breach rather than a runtime condition.
pub fn per_sample(rate: u32) -> u32 {
    match try_per_sample(rate) {
        Ok(j) => j,
        Err(_) => panic!("unsupported sample rate: {rate}"),
    }
}

/// Whole samples in `jiffies` at `rate` (truncating).
pub fn to_samples(jiffies: u32, rate: u32) -> u32 {
    jiffies / per_sample(rate)
}

/// Whole samples in a 64-bit jiffy count (used for track offsets).
pub fn to_samples64(jiffies: u64, rate: u32) -> u64 {
    jiffies / per_sample(rate) as u64
}

/// Jiffies in `samples` at `rate`.
pub fn from_samples(samples: u32, rate: u32) -> u32 {
    samples * per_sample(rate)
}

/// Milliseconds in `jiffies` (truncating).
pub fn to_ms(jiffies: u32) -> u32 {
    jiffies / PER_MS
}

/// Jiffies in `ms`.
pub fn from_ms(ms: u32) -> u32 {
    ms * PER_MS
}

/// Round `jiffies` down to a whole number of samples at `rate`.
pub fn round_down(jiffies: u32, rate: u32) -> u32 {
    jiffies - jiffies % per_sample(rate)
}

/// Round `jiffies` up to a whole number of samples at `rate`.
pub fn round_up(jiffies: u32, rate: u32) -> u32 {
    let per = per_sample(rate);
    let j = jiffies + per - 1;
    j - j % per
}

/// Byte count for a whole-sample span of `jiffies` at the given geometry.
///
/// Returns the rounded-down jiffies alongside the byte length so callers
/// can account for the part of the request that fell below one sample.
pub fn to_bytes(jiffies: u32, rate: u32, channels: u32, bit_depth: u32) -> (u32, usize) {
    let rounded = round_down(jiffies, rate);
    let samples = rounded / per_sample(rate);
    let bytes = (samples as usize * channels as usize * bit_depth as usize + 7) / 8;
    (rounded, bytes)
}
