//! Pipeline configuration
//!
//! Durations are configured in milliseconds (the natural unit for humans
//! and config files) and converted to jiffies at the point of use.
//! Everything has a sensible default so an empty TOML file is valid.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::jiffies;

/// Message pool sizing. Pools are fixed-capacity by design: exhaustion is
/// back-pressure on the producer, not a reason to grow the heap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Encoded-audio payload buffers.
    pub encoded_audio: usize,
    /// Decoded-audio payload buffers.
    pub decoded_audio: usize,
    /// Bytes per encoded-audio buffer.
    pub encoded_audio_bytes: usize,
    /// Bytes per decoded-audio buffer.
    pub decoded_audio_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            encoded_audio: 768,
            decoded_audio: 512,
            encoded_audio_bytes: 6 * 1024,
            decoded_audio_bytes: 8 * 1024,
        }
    }
}

/// Configuration for the flow-control elements.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// StarvationRamper reservoir ceiling in ms of buffered audio.
    pub starvation_buffer_ms: u32,

    /// StarvationRamper reservoir ceiling as a count of buffered
    /// stream/track boundaries.
    pub max_buffered_streams: u32,

    /// Ramp-up duration after a starvation event, in ms.
    pub ramp_up_ms: u32,

    /// Ramp duration either side of a delay adjustment, in ms.
    pub delay_ramp_ms: u32,

    /// Minimum delay the right-hand VariableDelay always applies, in ms.
    pub min_delay_ms: u32,

    /// Delay the left-hand VariableDelay leaves for downstream elements
    /// to apply, in ms.
    pub downstream_delay_ms: u32,

    /// Maximum count of encoded-audio messages the Rewinder buffers before
    /// it stops pulling upstream.
    pub rewinder_max_audio_msgs: u32,

    /// Message pool sizes.
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            starvation_buffer_ms: 100,
            max_buffered_streams: 10,
            ramp_up_ms: 100,
            delay_ramp_ms: 100,
            min_delay_ms: 0,
            downstream_delay_ms: 150,
            rewinder_max_audio_msgs: 100,
            pool: PoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.starvation_buffer_ms == 0 {
            return Err(Error::InvalidValue(
                "starvation_buffer_ms must be non-zero".into(),
            ));
        }
        if self.max_buffered_streams == 0 {
            return Err(Error::InvalidValue(
                "max_buffered_streams must be non-zero".into(),
            ));
        }
        if self.rewinder_max_audio_msgs == 0 {
            return Err(Error::InvalidValue(
                "rewinder_max_audio_msgs must be non-zero".into(),
            ));
        }
        if self.pool.encoded_audio == 0 || self.pool.decoded_audio == 0 {
            return Err(Error::InvalidValue("pool sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// StarvationRamper reservoir ceiling in jiffies.
    pub fn starvation_buffer_jiffies(&self) -> u32 {
        jiffies::from_ms(self.starvation_buffer_ms)
    }

    /// Starvation ramp-up duration in jiffies.
    pub fn ramp_up_jiffies(&self) -> u32 {
        jiffies::from_ms(self.ramp_up_ms)
    }

    /// Delay ramp duration in jiffies.
    pub fn delay_ramp_jiffies(&self) -> u32 {
        jiffies::from_ms(self.delay_ramp_ms)
    }

    /// Minimum right-hand delay in jiffies.
    pub fn min_delay_jiffies(&self) -> u32 {
        jiffies::from_ms(self.min_delay_ms)
    }

    /// Downstream delay reservation in jiffies.
    pub fn downstream_delay_jiffies(&self) -> u32 {
        jiffies::from_ms(self.downstream_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_takes_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config.starvation_buffer_ms, 100);
        assert_eq!(config.pool.decoded_audio, 512);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: PipelineConfig = toml::from_str(
            "starvation_buffer_ms = 250\n[pool]\nencoded_audio = 64\n",
        )
        .unwrap();
        assert_eq!(config.starvation_buffer_ms, 250);
        assert_eq!(config.pool.encoded_audio, 64);
        // untouched keys keep defaults
        assert_eq!(config.ramp_up_ms, 100);
        assert_eq!(config.pool.decoded_audio, 512);
    }

    #[test]
    fn zero_buffer_rejected() {
        let config: PipelineConfig = toml::from_str("starvation_buffer_ms = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
