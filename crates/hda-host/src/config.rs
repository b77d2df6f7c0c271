//! Controller configuration.
//!
//! All fields have defaults so a partial JSON document (or none at all) yields a usable config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HdaError, Result};

/// Duration of one HDA link frame (48 kHz).
pub const LINK_FRAME: Duration = Duration::from_nanos(20_834);

/// How status is gathered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMode {
    /// Status getters re-read hardware registers.
    #[default]
    Poll,
    /// Status is accumulated by the interrupt handler and drained by getters.
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdaConfig {
    pub status_mode: StatusMode,
    /// Upper bound for CORB/RIRB entries (2, 16 or 256). The largest supported size not above
    /// this is selected.
    pub ring_entries: u16,
    /// Responses accumulated before the RIRB raises its response interrupt.
    pub rirb_interrupt_count: u8,
    /// Link frames to wait for a single response.
    pub response_wait_frames: u32,
    /// Extra link frames granted per verb when waiting for a batch.
    pub batch_frames_per_verb: u32,
    /// Fixed link frames added to every batch wait.
    pub batch_base_frames: u32,
    pub poll_interval_us: u64,
    pub immediate_timeout_us: u64,
    pub engine_timeout_us: u64,
    pub controller_reset_timeout_us: u64,
    pub ring_timeout_us: u64,
    /// Delay after leaving controller reset before codecs are sampled in STATESTS.
    pub codec_wake_delay_us: u64,
    /// Delay after a function group reset on codecs that do not answer the reset verb.
    pub silent_reset_delay_us: u64,
    /// Treat RIRB overruns as expected events (acknowledged and logged) instead of errors.
    pub intentional_overrun: bool,
    pub ioc_interrupts: bool,
    pub fifo_error_interrupts: bool,
    pub descriptor_error_interrupts: bool,
    pub traffic_priority: bool,
    /// SDO stripe lines used by output streams (1, 2 or 4).
    pub stripe_lines: u8,
    /// Allowed difference between expected and measured stream position.
    pub position_tolerance_us: u64,
}

impl Default for HdaConfig {
    fn default() -> Self {
        Self {
            status_mode: StatusMode::Poll,
            ring_entries: 256,
            rirb_interrupt_count: 1,
            response_wait_frames: 1,
            batch_frames_per_verb: 1,
            batch_base_frames: 2,
            poll_interval_us: 1,
            immediate_timeout_us: 1_000,
            engine_timeout_us: 1_000,
            controller_reset_timeout_us: 10_000,
            ring_timeout_us: 1_000,
            codec_wake_delay_us: 521,
            silent_reset_delay_us: 2_000,
            intentional_overrun: false,
            ioc_interrupts: true,
            fifo_error_interrupts: true,
            descriptor_error_interrupts: true,
            traffic_priority: false,
            stripe_lines: 1,
            position_tolerance_us: 2_000,
        }
    }
}

impl HdaConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.ring_entries, 2 | 16 | 256) {
            return Err(HdaError::InvalidConfig(format!(
                "ring_entries must be 2, 16 or 256 (got {})",
                self.ring_entries
            )));
        }
        if !matches!(self.stripe_lines, 1 | 2 | 4) {
            return Err(HdaError::InvalidConfig(format!(
                "stripe_lines must be 1, 2 or 4 (got {})",
                self.stripe_lines
            )));
        }
        if self.response_wait_frames == 0 {
            return Err(HdaError::InvalidConfig(
                "response_wait_frames must be non-zero".to_string(),
            ));
        }
        if self.poll_interval_us == 0 {
            return Err(HdaError::InvalidConfig(
                "poll_interval_us must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn response_timeout(&self) -> Duration {
        LINK_FRAME * self.response_wait_frames
    }

    pub fn batch_timeout(&self, verbs: usize) -> Duration {
        let per_verb = u32::try_from(verbs).unwrap_or(u32::MAX);
        LINK_FRAME
            * self
                .batch_base_frames
                .saturating_add(self.batch_frames_per_verb.saturating_mul(per_verb))
    }

    pub fn immediate_timeout(&self) -> Duration {
        Duration::from_micros(self.immediate_timeout_us)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_micros(self.engine_timeout_us)
    }

    pub fn controller_reset_timeout(&self) -> Duration {
        Duration::from_micros(self.controller_reset_timeout_us)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_micros(self.ring_timeout_us)
    }

    pub fn codec_wake_delay(&self) -> Duration {
        Duration::from_micros(self.codec_wake_delay_us)
    }

    pub fn silent_reset_delay(&self) -> Duration {
        Duration::from_micros(self.silent_reset_delay_us)
    }

    pub fn position_tolerance(&self) -> Duration {
        Duration::from_micros(self.position_tolerance_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = HdaConfig::from_json(r#"{"status_mode": "interrupt", "ring_entries": 16}"#)
            .unwrap();
        assert_eq!(config.status_mode, StatusMode::Interrupt);
        assert_eq!(config.ring_entries, 16);
        assert_eq!(config.response_wait_frames, 1);
        assert_eq!(config.codec_wake_delay(), Duration::from_micros(521));
    }

    #[test]
    fn invalid_ring_size_is_rejected() {
        let err = HdaConfig::from_json(r#"{"ring_entries": 64}"#).unwrap_err();
        assert!(err.to_string().contains("ring_entries"));
    }

    #[test]
    fn malformed_json_maps_to_config_error() {
        let err = HdaConfig::from_json("{").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Config);
    }

    #[test]
    fn batch_timeout_scales_with_batch_size() {
        let config = HdaConfig::default();
        assert_eq!(config.response_timeout(), LINK_FRAME);
        assert_eq!(config.batch_timeout(0), LINK_FRAME * 2);
        assert_eq!(config.batch_timeout(10), LINK_FRAME * 12);
    }
}
