//! Transfer configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::gpu::error::{GPUError, Result};
use crate::gpu::QueueType;

pub const STAGING_BYTES_VAR: &str = "STAGECOACH_STAGING_BYTES";
pub const COPY_ALIGNMENT_VAR: &str = "STAGECOACH_COPY_ALIGNMENT";

/// Configuration for a [`crate::TransferOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransferConfig {
    /// Size of the staging arena (default: 64 MB). One upload fits when its
    /// payloads, each rounded up to the copy alignment, sum to at most this.
    /// Sizes that are not a power of two may lose a little to bucketing; see
    /// [`crate::StagingRing::capacity`].
    pub staging_capacity: u64,
    /// Alignment of every staged payload. Must be a power of two.
    pub copy_alignment: u64,
    /// Queue the copies are recorded on.
    pub source_queue: QueueType,
    /// Queue that consumes the uploaded resources.
    pub destination_queue: QueueType,
    /// Attach debug names to recorded command buffers.
    pub debug_labels: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 64 * 1024 * 1024,
            copy_alignment: 16,
            source_queue: QueueType::Transfer,
            destination_queue: QueueType::Graphics,
            debug_labels: cfg!(debug_assertions),
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by `STAGECOACH_STAGING_BYTES` and
    /// `STAGECOACH_COPY_ALIGNMENT` when set.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    pub fn with_env(mut self) -> Result<Self> {
        if let Some(bytes) = read_var(STAGING_BYTES_VAR)? {
            self.staging_capacity = bytes;
        }
        if let Some(align) = read_var(COPY_ALIGNMENT_VAR)? {
            self.copy_alignment = align;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_staging_capacity(mut self, bytes: u64) -> Self {
        self.staging_capacity = bytes;
        self
    }

    pub fn with_copy_alignment(mut self, alignment: u64) -> Self {
        self.copy_alignment = alignment;
        self
    }

    pub fn with_queues(mut self, source: QueueType, destination: QueueType) -> Self {
        self.source_queue = source;
        self.destination_queue = destination;
        self
    }

    pub fn with_debug_labels(mut self, enable: bool) -> Self {
        self.debug_labels = enable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.staging_capacity == 0 || self.staging_capacity > u32::MAX as u64 {
            return Err(GPUError::invalid(format!(
                "staging capacity {} out of range",
                self.staging_capacity
            )));
        }
        if !self.copy_alignment.is_power_of_two() {
            return Err(GPUError::invalid(format!(
                "copy alignment {} is not a power of two",
                self.copy_alignment
            )));
        }
        Ok(())
    }
}

fn read_var(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| GPUError::invalid(format!("{name}={value:?} is not a byte count"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        std::env::set_var(STAGING_BYTES_VAR, "4096");
        std::env::set_var(COPY_ALIGNMENT_VAR, "256");
        let config = TransferConfig::from_env().unwrap();
        std::env::remove_var(STAGING_BYTES_VAR);
        std::env::remove_var(COPY_ALIGNMENT_VAR);

        assert_eq!(config.staging_capacity, 4096);
        assert_eq!(config.copy_alignment, 256);
        assert_eq!(config.destination_queue, QueueType::Graphics);
    }

    #[test]
    #[serial]
    fn bad_env_values_are_rejected() {
        std::env::set_var(COPY_ALIGNMENT_VAR, "24");
        let err = TransferConfig::from_env().unwrap_err();
        std::env::set_var(COPY_ALIGNMENT_VAR, "lots");
        let parse_err = TransferConfig::from_env().unwrap_err();
        std::env::remove_var(COPY_ALIGNMENT_VAR);

        assert!(matches!(err, GPUError::InvalidArgument { .. }));
        assert!(matches!(parse_err, GPUError::InvalidArgument { .. }));
    }
}
