//! Storage configuration
//!
//! Block size, key-service timeout and the timestamp window the parser
//! accepts.

use crate::block::ALIGN_SIZE;

const MINUTE_MILLIS: u64 = 60 * 1000;
const DAY_MILLIS: u64 = 24 * 60 * MINUTE_MILLIS;

/// Timestamp window for incoming messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolLimits {
    /// How far a message timestamp may be ahead of the local clock
    pub max_future_skew_millis: u64,
    /// How old a message may be before it is rejected as a replay
    pub max_message_age_millis: u64,
}

impl ProtocolLimits {
    /// Production window (10 min ahead, 14 days old)
    pub const PROD: Self = Self {
        max_future_skew_millis: 10 * MINUTE_MILLIS,
        max_message_age_millis: 14 * DAY_MILLIS,
    };

    /// No effective window, for tests that replay old fragments
    pub const RELAXED: Self = Self {
        max_future_skew_millis: u64::MAX,
        max_message_age_millis: u64::MAX,
    };
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self::PROD
    }
}

/// Storage configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    /// Block size of the store file
    pub align_size: usize,
    /// Seconds the key-custody service may take to answer
    pub key_service_timeout_secs: u32,
    pub limits: ProtocolLimits,
}

impl StorageConfig {
    /// Create config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_align_size(mut self, align_size: usize) -> Self {
        self.align_size = align_size;
        self
    }

    #[must_use]
    pub fn with_key_service_timeout(mut self, secs: u32) -> Self {
        self.key_service_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ProtocolLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            align_size: ALIGN_SIZE,
            key_service_timeout_secs: 30,
            limits: ProtocolLimits::PROD,
        }
    }
}
