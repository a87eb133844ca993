use std::time::Duration;

use crate::config::DispatcherSettings;
use crate::utils::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How often progress is checkpointed. `None` disables checkpointing.
    pub checkpoint_interval: Option<Duration>,
    pub checkpoint_timeout: Duration,
    /// A pending message older than this is reported as stalled.
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    /// How often resolved publish futures are processed.
    pub process_interval: Duration,
    pub base_retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Some(Duration::from_secs(5)),
            checkpoint_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(5 * 60),
            stall_check_interval: Duration::from_secs(30),
            process_interval: Duration::from_millis(100),
            base_retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let positive = [
            ("checkpoint timeout", self.checkpoint_timeout),
            ("stall timeout", self.stall_timeout),
            ("stall check interval", self.stall_check_interval),
            ("process interval", self.process_interval),
            ("base retry interval", self.base_retry_interval),
            ("max retry interval", self.max_retry_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ProtocolError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.checkpoint_interval.is_some_and(|d| d.is_zero()) {
            return Err(ProtocolError::InvalidConfig(
                "checkpoint interval must be positive when enabled".into(),
            ));
        }
        if self.base_retry_interval > self.max_retry_interval {
            return Err(ProtocolError::InvalidConfig(format!(
                "base retry interval {:?} exceeds max retry interval {:?}",
                self.base_retry_interval, self.max_retry_interval
            )));
        }
        Ok(())
    }

    pub fn without_checkpointing(mut self) -> Self {
        self.checkpoint_interval = None;
        self
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        let ms = Duration::from_millis;
        Self {
            checkpoint_interval: (settings.checkpoint_interval_ms > 0)
                .then(|| ms(settings.checkpoint_interval_ms)),
            checkpoint_timeout: ms(settings.checkpoint_timeout_ms),
            stall_timeout: ms(settings.stall_timeout_ms),
            stall_check_interval: ms(settings.stall_check_interval_ms),
            process_interval: ms(settings.process_interval_ms),
            base_retry_interval: ms(settings.base_retry_interval_ms),
            max_retry_interval: ms(settings.max_retry_interval_ms),
        }
    }
}
