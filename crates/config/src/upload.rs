#![forbid(unsafe_code)]

use crate::{Error, MAX_DURATION};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Upload {
    /// A batch is cut as soon as it holds this many items.
    pub max_batch_items: usize,

    /// A batch is cut before its serialized size would exceed this many
    /// bytes. An item larger than the limit is sent in a batch of its own.
    pub max_batch_bytes: usize,

    /// Longest time an item may sit in the buffer before the buffer is cut
    /// into a batch regardless of size. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub max_buffer_duration: Duration,

    /// Maximum number of batches being sent concurrently. `None` means no
    /// cap: a new batch is sent as soon as it is formed.
    pub max_in_flight: Option<usize>,

    /// Capacity of the channel between producers and the batching loop.
    /// Producers wait once it is full.
    pub queue_capacity: usize,

    /// Whether buffered items are sent (`true`) or discarded (`false`) when
    /// the batcher is stopped.
    pub flush_on_stop: bool,

    pub retry: Retry,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            max_batch_items: 100,
            max_batch_bytes: 1 << 20,
            max_buffer_duration: Duration::from_secs(1),
            max_in_flight: None,
            queue_capacity: 64,
            flush_on_stop: true,
            retry: Retry::default(),
        }
    }
}

impl Upload {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_batch_items == 0 {
            return Err(Error::Invalid("upload.max_batch_items must be positive".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::Invalid("upload.max_batch_bytes must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Invalid("upload.queue_capacity must be positive".into()));
        }
        if self.max_in_flight == Some(0) {
            return Err(Error::Invalid("upload.max_in_flight must be positive when set".into()));
        }
        if self.max_buffer_duration > MAX_DURATION {
            return Err(Error::Invalid(format!(
                "upload.max_buffer_duration must not exceed {}ms",
                MAX_DURATION.as_millis()
            )));
        }
        if self.retry.max_backoff > MAX_DURATION {
            return Err(Error::Invalid(format!(
                "upload.retry.max_backoff must not exceed {}ms",
                MAX_DURATION.as_millis()
            )));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(Error::Invalid(
                "upload.retry.base_backoff exceeds upload.retry.max_backoff".into(),
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retry {
    /// Delay before the first resend of a failed batch. Each further failure
    /// doubles it. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub base_backoff: Duration,

    /// Upper bound for the resend delay. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub max_backoff: Duration,

    /// Number of failed attempts after which a batch is dropped. `None`
    /// retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: Some(5),
        }
    }
}

impl Retry {
    /// Delay before the resend following the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_valid() {
        Upload::default().validate().unwrap();
    }

    #[test]
    fn zero_in_flight_cap_is_rejected() {
        let upload = Upload {
            max_in_flight: Some(0),
            ..Default::default()
        };
        assert!(matches!(upload.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let too_long = MAX_DURATION + Duration::from_secs(1);
        let upload = Upload {
            max_buffer_duration: too_long,
            ..Default::default()
        };
        assert!(matches!(upload.validate(), Err(Error::Invalid(_))));

        let upload = Upload {
            retry: Retry {
                max_backoff: too_long,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(upload.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let retry = Retry {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: None,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn backoff_is_bounded_and_monotonic(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..100_000,
            attempt in 1u32..64,
        ) {
            let retry = Retry {
                base_backoff: Duration::from_millis(base_ms),
                max_backoff: Duration::from_millis(base_ms + extra_ms),
                max_attempts: None,
            };
            let delay = retry.backoff(attempt);
            prop_assert!(delay >= retry.base_backoff);
            prop_assert!(delay <= retry.max_backoff);
            prop_assert!(retry.backoff(attempt + 1) >= delay);
        }
    }
}
