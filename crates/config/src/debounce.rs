use crate::{Error, MAX_DURATION};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Debounce {
    /// Quiet time after the last configuration fragment for a process before
    /// its probe set is considered complete. **Measured in milliseconds**.
    ///
    /// ## Note
    ///
    /// Tracers deliver their probe configurations one at a time with no
    /// marker for the end of a round. A longer period means fewer partial
    /// updates at the cost of latency.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub idle_period: Duration,
}

impl Default for Debounce {
    fn default() -> Self {
        Self {
            idle_period: Duration::from_millis(200),
        }
    }
}

impl Debounce {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.idle_period > MAX_DURATION {
            return Err(Error::Invalid(format!(
                "debounce.idle_period must not exceed {}ms",
                MAX_DURATION.as_millis()
            )));
        }
        Ok(())
    }
}
