use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// What a bounded poll does when its attempts run out without the check passing
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Exhaustion {
    /// Hand the last observed value back to the caller
    #[default]
    ReturnLast,
    /// Raise `HarnessError::RetryExhausted`
    Fail,
}

/// Configuration for the fixed-interval retry loop used by every poll
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of operation invocations (1 means no retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts (in milliseconds)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub on_exhaustion: Exhaustion,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            on_exhaustion: Exhaustion::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            on_exhaustion: Exhaustion::ReturnLast,
        }
    }

    /// A single attempt, failing if it does not pass its check
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            on_exhaustion: Exhaustion::Fail,
        }
    }

    pub fn failing_on_exhaustion(mut self) -> Self {
        self.on_exhaustion = Exhaustion::Fail;
        self
    }

    pub fn returning_last(mut self) -> Self {
        self.on_exhaustion = Exhaustion::ReturnLast;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }

        if self.delay_ms > 600_000 {
            return Err(anyhow::anyhow!("delay_ms should not exceed 10 minutes"));
        }

        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Everything needed to spawn one supervised OS process
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct ProcessSpec {
    /// Short name used to prefix forwarded output and in log fields
    pub label: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }
}

impl ProcessSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_delay_ms() -> u64 {
    2_000
}
