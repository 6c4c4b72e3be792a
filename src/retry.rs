use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// Bounded retry with a fixed delay between attempts.
///
/// Every failure goes through a classifier: only errors it reports as
/// retryable trigger another attempt, anything else is returned right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or runs out of attempts.
    pub fn run<T, E, C, F>(&self, context: &str, is_retryable: C, op: F) -> Result<T, E>
    where
        E: Display,
        C: Fn(&E) -> bool,
        F: FnMut() -> Result<T, E>,
    {
        self.run_with_sleep(context, is_retryable, op, thread::sleep)
    }

    /// Same as [RetryPolicy::run] with a custom sleep function.
    pub fn run_with_sleep<T, E, C, F, S>(
        &self,
        context: &str,
        is_retryable: C,
        mut op: F,
        mut sleep: S,
    ) -> Result<T, E>
    where
        E: Display,
        C: Fn(&E) -> bool,
        F: FnMut() -> Result<T, E>,
        S: FnMut(Duration),
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    warn!(%err, "'{context}' failed after {max_attempts} attempts");
                    return Err(err);
                }
                Err(err) => {
                    info!(%err, "[{attempt}/{max_attempts}] '{context}' failed, retrying in {:?}", self.delay);
                    sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}
