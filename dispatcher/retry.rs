//! Retry policies for webhook delivery. `Retry` is an iterator of `Delay`
//! futures: the first yields immediately, every subsequent one sleeps for
//! the policy's delay (plus jitter) before resolving.

use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimpleRetry {
    pub max_num_attempts: u32,
    pub delay_s: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExponentialBackoffRetry {
    pub max_num_attempts: u32,
    pub delay_s: Duration,
    pub max_delay_s: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RetryConfig {
    SimpleRetry(SimpleRetry),
    ExponentialBackoffRetry(ExponentialBackoffRetry),
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::ExponentialBackoffRetry(ExponentialBackoffRetry {
            max_num_attempts: 5,
            delay_s: Duration::from_secs(10),
            max_delay_s: Duration::from_secs(300),
        })
    }
}

// Inclusive of first attempt. The initial delay is always zero.
#[derive(Debug)]
pub struct Retry {
    config: Option<RetryConfig>,
    /// Inclusive of the initial attempt. A retry instance that will perform
    /// no retries should set this to 1. Zero means this iterator yields
    /// nothing.
    total_attempts_limit: u32,
    current_attempt: u32,
}

impl Retry {
    pub fn with_config(c: RetryConfig) -> Self {
        let retries_limit = match c {
            | RetryConfig::SimpleRetry(SimpleRetry { max_num_attempts, .. }) => max_num_attempts,
            | RetryConfig::ExponentialBackoffRetry(ExponentialBackoffRetry {
                max_num_attempts,
                ..
            }) => max_num_attempts,
        };
        Self {
            config: Some(c),
            total_attempts_limit: retries_limit,
            current_attempt: 0,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            config: None,
            total_attempts_limit: 1,
            current_attempt: 0,
        }
    }

    /// Returns the duration to sleep for the *next* attempt, or `None` if no
    /// more attempts remain.
    fn next_duration(&mut self) -> Option<Duration> {
        if self.current_attempt > self.total_attempts_limit {
            return None;
        }

        match self.config {
            | Some(RetryConfig::SimpleRetry(SimpleRetry { delay_s, .. })) => Some(delay_s),
            | Some(RetryConfig::ExponentialBackoffRetry(ExponentialBackoffRetry {
                delay_s,
                max_delay_s,
                ..
            })) => Some(std::cmp::min(
                max_delay_s,
                // current_attempt is at least 2 here (attempt 1 never calls
                // next_duration), so this never underflows.
                delay_s * 2_u32.pow(self.current_attempt - 2),
            )),
            | None => None,
        }
    }
}

#[derive(Debug)]
pub struct Delay {
    duration: Duration,
    attempt_counter: u32,
    remaining_attempts: u32,
    sleep: Pin<Box<tokio::time::Sleep>>,
}

impl Delay {
    fn new(duration: Duration, attempt_counter: u32, remaining_attempts: u32) -> Self {
        Self {
            duration,
            attempt_counter,
            remaining_attempts,
            sleep: Box::pin(tokio::time::sleep(duration)),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn remaining(&self) -> u32 {
        self.remaining_attempts
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_counter
    }

    pub fn first_attempt(&self) -> bool {
        self.attempt_counter == 1
    }

    pub fn last_attempt(&self) -> bool {
        self.remaining_attempts == 0
    }
}

impl std::future::Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        if self.attempt_counter == 1 {
            return std::task::Poll::Ready(());
        }
        self.sleep.as_mut().poll(cx)
    }
}

impl Iterator for Retry {
    type Item = Delay;

    fn next(&mut self) -> Option<Self::Item> {
        self.current_attempt += 1;
        if self.current_attempt == 1 {
            return Some(Delay::new(
                Duration::ZERO,
                self.current_attempt,
                self.total_attempts_limit.saturating_sub(self.current_attempt),
            ));
        }

        self.next_duration().map(|d| {
            let jitter = Duration::from_millis((rand::random::<u16>() % 1000).into());
            Delay::new(
                d + jitter,
                self.current_attempt,
                self.total_attempts_limit.saturating_sub(self.current_attempt),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_retry_policy() {
        let mut retry_policy = Retry::no_retry();

        let delay = retry_policy.next().unwrap();
        assert_eq!(1, delay.attempt_number());
        assert_eq!(0, delay.remaining());
        assert_eq!(0, delay.duration().as_millis());
        assert!(delay.first_attempt());
        assert!(delay.last_attempt());

        assert!(retry_policy.next().is_none());
    }

    #[tokio::test]
    async fn simple_retry_policy_delays() {
        let dur = Duration::from_millis(50);
        let config = RetryConfig::SimpleRetry(SimpleRetry {
            max_num_attempts: 3,
            delay_s: dur,
        });
        let mut retry_policy = Retry::with_config(config);

        let first = retry_policy.next().unwrap();
        assert_eq!(1, first.attempt_number());
        assert_eq!(2, first.remaining());
        assert_eq!(0, first.duration().as_millis());

        let second = retry_policy.next().unwrap();
        assert_eq!(2, second.attempt_number());
        assert_eq!(1, second.remaining());
        assert!(second.duration() >= dur);

        let third = retry_policy.next().unwrap();
        assert_eq!(3, third.attempt_number());
        assert!(third.last_attempt());

        assert!(retry_policy.next().is_none());
    }

    #[tokio::test]
    async fn exponential_retry_policy_caps_at_max_delay() {
        let min_dur = Duration::from_millis(10);
        let max_dur = Duration::from_millis(50);
        let config = RetryConfig::ExponentialBackoffRetry(ExponentialBackoffRetry {
            max_num_attempts: 5,
            delay_s: min_dur,
            max_delay_s: max_dur,
        });
        let mut retry_policy = Retry::with_config(config);

        for _ in 0..5 {
            let delay = retry_policy.next().unwrap();
            assert!(delay.duration() <= max_dur + Duration::from_millis(1000));
        }
        assert!(retry_policy.next().is_none());
    }
}
