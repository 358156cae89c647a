//! Bounded retry for device operations.
//
// Drivers never retry on their own. The control loop decides how often an
// operation is repeated by wrapping each call site in one of the helpers
// below, which also enforce the per-call timeout.

use crate::error::{AppResult, DaqError};
use crate::instrument::DeviceChannel;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_factor: f64,
    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.backoff_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    pub(crate) fn validate(&self, what: &str) -> AppResult<()> {
        if self.max_attempts == 0 {
            return Err(DaqError::Configuration(format!(
                "{what}: max_attempts must be at least 1"
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(DaqError::Configuration(format!(
                "{what}: backoff_factor must be >= 1.0"
            )));
        }
        Ok(())
    }
}

/// Awaits `operation`, converting an elapsed deadline into a [`DaqError::Comm`].
pub async fn with_timeout<T>(
    device: &str,
    limit: Duration,
    operation: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(DaqError::comm(device, format!("no reply within {limit:?}"))),
    }
}

/// Reads from `device`, retrying transient faults according to `policy`.
///
/// `on_retry` is invoked with the failed attempt number and its error before
/// every backoff sleep.
pub async fn read_with_retry<D>(
    device: &mut D,
    policy: &RetryPolicy,
    call_timeout: Duration,
    mut on_retry: impl FnMut(u32, &DaqError) + Send,
) -> AppResult<D::Reading>
where
    D: DeviceChannel + ?Sized,
{
    let name = device.name().to_string();
    let mut attempt = 1;
    loop {
        match with_timeout(&name, call_timeout, device.read()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                on_retry(attempt, &err);
                sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sends `value` to `device`, retrying transient faults according to `policy`.
pub async fn command_with_retry<D>(
    device: &mut D,
    value: D::Command,
    policy: &RetryPolicy,
    call_timeout: Duration,
    mut on_retry: impl FnMut(u32, &DaqError) + Send,
) -> AppResult<()>
where
    D: DeviceChannel + ?Sized,
{
    let name = device.name().to_string();
    let mut attempt = 1;
    loop {
        match with_timeout(&name, call_timeout, device.command(value.clone())).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                on_retry(attempt, &err);
                sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Connects `device`, retrying with backoff. The final error always names the device.
pub async fn connect_with_retry<D>(
    device: &mut D,
    policy: &RetryPolicy,
    call_timeout: Duration,
    mut on_failure: impl FnMut(u32, &DaqError) + Send,
) -> AppResult<()>
where
    D: DeviceChannel + ?Sized,
{
    let name = device.name().to_string();
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(call_timeout, device.connect()).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::connect(
                &name,
                format!("no reply within {call_timeout:?}"),
            )),
        };
        match result {
            Ok(()) => {
                debug!(device = %name, attempt, "connected");
                return Ok(());
            }
            Err(err) => {
                on_failure(attempt, &err);
                if attempt >= policy.max_attempts {
                    let reason = match err {
                        DaqError::DeviceConnect { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return Err(DaqError::connect(
                        &name,
                        format!("gave up after {attempt} attempts: {reason}"),
                    ));
                }
                sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::convert::Infallible;

    struct FlakyDevice {
        attempts: u32,
        succeed_on_attempt: u32,
        connected: bool,
    }

    impl FlakyDevice {
        fn new(succeed_on_attempt: u32) -> Self {
            Self {
                attempts: 0,
                succeed_on_attempt,
                connected: false,
            }
        }
    }

    #[async_trait]
    impl DeviceChannel for FlakyDevice {
        type Reading = f64;
        type Command = Infallible;

        fn name(&self) -> &str {
            "flaky"
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> AppResult<()> {
            self.attempts += 1;
            if self.attempts >= self.succeed_on_attempt {
                self.connected = true;
                Ok(())
            } else {
                Err(DaqError::connect("flaky", "refused"))
            }
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        async fn read(&mut self) -> AppResult<f64> {
            self.attempts += 1;
            if self.attempts >= self.succeed_on_attempt {
                Ok(21.5)
            } else {
                Err(DaqError::comm("flaky", "garbled"))
            }
        }

        async fn command(&mut self, value: Infallible) -> AppResult<()> {
            match value {}
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
        assert_eq!(policy.delay_after(9), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retry_succeeds() {
        let mut device = FlakyDevice::new(2);
        let mut retries = Vec::new();
        let value = read_with_retry(&mut device, &fast_policy(3), Duration::from_secs(1), |n, _| {
            retries.push(n)
        })
        .await
        .unwrap();
        assert_eq!(value, 21.5);
        assert_eq!(device.attempts, 2);
        assert_eq!(retries, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retry_gives_up() {
        let mut device = FlakyDevice::new(4);
        let result =
            read_with_retry(&mut device, &fast_policy(3), Duration::from_secs(1), |_, _| {}).await;
        assert!(matches!(result, Err(DaqError::Comm { .. })));
        assert_eq!(device.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_names_device() {
        let mut device = FlakyDevice::new(10);
        let mut failures = 0;
        let err = connect_with_retry(&mut device, &fast_policy(2), Duration::from_secs(1), |_, _| {
            failures += 1
        })
        .await
        .unwrap_err();
        assert_eq!(failures, 2);
        match err {
            DaqError::DeviceConnect { device, reason } => {
                assert_eq!(device, "flaky");
                assert!(reason.contains("2 attempts"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        assert!(fast_policy(0).validate("retry").is_err());
        assert!(fast_policy(1).validate("retry").is_ok());
    }
}
