// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::RetryConfig;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),
    #[error("RPC status: {0}")]
    Grpc(tonic::Status),
    #[error("RPC protocol error: {0}")]
    Protocol(String),
    #[error("RPC deadline elapsed")]
    DeadlineElapsed,
}

impl From<tonic::Status> for RpcError {
    fn from(value: tonic::Status) -> Self {
        RpcError::Grpc(value)
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(value: tonic::transport::Error) -> Self {
        RpcError::Transport(value.to_string())
    }
}

impl RpcError {
    /// Transient failures are worth another attempt on the same channel:
    /// transport socket errors, peer resets surfaced as `Unavailable`, and
    /// the cancellation codes gRPC uses while a connection is re-established.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Aborted | tonic::Code::Cancelled
            ),
            RpcError::Protocol(_) => false,
            RpcError::DeadlineElapsed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallState {
    Succeeded,
    Failed,
    Cancelled,
}

/// Uniform outcome of an outbound RPC, including retries.
#[derive(Debug)]
pub struct RpcCallResult<T> {
    state: RpcCallState,
    pub attempts: u32,
    pub duration: Duration,
    pub wait_for_connection: Duration,
    value: Option<T>,
    last_failure: Option<RpcError>,
}

impl<T> RpcCallResult<T> {
    pub fn succeeded(
        value: T,
        attempts: u32,
        duration: Duration,
        wait_for_connection: Duration,
    ) -> Self {
        Self {
            state: RpcCallState::Succeeded,
            attempts,
            duration,
            wait_for_connection,
            value: Some(value),
            last_failure: None,
        }
    }

    pub fn failed(
        failure: RpcError,
        attempts: u32,
        duration: Duration,
        wait_for_connection: Duration,
    ) -> Self {
        Self {
            state: RpcCallState::Failed,
            attempts,
            duration,
            wait_for_connection,
            value: None,
            last_failure: Some(failure),
        }
    }

    pub fn cancelled(attempts: u32, duration: Duration, wait_for_connection: Duration) -> Self {
        Self {
            state: RpcCallState::Cancelled,
            attempts,
            duration,
            wait_for_connection,
            value: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> RpcCallState {
        self.state
    }

    pub fn is_succeeded(&self) -> bool {
        self.state == RpcCallState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == RpcCallState::Cancelled
    }

    /// Panics unless the call succeeded; accessing the value of a failed
    /// call is a programmer error.
    pub fn value(&self) -> &T {
        match self.state {
            RpcCallState::Succeeded => self.value.as_ref().unwrap(),
            other => panic!("RpcCallResult::value() called in state {other:?}"),
        }
    }

    /// Panics unless the call succeeded.
    pub fn into_value(self) -> T {
        match self.state {
            RpcCallState::Succeeded => self.value.unwrap(),
            other => panic!("RpcCallResult::into_value() called in state {other:?}"),
        }
    }

    /// Panics unless the call failed.
    pub fn last_failure(&self) -> &RpcError {
        match self.state {
            RpcCallState::Failed => self.last_failure.as_ref().unwrap(),
            other => panic!("RpcCallResult::last_failure() called in state {other:?}"),
        }
    }
}

/// Backoff delay before the given (1-based) attempt, with jitter applied.
pub fn delay_before_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = config.min_delay.as_millis() as f64 * config.multiplier.powi(exponent as i32);
    let capped = base.min(config.max_delay.as_millis() as f64);
    let jittered = match config.max_jitter_factor {
        Some(factor) if factor > 0.0 => capped * (1.0 + fastrand::f64() * factor),
        _ => capped,
    };
    Duration::from_millis(jittered.min(config.max_delay.as_millis() as f64) as u64)
}

/// Drives a bounded retry loop around `action`.
///
/// Transient failures (per `RpcError::is_transient`) are retried with
/// exponential backoff until the attempt budget or the overall deadline is
/// exhausted; the first non-transient failure surfaces immediately.
/// Cancellation terminates the loop at the next suspension point and yields
/// a `Cancelled` result without further attempts.
pub async fn with_retries<In, F, R>(
    description: &str,
    target: &str,
    config: &RetryConfig,
    deadline: Option<Duration>,
    cancellation: &CancellationToken,
    args: &In,
    action: F,
) -> RpcCallResult<R>
where
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, RpcError>> + 'a + Send>>,
{
    let started = Instant::now();
    let overall_deadline = deadline.map(|d| started + d);
    let mut attempts = 0u32;

    loop {
        if cancellation.is_cancelled() {
            return RpcCallResult::cancelled(attempts, started.elapsed(), Duration::ZERO);
        }

        attempts += 1;
        let attempt_started = Instant::now();

        let result = tokio::select! {
            result = action(args) => Some(result),
            _ = cancellation.cancelled() => None,
        };

        match result {
            None => {
                return RpcCallResult::cancelled(attempts, started.elapsed(), Duration::ZERO);
            }
            Some(Ok(value)) => {
                debug!(
                    target_worker = target,
                    attempts, "{description} succeeded"
                );
                return RpcCallResult::succeeded(
                    value,
                    attempts,
                    started.elapsed(),
                    Duration::ZERO,
                );
            }
            Some(Err(error)) => {
                let attempt_duration = attempt_started.elapsed();
                let out_of_attempts = attempts >= config.max_attempts;
                let out_of_time = overall_deadline
                    .map(|d| Instant::now() >= d)
                    .unwrap_or(false);

                if !error.is_transient() || out_of_attempts || out_of_time {
                    warn!(
                        target_worker = target,
                        attempts,
                        attempt_duration_ms = attempt_duration.as_millis() as u64,
                        "{description} failed: {error}"
                    );
                    return RpcCallResult::failed(
                        error,
                        attempts,
                        started.elapsed(),
                        Duration::ZERO,
                    );
                }

                let delay = delay_before_attempt(config, attempts);
                let delay = match overall_deadline {
                    Some(d) => delay.min(d.saturating_duration_since(Instant::now())),
                    None => delay,
                };
                debug!(
                    target_worker = target,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{description} failed transiently, retrying: {error}"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        return RpcCallResult::cancelled(
                            attempts,
                            started.elapsed(),
                            Duration::ZERO,
                        );
                    }
                }
            }
        }
    }
}
