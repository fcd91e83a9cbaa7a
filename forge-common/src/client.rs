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
use crate::retries::{delay_before_attempt, RpcCallResult, RpcError};
use http::Uri;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct GrpcClientConfig {
    pub retries: RetryConfig,
    pub connect_timeout: Duration,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            retries: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    TransportError,
    ReconnectDeadlineElapsed,
    KeepaliveTimeout,
    PeerClosed,
}

#[derive(Debug, Clone)]
pub struct ConnectionFailure {
    pub kind: ConnectionFailureKind,
    pub detail: String,
}

type ConnectionFailureListener = Box<dyn Fn(&ConnectionFailure) + Send + Sync>;

enum ClientState<T> {
    Disconnected,
    Connected(T),
    Closed,
}

/// One logical client channel per peer, with lazy connect, bounded
/// reconnect and at-most-once connection failure reporting.
///
/// A connection failure is raised only after the channel reached a connected
/// state at least once; listeners must not call back into the client.
pub struct GrpcClient<T: Clone> {
    name: &'static str,
    endpoint: Endpoint,
    config: GrpcClientConfig,
    client_factory: Arc<dyn Fn(Channel) -> T + Send + Sync>,
    state: Arc<Mutex<ClientState<T>>>,
    listeners: StdMutex<Vec<ConnectionFailureListener>>,
    was_connected: AtomicBool,
    failure_raised: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl<T: Clone> GrpcClient<T> {
    pub fn new(
        name: &'static str,
        client_factory: impl Fn(Channel) -> T + Send + Sync + 'static,
        uri: Uri,
        config: GrpcClientConfig,
    ) -> Self {
        let endpoint = Endpoint::from(uri)
            .connect_timeout(config.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(10))
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true);

        Self {
            name,
            endpoint,
            config,
            client_factory: Arc::new(client_factory),
            state: Arc::new(Mutex::new(ClientState::Disconnected)),
            listeners: StdMutex::new(Vec::new()),
            was_connected: AtomicBool::new(false),
            failure_raised: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_connection_failure(
        &self,
        listener: impl Fn(&ConnectionFailure) + Send + Sync + 'static,
    ) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Performs one logical RPC with the client's default retry policy.
    /// Time spent waiting for channel readiness is accounted separately
    /// from attempt time.
    pub async fn call<F, R>(
        &self,
        description: &'static str,
        deadline: Option<Duration>,
        cancellation: &CancellationToken,
        f: F,
    ) -> RpcCallResult<R>
    where
        F: for<'a> Fn(
            &'a mut T,
        )
            -> Pin<Box<dyn Future<Output = Result<R, tonic::Status>> + 'a + Send>>,
    {
        let retries = self.config.retries.clone();
        self.call_with_retries(description, &retries, deadline, cancellation, f)
            .await
    }

    /// Like `call`, with an explicit retry policy. Streaming-style calls
    /// pass a single-attempt policy: replaying them would break the
    /// at-most-one-in-flight ordering the receiver relies on.
    pub async fn call_with_retries<F, R>(
        &self,
        description: &'static str,
        retries: &RetryConfig,
        deadline: Option<Duration>,
        cancellation: &CancellationToken,
        f: F,
    ) -> RpcCallResult<R>
    where
        F: for<'a> Fn(
            &'a mut T,
        )
            -> Pin<Box<dyn Future<Output = Result<R, tonic::Status>> + 'a + Send>>,
    {
        let started = Instant::now();
        let overall_deadline = deadline.map(|d| started + d);
        let mut wait_for_connection = Duration::ZERO;
        let mut attempts = 0u32;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self
            .call_loop(
                description,
                retries,
                overall_deadline,
                cancellation,
                &f,
                started,
                &mut wait_for_connection,
                &mut attempts,
            )
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_loop<F, R>(
        &self,
        description: &'static str,
        retries: &RetryConfig,
        overall_deadline: Option<Instant>,
        cancellation: &CancellationToken,
        f: &F,
        started: Instant,
        wait_for_connection: &mut Duration,
        attempts: &mut u32,
    ) -> RpcCallResult<R>
    where
        F: for<'a> Fn(
            &'a mut T,
        )
            -> Pin<Box<dyn Future<Output = Result<R, tonic::Status>> + 'a + Send>>,
    {
        loop {
            if cancellation.is_cancelled() {
                return RpcCallResult::cancelled(*attempts, started.elapsed(), *wait_for_connection);
            }

            *attempts += 1;

            let connect_started = Instant::now();
            let client = tokio::select! {
                client = self.connected_client() => client,
                _ = cancellation.cancelled() => {
                    *wait_for_connection += connect_started.elapsed();
                    return RpcCallResult::cancelled(
                        *attempts,
                        started.elapsed(),
                        *wait_for_connection,
                    );
                }
            };
            *wait_for_connection += connect_started.elapsed();

            let error = match client {
                Err(error) => error,
                Ok(mut client) => {
                    let result = tokio::select! {
                        result = f(&mut client) => Some(result),
                        _ = cancellation.cancelled() => None,
                    };
                    match result {
                        None => {
                            return RpcCallResult::cancelled(
                                *attempts,
                                started.elapsed(),
                                *wait_for_connection,
                            );
                        }
                        Some(Ok(value)) => {
                            return RpcCallResult::succeeded(
                                value,
                                *attempts,
                                started.elapsed(),
                                *wait_for_connection,
                            );
                        }
                        Some(Err(status)) => {
                            if let Some(kind) = connection_failure_kind(&status) {
                                self.mark_disconnected().await;
                                self.raise_connection_failure(kind, &status.to_string());
                            }
                            RpcError::Grpc(status)
                        }
                    }
                }
            };

            let out_of_attempts = *attempts >= retries.max_attempts;
            let out_of_time = overall_deadline
                .map(|d| Instant::now() >= d)
                .unwrap_or(false);

            if !error.is_transient() || out_of_attempts || out_of_time {
                if error.is_transient() && (out_of_time || out_of_attempts) {
                    self.raise_connection_failure(
                        ConnectionFailureKind::ReconnectDeadlineElapsed,
                        &error.to_string(),
                    );
                }
                warn!(
                    client = self.name,
                    attempts = *attempts,
                    "{description} failed: {error}"
                );
                return RpcCallResult::failed(
                    error,
                    *attempts,
                    started.elapsed(),
                    *wait_for_connection,
                );
            }

            let delay = delay_before_attempt(retries, *attempts);
            let delay = match overall_deadline {
                Some(d) => delay.min(d.saturating_duration_since(Instant::now())),
                None => delay,
            };
            debug!(
                client = self.name,
                attempts = *attempts,
                delay_ms = delay.as_millis() as u64,
                "{description} failed transiently, retrying: {error}"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => {
                    return RpcCallResult::cancelled(
                        *attempts,
                        started.elapsed(),
                        *wait_for_connection,
                    );
                }
            }
        }
    }

    async fn connected_client(&self) -> Result<T, RpcError> {
        let mut state = self.state.lock().await;
        match &*state {
            ClientState::Connected(client) => Ok(client.clone()),
            ClientState::Closed => Err(RpcError::Protocol(format!(
                "{} client is closed",
                self.name
            ))),
            ClientState::Disconnected => {
                let channel = self.endpoint.connect().await.map_err(RpcError::from)?;
                let client = (self.client_factory)(channel);
                *state = ClientState::Connected(client.clone());
                self.was_connected.store(true, Ordering::SeqCst);
                debug!(client = self.name, "connected");
                Ok(client)
            }
        }
    }

    async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, ClientState::Connected(_)) {
            *state = ClientState::Disconnected;
        }
    }

    fn raise_connection_failure(&self, kind: ConnectionFailureKind, detail: &str) {
        if !self.was_connected.load(Ordering::SeqCst) {
            return;
        }
        if self.failure_raised.swap(true, Ordering::SeqCst) {
            return;
        }
        let failure = ConnectionFailure {
            kind,
            detail: detail.to_string(),
        };
        warn!(
            client = self.name,
            kind = ?failure.kind,
            "connection failure: {}",
            failure.detail
        );
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            // A panicking listener must not take down the RPC loop.
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&failure)));
        }
    }

    /// Graceful shutdown: waits up to 10 seconds for in-flight calls to
    /// drain, then closes the channel. Idempotent.
    pub async fn close(&self) {
        let drain_deadline = Instant::now() + Duration::from_secs(10);
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let mut state = self.state.lock().await;
        *state = ClientState::Closed;
    }

    /// Hard abort: drops the channel without waiting for in-flight calls.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        *state = ClientState::Closed;
    }
}

fn connection_failure_kind(status: &tonic::Status) -> Option<ConnectionFailureKind> {
    if status.code() != tonic::Code::Unavailable {
        return None;
    }
    let message = status.message().to_ascii_lowercase();
    if message.contains("keep-alive") || message.contains("keepalive") {
        Some(ConnectionFailureKind::KeepaliveTimeout)
    } else if message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("goaway")
    {
        Some(ConnectionFailureKind::PeerClosed)
    } else {
        Some(ConnectionFailureKind::TransportError)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn keepalive_and_peer_close_are_distinguished() {
        let keepalive = tonic::Status::unavailable("keep-alive ping timed out");
        let reset = tonic::Status::unavailable("connection reset by peer");
        let other = tonic::Status::unavailable("tcp connect error");
        let not_conn = tonic::Status::invalid_argument("bad request");

        assert_eq!(
            connection_failure_kind(&keepalive),
            Some(ConnectionFailureKind::KeepaliveTimeout)
        );
        assert_eq!(
            connection_failure_kind(&reset),
            Some(ConnectionFailureKind::PeerClosed)
        );
        assert_eq!(
            connection_failure_kind(&other),
            Some(ConnectionFailureKind::TransportError)
        );
        assert_eq!(connection_failure_kind(&not_conn), None);
    }
}
