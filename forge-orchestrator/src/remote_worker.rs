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

use crate::error::WorkerError;
use crate::execution_log::WorkerExecutionLogReader;
use crate::metrics::record_abandoned_pips;
use crate::model::{BuildEndParams, BuildStartParams, FileHash, PipRequest};
use crate::scheduler::{ExecutionLogSink, Scheduler};
use dashmap::{DashMap, DashSet};
use forge_api_grpc::proto::forge::orchestrator::v1 as orchestrator_proto;
use forge_api_grpc::proto::forge::worker::v1 as worker_proto;
use forge_api_grpc::proto::forge::worker::v1::worker_service_client::WorkerServiceClient;
use forge_common::client::{ConnectionFailure, GrpcClient, GrpcClientConfig};
use forge_common::config::RetryConfig;
use forge_common::model::{
    ContentHash, ExecutionResult, InvocationId, PipId, PipType, SemiStableHash, ServiceLocation,
    WorkerNodeStatus, WorkerId, EVENT_KEYWORD_INFRASTRUCTURE_ERROR,
};
use forge_common::serialization::deserialize;
use http::Uri;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct RemoteWorkerConfig {
    pub invocation_id: InvocationId,
    pub unary_retries: RetryConfig,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub attach_timeout: Duration,
    /// When set, AttachCompleted must report exactly this hash; anything
    /// else is a protocol violation and fails the slot.
    pub expected_cache_validation_hash: Option<ContentHash>,
}

type WorkerClient = GrpcClient<WorkerServiceClient<Channel>>;

/// Outcome of the asynchronous part of the attach handshake.
#[derive(Debug, Clone)]
pub struct AttachedWorkerInfo {
    pub available_slots: u32,
    pub cache_validation_hash: Option<ContentHash>,
    pub total_ram_mb: u64,
    pub total_processor_count: u32,
}

/// Handle the scheduler holds while a dispatched pip runs remotely. Resolves
/// exactly once: with the real result, a synthetic abandonment, or a
/// cancellation result.
pub struct PipCompletionHandle {
    pub pip_id: PipId,
    pub receiver: oneshot::Receiver<ExecutionResult>,
}

struct PendingPipCompletion {
    sender: oneshot::Sender<ExecutionResult>,
    pip_type: PipType,
    semi_stable_hash: SemiStableHash,
}

/// Orchestrator-side proxy of one worker slot.
///
/// Owns the client channel to the worker, drives the attach handshake,
/// dispatches pip batches and ingests the three inbound streams through
/// callbacks from the RPC server.
pub struct RemoteWorker {
    worker_id: WorkerId,
    config: RemoteWorkerConfig,
    scheduler: Arc<dyn Scheduler>,
    log_reader: WorkerExecutionLogReader,
    location: StdMutex<Option<ServiceLocation>>,
    client: StdMutex<Option<Arc<WorkerClient>>>,
    status: StdMutex<WorkerNodeStatus>,
    pending: DashMap<PipId, PendingPipCompletion>,
    in_flight_execute: DashSet<PipId>,
    cancellation: CancellationToken,
    attach_result: watch::Sender<Option<Result<AttachedWorkerInfo, String>>>,
    last_perf_info: StdMutex<Option<orchestrator_proto::WorkerPerfInfo>>,
    attach_attempts: AtomicU32,
    execute_attempts: AtomicU32,
    exit_attempts: AtomicU32,
    last_failure: StdMutex<Option<String>>,
}

impl RemoteWorker {
    pub fn new(
        worker_id: WorkerId,
        config: RemoteWorkerConfig,
        scheduler: Arc<dyn Scheduler>,
        log_sink: Arc<dyn ExecutionLogSink>,
    ) -> Arc<Self> {
        let (attach_result, _) = watch::channel(None);
        Arc::new(Self {
            worker_id,
            config,
            scheduler: scheduler.clone(),
            log_reader: WorkerExecutionLogReader::new(worker_id, log_sink),
            location: StdMutex::new(None),
            client: StdMutex::new(None),
            status: StdMutex::new(WorkerNodeStatus::NotStarted),
            pending: DashMap::new(),
            in_flight_execute: DashSet::new(),
            cancellation: CancellationToken::new(),
            attach_result,
            last_perf_info: StdMutex::new(None),
            attach_attempts: AtomicU32::new(0),
            execute_attempts: AtomicU32::new(0),
            exit_attempts: AtomicU32::new(0),
            last_failure: StdMutex::new(None),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn status(&self) -> WorkerNodeStatus {
        *self.status.lock().unwrap()
    }

    pub fn location(&self) -> Option<ServiceLocation> {
        self.location.lock().unwrap().clone()
    }

    pub fn log_reader(&self) -> &WorkerExecutionLogReader {
        &self.log_reader
    }

    pub fn has_in_flight_pips(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight_execute.is_empty()
    }

    /// Assigns the worker's announced location and opens the client channel.
    /// A slot's location is assigned at most once per build.
    pub fn set_location(self: Arc<Self>, location: ServiceLocation) -> Result<(), WorkerError> {
        {
            let mut current = self.location.lock().unwrap();
            if let Some(existing) = current.as_ref() {
                return Err(WorkerError::ProtocolViolation {
                    worker_id: self.worker_id,
                    detail: format!(
                        "location already assigned to {existing}, rejecting {location}"
                    ),
                });
            }
            *current = Some(location.clone());
        }

        let uri: Uri = format!("http://{location}/")
            .parse()
            .map_err(|err| WorkerError::ProtocolViolation {
                worker_id: self.worker_id,
                detail: format!("invalid worker location {location}: {err}"),
            })?;

        let client = Arc::new(GrpcClient::new(
            "worker-service",
            WorkerServiceClient::new,
            uri,
            GrpcClientConfig {
                retries: self.config.unary_retries.clone(),
                connect_timeout: self.config.connect_timeout,
            },
        ));

        let this = self.clone();
        client.on_connection_failure(move |failure| {
            this.clone().handle_connection_failure(failure);
        });

        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    fn client(&self) -> Result<Arc<WorkerClient>, WorkerError> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or(WorkerError::NoLocation {
                worker_id: self.worker_id,
            })
    }

    fn transition(&self, to: WorkerNodeStatus) -> WorkerNodeStatus {
        let mut status = self.status.lock().unwrap();
        let from = *status;
        *status = to;
        debug!(worker = %self.worker_id, "status {from} -> {to}");
        from
    }

    /// Sends BuildStartData and waits for the worker's asynchronous
    /// AttachCompleted callback. Only then does the slot become `Attached`.
    pub async fn attach(&self, start: BuildStartParams) -> Result<AttachedWorkerInfo, WorkerError> {
        {
            let mut status = self.status.lock().unwrap();
            match *status {
                WorkerNodeStatus::NotStarted => *status = WorkerNodeStatus::Starting,
                other => {
                    return Err(WorkerError::WrongState {
                        worker_id: self.worker_id,
                        status: other.to_string(),
                        operation: "Attach",
                    })
                }
            }
        }

        let client = match self.client() {
            Ok(client) => client,
            Err(err) => {
                self.fail_slot(&err.to_string());
                return Err(err);
            }
        };

        let start_data = worker_proto::BuildStartData {
            invocation_id: Some(self.config.invocation_id.clone().into()),
            worker_id: self.worker_id.0,
            cached_graph_descriptor_hash: Some(start.cached_graph_descriptor_hash.into()),
            symlink_file_content_hash: Some(start.symlink_file_content_hash.into()),
            fingerprint_salt: start.fingerprint_salt.clone(),
            orchestrator_location: Some(start.orchestrator_location.clone().into()),
        };

        let result = client
            .call("Attach", None, &self.cancellation, move |client| {
                let request = worker_proto::AttachRequest {
                    build_start_data: Some(start_data.clone()),
                };
                Box::pin(async move {
                    client.attach(request).await.map(|response| response.into_inner())
                })
            })
            .await;

        self.attach_attempts.fetch_add(result.attempts, Ordering::Relaxed);

        if result.is_cancelled() {
            self.fail_slot("attach cancelled");
            return Err(WorkerError::Cancelled {
                worker_id: self.worker_id,
                rpc: "Attach",
            });
        }
        if !result.is_succeeded() {
            let detail = result.last_failure().to_string();
            self.fail_slot(&detail);
            return Err(WorkerError::CallFailed {
                worker_id: self.worker_id,
                rpc: "Attach",
                detail,
            });
        }

        if let Some(worker_proto::attach_response::Result::Error(body)) =
            result.value().result.as_ref()
        {
            let detail = body.error.clone();
            self.fail_slot(&detail);
            return Err(WorkerError::CallFailed {
                worker_id: self.worker_id,
                rpc: "Attach",
                detail,
            });
        }

        let info = self.wait_for_attach_completed().await?;

        {
            let mut status = self.status.lock().unwrap();
            if status.is_stopping_or_stopped() {
                return Err(WorkerError::WrongState {
                    worker_id: self.worker_id,
                    status: status.to_string(),
                    operation: "Attach",
                });
            }
            *status = WorkerNodeStatus::Attached;
        }

        info!(worker = %self.worker_id, "attached");
        Ok(info)
    }

    async fn wait_for_attach_completed(&self) -> Result<AttachedWorkerInfo, WorkerError> {
        let mut receiver = self.attach_result.subscribe();
        let wait = async {
            loop {
                if let Some(result) = receiver.borrow_and_update().clone() {
                    return result;
                }
                if receiver.changed().await.is_err() {
                    return Err("attach result channel closed".to_string());
                }
            }
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.attach_timeout, wait) => outcome,
            _ = self.cancellation.cancelled() => {
                self.fail_slot("attach cancelled");
                return Err(WorkerError::Cancelled {
                    worker_id: self.worker_id,
                    rpc: "AttachCompleted",
                });
            }
        };

        match outcome {
            Err(_) => {
                self.fail_slot("attach handshake timed out");
                Err(WorkerError::AttachTimeout {
                    worker_id: self.worker_id,
                })
            }
            Ok(Err(detail)) => {
                self.fail_slot(&detail);
                Err(WorkerError::ProtocolViolation {
                    worker_id: self.worker_id,
                    detail,
                })
            }
            Ok(Ok(info)) => Ok(info),
        }
    }

    /// Callback from the RPC server when the worker reported
    /// AttachCompleted. Validates the cache validation hash when the build
    /// carries an expectation.
    pub fn attach_completed(&self, info: orchestrator_proto::AttachCompletionInfo) {
        let cache_validation_hash = info
            .cache_validation_hash
            .and_then(|hash| ContentHash::try_from(hash).ok());

        if let Some(expected) = self.config.expected_cache_validation_hash {
            if cache_validation_hash != Some(expected) {
                let detail = format!(
                    "cache validation hash mismatch: got {:?}, expected {expected}",
                    cache_validation_hash
                );
                warn!(worker = %self.worker_id, "{detail}");
                self.attach_result.send_replace(Some(Err(detail)));
                return;
            }
        }

        let resources = info.resources.unwrap_or_default();
        self.attach_result.send_replace(Some(Ok(AttachedWorkerInfo {
            available_slots: info.available_slots,
            cache_validation_hash,
            total_ram_mb: resources.total_ram_mb,
            total_processor_count: resources.total_processor_count,
        })));
    }

    /// Dispatches a batch of pips. A pending completion is registered for
    /// every pip before the call goes out; the returned handles resolve when
    /// results arrive (or the worker is lost).
    ///
    /// The RPC acknowledges receipt only; completion always travels through
    /// ReportPipResults.
    pub async fn execute_pips(
        &self,
        requests: Vec<PipRequest>,
        hashes: Vec<FileHash>,
    ) -> Result<Vec<PipCompletionHandle>, WorkerError> {
        {
            let status = self.status.lock().unwrap();
            if *status != WorkerNodeStatus::Attached {
                return Err(WorkerError::WrongState {
                    worker_id: self.worker_id,
                    status: status.to_string(),
                    operation: "ExecutePips",
                });
            }
        }

        let client = self.client()?;

        let mut handles = Vec::with_capacity(requests.len());
        for request in &requests {
            let (sender, receiver) = oneshot::channel();
            self.pending.insert(
                request.pip_id,
                PendingPipCompletion {
                    sender,
                    pip_type: request.pip_type,
                    semi_stable_hash: request.semi_stable_hash,
                },
            );
            self.in_flight_execute.insert(request.pip_id);
            handles.push(PipCompletionHandle {
                pip_id: request.pip_id,
                receiver,
            });
        }

        let pip_ids: Vec<PipId> = requests.iter().map(|r| r.pip_id).collect();
        let build_request = worker_proto::PipBuildRequest {
            pips: requests.iter().map(Into::into).collect(),
            hashes: hashes.iter().map(Into::into).collect(),
        };
        let execute_request = worker_proto::ExecutePipsRequest {
            invocation_id: Some(self.config.invocation_id.clone().into()),
            request: Some(build_request),
        };

        let result = client
            .call("ExecutePips", None, &self.cancellation, move |client| {
                let request = execute_request.clone();
                Box::pin(async move {
                    client
                        .execute_pips(request)
                        .await
                        .map(|response| response.into_inner())
                })
            })
            .await;

        self.execute_attempts
            .fetch_add(result.attempts, Ordering::Relaxed);

        for pip_id in &pip_ids {
            self.in_flight_execute.remove(pip_id);
        }

        if result.is_cancelled() {
            self.resolve_pips_with(&pip_ids, |pip_id| ExecutionResult {
                status: forge_common::model::ExecutionStatus::Cancelled,
                ..ExecutionResult::abandoned(pip_id, "cancelled")
            });
            return Err(WorkerError::Cancelled {
                worker_id: self.worker_id,
                rpc: "ExecutePips",
            });
        }

        let rejected: Option<String> = if result.is_succeeded() {
            match result.value().result.as_ref() {
                Some(worker_proto::execute_pips_response::Result::Error(body)) => {
                    Some(body.error.clone())
                }
                _ => None,
            }
        } else {
            Some(result.last_failure().to_string())
        };

        if let Some(detail) = rejected {
            // Never accepted by the worker: the promises resolve with
            // abandonment so the scheduler can dispatch elsewhere.
            self.record_failure(&detail);
            self.resolve_pips_with(&pip_ids, |pip_id| {
                ExecutionResult::abandoned(pip_id, "ExecutePips call failed")
            });
            return Err(WorkerError::CallFailed {
                worker_id: self.worker_id,
                rpc: "ExecutePips",
                detail,
            });
        }

        debug!(
            worker = %self.worker_id,
            pips = pip_ids.len(),
            "pip batch acknowledged"
        );
        Ok(handles)
    }

    /// Resolves the pending completion of one pip with the result carried in
    /// the completion data. Duplicate arrivals are dropped.
    pub async fn notify_pip_completion(&self, data: orchestrator_proto::PipCompletionData) {
        let pip_id = PipId(data.pip_id);
        let Some((_, pending)) = self.pending.remove(&pip_id) else {
            debug!(worker = %self.worker_id, %pip_id, "dropping duplicate pip completion");
            return;
        };

        let result = match deserialize::<ExecutionResult>(&data.result_blob) {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    worker = %self.worker_id,
                    pip = %pending.semi_stable_hash,
                    "failed to deserialize pip result, treating as failure: {err}"
                );
                ExecutionResult {
                    status: forge_common::model::ExecutionStatus::Failed {
                        error: format!("undeserializable result from {}: {err}", self.worker_id),
                    },
                    ..ExecutionResult::abandoned(pip_id, "undeserializable result")
                }
            }
        };

        debug!(
            worker = %self.worker_id,
            pip = %pending.semi_stable_hash,
            pip_type = ?pending.pip_type,
            queue_ticks = data.queue_ticks,
            execute_ticks = data.execute_ticks,
            "pip completed remotely"
        );

        let _ = pending.sender.send(result.clone());
        self.scheduler.on_pip_completed(self.worker_id, result).await;
    }

    /// Signals the worker to drain and shut down. Idempotent; a worker that
    /// is already gone is not an error.
    pub async fn exit(&self, end: BuildEndParams) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == WorkerNodeStatus::Stopped {
                return;
            }
            *status = WorkerNodeStatus::Stopping;
        }

        if let Ok(client) = self.client() {
            let end_data = worker_proto::BuildEndData {
                reason: worker_proto::ExitReason::from(end.reason) as i32,
                failure: end.failure.clone(),
            };
            let exit_request = worker_proto::ExitRequest {
                invocation_id: Some(self.config.invocation_id.clone().into()),
                end_data: Some(end_data),
            };

            let result = client
                .call(
                    "Exit",
                    Some(self.config.drain_timeout),
                    &CancellationToken::new(),
                    move |client| {
                        let request = exit_request.clone();
                        Box::pin(async move {
                            client.exit(request).await.map(|response| response.into_inner())
                        })
                    },
                )
                .await;

            self.exit_attempts.fetch_add(result.attempts, Ordering::Relaxed);
            if !result.is_succeeded() {
                debug!(worker = %self.worker_id, "Exit call failed, worker may already be gone");
            }
        }

        let _ = tokio::time::timeout(self.config.drain_timeout, self.log_reader.finalize()).await;

        self.abandon_pending_pips("worker exited during drain");
        self.cancellation.cancel();
        if let Ok(client) = self.client() {
            client.close().await;
        }
        self.transition(WorkerNodeStatus::Stopped);
        info!(worker = %self.worker_id, "stopped");
    }

    /// Raised by the client channel, at most once, strictly after the
    /// channel was connected. All pending pips resolve with a synthetic
    /// abandonment so the scheduler reschedules them elsewhere.
    pub fn handle_connection_failure(self: Arc<Self>, failure: &ConnectionFailure) {
        {
            let mut status = self.status.lock().unwrap();
            if status.is_stopping_or_stopped() {
                return;
            }
            *status = WorkerNodeStatus::Stopping;
        }

        warn!(
            worker = %self.worker_id,
            kind = ?failure.kind,
            "lost connection to worker: {}",
            failure.detail
        );
        self.record_failure(&failure.detail);
        self.cancellation.cancel();

        let abandoned = self.abandon_pending_pips("connection to worker lost");
        record_abandoned_pips(abandoned as u64);

        let drain = self.config.drain_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            let _ = tokio::time::timeout(Duration::from_secs(1), self.log_reader.finalize()).await;
            self.transition(WorkerNodeStatus::Stopped);
        });
    }

    fn abandon_pending_pips(&self, reason: &str) -> usize {
        let pip_ids: Vec<PipId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let count = pip_ids.len();
        if count > 0 {
            info!(
                worker = %self.worker_id,
                pips = count,
                "abandoning pending pips: {reason}"
            );
        }
        self.resolve_pips_with(&pip_ids, |pip_id| {
            ExecutionResult::abandoned(pip_id, reason)
        });
        count
    }

    fn resolve_pips_with(
        &self,
        pip_ids: &[PipId],
        make_result: impl Fn(PipId) -> ExecutionResult,
    ) {
        for pip_id in pip_ids {
            if let Some((_, pending)) = self.pending.remove(pip_id) {
                let result = make_result(*pip_id);
                let _ = pending.sender.send(result.clone());
                let scheduler = self.scheduler.clone();
                let worker_id = self.worker_id;
                tokio::spawn(async move {
                    scheduler.on_pip_completed(worker_id, result).await;
                });
            }
        }
    }

    fn fail_slot(&self, detail: &str) {
        self.record_failure(detail);
        self.transition(WorkerNodeStatus::Stopped);
    }

    fn record_failure(&self, detail: &str) {
        *self.last_failure.lock().unwrap() = Some(detail.to_string());
    }

    /// Marks a never-announced or quiesced slot permanently unavailable, so
    /// a later Hello for it answers `Released`.
    pub fn mark_released(&self) {
        self.transition(WorkerNodeStatus::Stopped);
    }

    pub fn record_perf_info(&self, perf: orchestrator_proto::WorkerPerfInfo) {
        *self.last_perf_info.lock().unwrap() = Some(perf);
    }

    /// True when a forwarded event reports an error the worker's own
    /// infrastructure detected and cannot survive.
    pub fn is_infrastructure_error(&self, event: &orchestrator_proto::EventMessage) -> bool {
        event.event_keywords & EVENT_KEYWORD_INFRASTRUCTURE_ERROR != 0
    }

    pub fn status_summary(&self) -> WorkerStatusSummary {
        WorkerStatusSummary {
            worker_id: self.worker_id,
            status: self.status(),
            location: self.location(),
            attach_attempts: self.attach_attempts.load(Ordering::Relaxed),
            execute_attempts: self.execute_attempts.load(Ordering::Relaxed),
            exit_attempts: self.exit_attempts.load(Ordering::Relaxed),
            last_failure: self.last_failure.lock().unwrap().clone(),
            executing_pip_count: self
                .last_perf_info
                .lock()
                .unwrap()
                .as_ref()
                .map(|perf| perf.executing_pip_count)
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStatusSummary {
    pub worker_id: WorkerId,
    pub status: WorkerNodeStatus,
    pub location: Option<ServiceLocation>,
    pub attach_attempts: u32,
    pub execute_attempts: u32,
    pub exit_attempts: u32,
    pub last_failure: Option<String>,
    pub executing_pip_count: u32,
}

impl Display for WorkerStatusSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.worker_id, self.status)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        write!(
            f,
            " attach:{} execute:{} exit:{} executing:{}",
            self.attach_attempts, self.execute_attempts, self.exit_attempts,
            self.executing_pip_count
        )?;
        if let Some(failure) = &self.last_failure {
            write!(f, " last failure: {failure}")?;
        }
        Ok(())
    }
}
