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

use crate::metrics::{record_forwarded_event, record_remote_result_send};
use crate::remote_worker::RemoteWorker;
use crate::scheduler::Scheduler;
use crate::worker_pool::{HelloResult, WorkerPool};
use bytes::Bytes;
use dashmap::DashSet;
use forge_api_grpc::proto::forge::common::Empty;
use forge_api_grpc::proto::forge::orchestrator::v1::orchestrator_service_server::{
    OrchestratorService as GrpcOrchestratorService, OrchestratorServiceServer,
};
use forge_api_grpc::proto::forge::orchestrator::v1::{
    attach_completed_response, hello_response, report_execution_log_response,
    report_pip_results_response, report_worker_perf_info_response, AttachCompletedRequest,
    AttachCompletedResponse, EventMessage, HelloRequest, HelloResponse, HelloSuccessResponse,
    ReportExecutionLogRequest, ReportExecutionLogResponse, ReportPipResultsRequest,
    ReportPipResultsResponse, ReportWorkerPerfInfoRequest, ReportWorkerPerfInfoResponse,
};
use forge_common::grpc::{error_body, require_invocation_id};
use forge_common::metrics::api::record_grpc_success;
use forge_common::recorded_grpc_api_request;
use forge_common::model::{
    current_unix_millis, EventLevel, InvocationId, SemiStableHash, ServiceLocation, WorkerId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

pub struct OrchestratorGrpcApi {
    pub invocation_id: InvocationId,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<dyn Scheduler>,
    /// Error event ids this orchestrator already re-logged, so the outer
    /// build tool can account for them once.
    pub logged_error_event_ids: DashSet<i32>,
}

impl OrchestratorGrpcApi {
    pub fn new(
        invocation_id: InvocationId,
        pool: Arc<WorkerPool>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            invocation_id,
            pool,
            scheduler,
            logged_error_event_ids: DashSet::new(),
        }
    }

    fn worker(&self, worker_id: u32) -> Result<&Arc<RemoteWorker>, Status> {
        self.pool
            .worker(WorkerId(worker_id))
            .ok_or_else(|| Status::invalid_argument(format!("Unknown worker id {worker_id}")))
    }

    /// Re-logs one forwarded worker event on the orchestrator.
    ///
    /// Infrastructure errors the worker cannot survive are downgraded to
    /// Warning (the worker exits, the build keeps running); errors arriving
    /// from an already stopped slot are downgraded to Verbose.
    fn log_forwarded_event(&self, worker: &Arc<RemoteWorker>, event: &EventMessage) {
        let level: EventLevel = event.level().into();
        let worker_id = worker.worker_id();

        let effective_level = if level == EventLevel::Error {
            if worker.is_infrastructure_error(event) {
                EventLevel::Warning
            } else if worker.status().is_stopping_or_stopped() {
                // The slot is already lost; its tail of errors must not fail
                // the build.
                EventLevel::Verbose
            } else {
                EventLevel::Error
            }
        } else {
            level
        };

        if let Some(fields) = &event.pip_process_event {
            let pip = SemiStableHash(fields.pip_semi_stable_hash);
            match effective_level {
                EventLevel::Error => error!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    event_name = %event.event_name,
                    pip = %pip,
                    pip_description = %fields.pip_description,
                    spec_path = %fields.spec_path,
                    working_directory = %fields.working_directory,
                    executable = %fields.executable,
                    exit_code = fields.exit_code,
                    execution_time_ms = fields.pip_execution_time_ms,
                    "[{worker_id}] {}",
                    fields.output
                ),
                EventLevel::Warning => warn!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    event_name = %event.event_name,
                    pip = %pip,
                    exit_code = fields.exit_code,
                    "[{worker_id}] {}",
                    fields.output
                ),
                _ => debug!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    pip = %pip,
                    "[{worker_id}] {}",
                    fields.output
                ),
            }
        } else {
            match effective_level {
                EventLevel::Error => error!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    event_name = %event.event_name,
                    "[{worker_id}] {}",
                    event.text
                ),
                EventLevel::Warning => warn!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    event_name = %event.event_name,
                    "[{worker_id}] {}",
                    event.text
                ),
                EventLevel::Info => info!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    "[{worker_id}] {}",
                    event.text
                ),
                EventLevel::Verbose => debug!(
                    worker = %worker_id,
                    event_id = event.event_id,
                    "[{worker_id}] {}",
                    event.text
                ),
            }
        }

        if effective_level == EventLevel::Error {
            self.logged_error_event_ids.insert(event.event_id);
        }
        record_forwarded_event(match effective_level {
            EventLevel::Error => "error",
            EventLevel::Warning => "warning",
            EventLevel::Info => "info",
            EventLevel::Verbose => "verbose",
        });
    }

    pub fn has_logged_error(&self, event_id: i32) -> bool {
        self.logged_error_event_ids.contains(&event_id)
    }
}

#[async_trait::async_trait]
impl GrpcOrchestratorService for OrchestratorGrpcApi {
    async fn hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloResponse>, Status> {
        let request = request.into_inner();
        require_invocation_id(&request.invocation_id, &self.invocation_id)?;

        let location: ServiceLocation = request
            .location
            .ok_or_else(|| Status::invalid_argument("Missing worker location"))?
            .try_into()
            .map_err(|err: String| Status::invalid_argument(err))?;

        let span = recorded_grpc_api_request!(
            "hello",
            location = %location,
            requested_worker_id = request.requested_worker_id
        );
        let _enter = span.enter();

        let result = match self.pool.hello(location, request.requested_worker_id) {
            HelloResult::Ok(worker_id) => hello_response::Result::Success(HelloSuccessResponse {
                worker_id: worker_id.0,
            }),
            HelloResult::NoSlots => hello_response::Result::NoSlots(Empty {}),
            HelloResult::Released => hello_response::Result::Released(Empty {}),
        };

        Ok(Response::new(HelloResponse {
            result: Some(result),
        }))
    }

    async fn attach_completed(
        &self,
        request: Request<AttachCompletedRequest>,
    ) -> Result<Response<AttachCompletedResponse>, Status> {
        let request = request.into_inner();
        require_invocation_id(&request.invocation_id, &self.invocation_id)?;

        let result = match self.worker(request.worker_id) {
            Err(status) => attach_completed_response::Result::Error(error_body(status.message())),
            Ok(worker) => match request.info {
                None => attach_completed_response::Result::Error(error_body(
                    "Missing attach completion info",
                )),
                Some(info) => {
                    worker.attach_completed(info);
                    attach_completed_response::Result::Success(Empty {})
                }
            },
        };

        Ok(Response::new(AttachCompletedResponse {
            result: Some(result),
        }))
    }

    async fn report_pip_results(
        &self,
        request: Request<ReportPipResultsRequest>,
    ) -> Result<Response<ReportPipResultsResponse>, Status> {
        let started = std::time::Instant::now();
        let request = request.into_inner();
        require_invocation_id(&request.invocation_id, &self.invocation_id)?;

        let worker = self.worker(request.worker_id)?.clone();
        let results = request.results.unwrap_or_default();

        // Build manifest events are ingested before the ACK so this call
        // provides back-pressure on the worker's log stream.
        if let Some(manifest_events) = results.build_manifest_events {
            if !manifest_events.data_blob.is_empty() {
                worker
                    .log_reader()
                    .receive(
                        manifest_events.sequence_number,
                        Bytes::from(manifest_events.data_blob),
                    )
                    .await;
            }
        }

        for event in &results.forwarded_events {
            self.log_forwarded_event(&worker, event);
        }

        let max_before_send = results
            .completed_pips
            .iter()
            .map(|pip| pip.before_send_timestamp)
            .max()
            .unwrap_or(0);
        if max_before_send > 0 {
            let latency_ms = (current_unix_millis() - max_before_send).max(0) as u64;
            record_remote_result_send(Duration::from_millis(latency_ms));
        }

        futures::future::join_all(
            results
                .completed_pips
                .into_iter()
                .map(|data| worker.notify_pip_completion(data)),
        )
        .await;

        record_grpc_success("report_pip_results", started.elapsed());
        Ok(Response::new(ReportPipResultsResponse {
            result: Some(report_pip_results_response::Result::Success(Empty {})),
        }))
    }

    async fn report_execution_log(
        &self,
        request: Request<ReportExecutionLogRequest>,
    ) -> Result<Response<ReportExecutionLogResponse>, Status> {
        let request = request.into_inner();
        require_invocation_id(&request.invocation_id, &self.invocation_id)?;

        // When the scheduler is already terminating with an internal error
        // there is no sink to replay into; drop the blob and release the
        // worker immediately.
        if self.scheduler.has_failed_internally() {
            return Ok(Response::new(ReportExecutionLogResponse {
                result: Some(report_execution_log_response::Result::Success(Empty {})),
            }));
        }

        let worker = self.worker(request.worker_id)?;
        if let Some(events) = request.events {
            worker
                .log_reader()
                .receive(events.sequence_number, Bytes::from(events.data_blob))
                .await;
        }

        Ok(Response::new(ReportExecutionLogResponse {
            result: Some(report_execution_log_response::Result::Success(Empty {})),
        }))
    }

    async fn report_worker_perf_info(
        &self,
        request: Request<ReportWorkerPerfInfoRequest>,
    ) -> Result<Response<ReportWorkerPerfInfoResponse>, Status> {
        let request = request.into_inner();
        require_invocation_id(&request.invocation_id, &self.invocation_id)?;

        let worker = self.worker(request.worker_id)?;
        if let Some(perf_info) = request.perf_info {
            debug!(
                worker = %worker.worker_id(),
                cpu = perf_info.cpu_usage_percent,
                used_ram_mb = perf_info.used_ram_mb,
                executing_pips = perf_info.executing_pip_count,
                "worker perf info"
            );
            worker.record_perf_info(perf_info);
        }

        Ok(Response::new(ReportWorkerPerfInfoResponse {
            result: Some(report_worker_perf_info_response::Result::Success(
                Empty {},
            )),
        }))
    }
}

/// Binds the orchestrator's listening port and spawns the gRPC server.
///
/// Binding is the only failure reported from initialization; everything
/// after this point is logged but does not tear down the process.
pub async fn start_grpc_server(
    addr: SocketAddr,
    api: OrchestratorGrpcApi,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
) -> Result<u16, anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<OrchestratorServiceServer<OrchestratorGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(forge_api_grpc::proto::FILE_DESCRIPTOR_SET)
        .build()
        .unwrap();

    join_set.spawn(async move {
        Server::builder()
            .add_service(reflection_service)
            .add_service(health_service)
            .add_service(OrchestratorServiceServer::new(api))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .map_err(|err| {
                error!("Orchestrator gRPC server failed: {err}");
                err.into()
            })
    });

    info!("Started orchestrator gRPC server on port {port}");
    Ok(port)
}
