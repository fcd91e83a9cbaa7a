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

use crate::executor::PipExecutionRequest;
use crate::WorkerRuntime;
use forge_api_grpc::proto::forge::common::Empty;
use forge_api_grpc::proto::forge::worker::v1::worker_service_server::{
    WorkerService as GrpcWorkerService, WorkerServiceServer,
};
use forge_api_grpc::proto::forge::worker::v1::{
    attach_response, execute_pips_response, exit_response, AttachRequest, AttachResponse,
    ExecutePipsRequest, ExecutePipsResponse, ExitRequest, ExitResponse,
};
use forge_common::grpc::{error_body, require_invocation_id};
use forge_common::model::{FileHash, PipFingerprint, PipId};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

pub struct WorkerGrpcApi {
    runtime: Arc<WorkerRuntime>,
}

impl WorkerGrpcApi {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }

    /// An invocation id mismatch is not survivable: the call fails and the
    /// worker exits shortly after, giving the failure time to reach the
    /// orchestrator.
    fn validate_invocation(
        &self,
        actual: &Option<forge_api_grpc::proto::forge::common::InvocationId>,
    ) -> Result<(), Status> {
        match require_invocation_id(actual, &self.runtime.invocation_id) {
            Ok(()) => Ok(()),
            Err(status) => {
                error!("peer invocation id mismatch, exiting: {}", status.message());
                let shutdown = self.runtime.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    shutdown.cancel();
                });
                Err(status)
            }
        }
    }
}

#[async_trait::async_trait]
impl GrpcWorkerService for WorkerGrpcApi {
    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let request = request.into_inner();
        let Some(start_data) = request.build_start_data else {
            return Ok(Response::new(AttachResponse {
                result: Some(attach_response::Result::Error(error_body(
                    "Missing build start data",
                ))),
            }));
        };

        self.validate_invocation(&start_data.invocation_id)?;

        let assigned = self.runtime.worker_id.load(Ordering::SeqCst);
        if assigned != 0 && start_data.worker_id != assigned {
            return Ok(Response::new(AttachResponse {
                result: Some(attach_response::Result::Error(error_body(format!(
                    "Attach for worker id {} but this worker holds slot {assigned}",
                    start_data.worker_id
                )))),
            }));
        }
        self.runtime
            .worker_id
            .store(start_data.worker_id, Ordering::SeqCst);
        self.runtime.mark_attached();

        info!(
            worker_id = start_data.worker_id,
            fingerprint_salt_present = !start_data.fingerprint_salt.is_empty(),
            "attached to build"
        );

        // The RPC only acknowledges receipt; the handshake completes through
        // the asynchronous AttachCompleted call back to the orchestrator.
        self.runtime.clone().spawn_attach_completed();

        Ok(Response::new(AttachResponse {
            result: Some(attach_response::Result::Success(Empty {})),
        }))
    }

    async fn execute_pips(
        &self,
        request: Request<ExecutePipsRequest>,
    ) -> Result<Response<ExecutePipsResponse>, Status> {
        let request = request.into_inner();
        self.validate_invocation(&request.invocation_id)?;

        if !self.runtime.is_attached() {
            return Ok(Response::new(ExecutePipsResponse {
                result: Some(execute_pips_response::Result::Error(error_body(
                    "Worker is not attached",
                ))),
            }));
        }
        if self.runtime.shutdown.is_cancelled() {
            return Ok(Response::new(ExecutePipsResponse {
                result: Some(execute_pips_response::Result::Error(error_body(
                    "Worker is draining",
                ))),
            }));
        }

        let build_request = request.request.unwrap_or_default();

        let hashes: Vec<FileHash> = build_request
            .hashes
            .into_iter()
            .filter_map(|entry| entry.try_into().ok())
            .collect();
        if !hashes.is_empty() {
            self.runtime.executor.add_file_hashes(hashes);
        }

        // Enqueue then return: results travel through ReportPipResults.
        let mut enqueued = 0usize;
        for pip in build_request.pips {
            let step = pip.step().into();
            let execution_request = PipExecutionRequest {
                pip_id: PipId(pip.pip_id),
                fingerprint: pip
                    .fingerprint
                    .map(Into::into)
                    .unwrap_or(PipFingerprint(Vec::new())),
                priority: pip.priority,
                step,
            };
            self.runtime.clone().spawn_pip(execution_request);
            enqueued += 1;
        }

        debug!(pips = enqueued, "pip batch enqueued");
        Ok(Response::new(ExecutePipsResponse {
            result: Some(execute_pips_response::Result::Success(Empty {})),
        }))
    }

    async fn exit(&self, request: Request<ExitRequest>) -> Result<Response<ExitResponse>, Status> {
        let request = request.into_inner();
        self.validate_invocation(&request.invocation_id)?;

        let end_data = request.end_data.unwrap_or_default();
        match &end_data.failure {
            Some(failure) => warn!(
                reason = end_data.reason,
                "orchestrator requested exit: {failure}"
            ),
            None => info!(reason = end_data.reason, "orchestrator requested exit"),
        }

        self.runtime.clone().begin_exit();

        Ok(Response::new(ExitResponse {
            result: Some(exit_response::Result::Success(Empty {})),
        }))
    }
}

/// Binds the worker's listening port and spawns the gRPC server.
pub async fn start_grpc_server(
    addr: SocketAddr,
    api: WorkerGrpcApi,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
) -> Result<u16, anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<WorkerServiceServer<WorkerGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(forge_api_grpc::proto::FILE_DESCRIPTOR_SET)
        .build()
        .unwrap();

    join_set.spawn(async move {
        Server::builder()
            .add_service(reflection_service)
            .add_service(health_service)
            .add_service(WorkerServiceServer::new(api))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .map_err(|err| {
                error!("Worker gRPC server failed: {err}");
                err.into()
            })
    });

    info!("Started worker gRPC server on port {port}");
    Ok(port)
}
