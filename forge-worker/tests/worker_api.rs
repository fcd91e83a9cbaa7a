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

use async_trait::async_trait;
use forge_api_grpc::proto::forge::worker::v1::worker_service_server::WorkerService as GrpcWorkerService;
use forge_api_grpc::proto::forge::worker::v1::{
    attach_response, execute_pips_response, exit_response, AttachRequest, BuildEndData,
    BuildStartData, ExecutePipsRequest, ExitReason, ExitRequest, PipBuildRequest,
    SinglePipBuildRequest,
};
use forge_common::config::{RemoteServiceConfig, RetryConfig};
use forge_common::model::{ContentHash, ExecutionResult, InvocationId, PipId, ServiceLocation};
use forge_worker::config::WorkerConfig;
use forge_worker::executor::{PipExecutionRequest, PipExecutor};
use forge_worker::grpcapi::WorkerGrpcApi;
use forge_worker::WorkerService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_r::test;
use tokio::sync::Notify;
use tonic::Request;
use uuid::Uuid;

struct RecordingExecutor {
    executed: Mutex<Vec<PipId>>,
    notify: Notify,
}

impl RecordingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn executed(&self) -> Vec<PipId> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipExecutor for RecordingExecutor {
    async fn execute_pip(&self, request: PipExecutionRequest) -> ExecutionResult {
        self.executed.lock().unwrap().push(request.pip_id);
        self.notify.notify_one();
        ExecutionResult::succeeded(request.pip_id, request.step)
    }
}

fn test_config(session_id: Uuid) -> WorkerConfig {
    WorkerConfig {
        session_id,
        // Slow control-plane retries keep the background AttachCompleted
        // call (which has no orchestrator to talk to here) from firing the
        // worker's shutdown token mid-test.
        unary_retries: RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_jitter_factor: None,
        },
        orchestrator: RemoteServiceConfig {
            host: "localhost".to_string(),
            port: 1,
            connect_timeout: Duration::from_millis(100),
            retries: RetryConfig::default(),
        },
        drain_timeout: Duration::from_secs(2),
        ..WorkerConfig::default()
    }
}

fn start_data(invocation_id: &InvocationId, worker_id: u32) -> BuildStartData {
    BuildStartData {
        invocation_id: Some(invocation_id.clone().into()),
        worker_id,
        cached_graph_descriptor_hash: Some(ContentHash::ZERO.into()),
        symlink_file_content_hash: Some(ContentHash::ZERO.into()),
        fingerprint_salt: "salt".to_string(),
        orchestrator_location: Some(ServiceLocation::new("localhost", 1).into()),
    }
}

#[test]
async fn attach_with_mismatched_invocation_id_fails_and_exits() {
    let service = WorkerService::new(test_config(Uuid::new_v4()), RecordingExecutor::new());
    let api = WorkerGrpcApi::new(service.runtime().clone());

    let other_build = InvocationId::new(Uuid::new_v4(), "dev", "0.0.0");
    let status = api
        .attach(Request::new(AttachRequest {
            build_start_data: Some(start_data(&other_build, 1)),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);

    // The worker cannot survive the mismatch and exits shortly after.
    tokio::time::timeout(
        Duration::from_secs(2),
        service.runtime().shutdown.cancelled(),
    )
    .await
    .expect("worker did not shut down after invocation id mismatch");
}

#[test]
async fn execute_pips_is_rejected_before_attach() {
    let service = WorkerService::new(test_config(Uuid::new_v4()), RecordingExecutor::new());
    let api = WorkerGrpcApi::new(service.runtime().clone());

    let response = api
        .execute_pips(Request::new(ExecutePipsRequest {
            invocation_id: Some(service.invocation_id().clone().into()),
            request: Some(PipBuildRequest::default()),
        }))
        .await
        .unwrap()
        .into_inner();

    assert!(matches!(
        response.result,
        Some(execute_pips_response::Result::Error(_))
    ));
}

#[test]
async fn attach_then_execute_enqueues_pips_into_the_executor() {
    let executor = RecordingExecutor::new();
    let service = WorkerService::new(test_config(Uuid::new_v4()), executor.clone());
    let api = WorkerGrpcApi::new(service.runtime().clone());

    let response = api
        .attach(Request::new(AttachRequest {
            build_start_data: Some(start_data(service.invocation_id(), 1)),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(matches!(
        response.result,
        Some(attach_response::Result::Success(_))
    ));

    let notified = executor.notify.notified();
    let response = api
        .execute_pips(Request::new(ExecutePipsRequest {
            invocation_id: Some(service.invocation_id().clone().into()),
            request: Some(PipBuildRequest {
                pips: vec![
                    SinglePipBuildRequest {
                        pip_id: 42,
                        fingerprint: None,
                        priority: 0,
                        step: forge_api_grpc::proto::forge::common::PipExecutionStep::ExecuteProcess
                            as i32,
                    },
                ],
                hashes: vec![],
            }),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(matches!(
        response.result,
        Some(execute_pips_response::Result::Success(_))
    ));

    tokio::time::timeout(Duration::from_secs(2), notified)
        .await
        .expect("pip was not executed");
    assert_eq!(executor.executed(), vec![PipId(42)]);
}

#[test]
async fn exit_drains_and_fires_worker_shutdown() {
    let service = WorkerService::new(test_config(Uuid::new_v4()), RecordingExecutor::new());
    let api = WorkerGrpcApi::new(service.runtime().clone());

    let response = api
        .exit(Request::new(ExitRequest {
            invocation_id: Some(service.invocation_id().clone().into()),
            end_data: Some(BuildEndData {
                reason: ExitReason::BuildCompleted as i32,
                failure: None,
            }),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(matches!(
        response.result,
        Some(exit_response::Result::Success(_))
    ));

    tokio::time::timeout(
        Duration::from_secs(5),
        service.runtime().shutdown.cancelled(),
    )
    .await
    .expect("worker did not shut down after Exit");
}
