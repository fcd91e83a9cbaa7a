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
use forge_api_grpc::proto::forge::orchestrator::v1::orchestrator_service_server::OrchestratorService as GrpcOrchestratorService;
use forge_api_grpc::proto::forge::orchestrator::v1::{
    hello_response, EventMessage, ExecutionLogData, HelloRequest, PipResultsInfo,
    ReportExecutionLogRequest, ReportPipResultsRequest,
};
use forge_common::config::RetryConfig;
use forge_common::model::{
    EventLevel, ExecutionResult, InvocationId, ServiceLocation, WorkerId,
};
use forge_orchestrator::grpcapi::OrchestratorGrpcApi;
use forge_orchestrator::remote_worker::RemoteWorkerConfig;
use forge_orchestrator::scheduler::{ExecutionLogSink, Scheduler};
use forge_orchestrator::worker_pool::WorkerPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_r::test;
use tonic::Request;
use tracing_test::traced_test;
use uuid::Uuid;

struct RecordingScheduler {
    completed: Mutex<Vec<(WorkerId, ExecutionResult)>>,
    failed_internally: AtomicBool,
}

impl RecordingScheduler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(Vec::new()),
            failed_internally: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn on_pip_completed(&self, worker_id: WorkerId, result: ExecutionResult) {
        self.completed.lock().unwrap().push((worker_id, result));
    }

    fn has_failed_internally(&self) -> bool {
        self.failed_internally.load(Ordering::SeqCst)
    }
}

struct RecordingSink {
    blobs: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            blobs: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl ExecutionLogSink for RecordingSink {
    fn process(&self, data: &[u8]) -> Result<(), String> {
        self.blobs.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

struct TestSetup {
    api: OrchestratorGrpcApi,
    pool: Arc<WorkerPool>,
    invocation_id: InvocationId,
    scheduler: Arc<RecordingScheduler>,
    sinks: Arc<Mutex<HashMap<WorkerId, Arc<RecordingSink>>>>,
}

impl TestSetup {
    fn new(slots: u32) -> Self {
        let invocation_id = InvocationId::new(Uuid::new_v4(), "test", "1.0.0");
        let scheduler = RecordingScheduler::new();
        let sinks: Arc<Mutex<HashMap<WorkerId, Arc<RecordingSink>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let worker_config = RemoteWorkerConfig {
            invocation_id: invocation_id.clone(),
            unary_retries: RetryConfig {
                max_attempts: 1,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_jitter_factor: None,
            },
            connect_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(100),
            attach_timeout: Duration::from_secs(1),
            expected_cache_validation_hash: None,
        };

        let sinks_for_factory = sinks.clone();
        let pool = Arc::new(WorkerPool::new(
            slots,
            worker_config,
            scheduler.clone(),
            move |worker_id| {
                let sink = RecordingSink::new();
                sinks_for_factory
                    .lock()
                    .unwrap()
                    .insert(worker_id, sink.clone());
                sink
            },
        ));

        let api = OrchestratorGrpcApi::new(invocation_id.clone(), pool.clone(), scheduler.clone());

        Self {
            api,
            pool,
            invocation_id,
            scheduler,
            sinks,
        }
    }

    fn sink(&self, worker_id: WorkerId) -> Arc<RecordingSink> {
        self.sinks.lock().unwrap().get(&worker_id).unwrap().clone()
    }

    fn hello_request(&self, port: u16, requested_worker_id: u32) -> HelloRequest {
        HelloRequest {
            invocation_id: Some(self.invocation_id.clone().into()),
            location: Some(ServiceLocation::new("10.1.0.1", port).into()),
            requested_worker_id,
        }
    }

    async fn hello(&self, port: u16, requested_worker_id: u32) -> hello_response::Result {
        self.api
            .hello(Request::new(self.hello_request(port, requested_worker_id)))
            .await
            .unwrap()
            .into_inner()
            .result
            .unwrap()
    }

    async fn report_log_blob(&self, worker_id: u32, sequence_number: i32, blob: &[u8]) {
        let response = self
            .api
            .report_execution_log(Request::new(ReportExecutionLogRequest {
                invocation_id: Some(self.invocation_id.clone().into()),
                worker_id,
                events: Some(ExecutionLogData {
                    sequence_number,
                    data_blob: blob.to_vec(),
                }),
            }))
            .await
            .unwrap();
        assert!(response.into_inner().result.is_some());
    }
}

#[test]
async fn hello_with_wrong_invocation_id_is_refused() {
    let setup = TestSetup::new(1);

    let other_build = InvocationId::new(Uuid::new_v4(), "test", "1.0.0");
    let status = setup
        .api
        .hello(Request::new(HelloRequest {
            invocation_id: Some(other_build.into()),
            location: Some(ServiceLocation::new("10.1.0.1", 4001).into()),
            requested_worker_id: 0,
        }))
        .await
        .unwrap_err();

    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[test]
async fn hello_collision_on_requested_slot() {
    let setup = TestSetup::new(3);

    let a = setup.hello(4001, 2).await;
    assert!(matches!(a, hello_response::Result::Success(ref s) if s.worker_id == 2));

    let b = setup.hello(4002, 2).await;
    assert!(matches!(b, hello_response::Result::NoSlots(_)));

    let c = setup.hello(4003, 0).await;
    assert!(matches!(c, hello_response::Result::Success(ref s) if s.worker_id == 1));
}

#[test]
async fn hello_is_idempotent_for_the_same_location() {
    let setup = TestSetup::new(2);

    let first = setup.hello(4001, 0).await;
    let again = setup.hello(4001, 0).await;
    assert!(matches!(first, hello_response::Result::Success(ref s) if s.worker_id == 1));
    assert!(matches!(again, hello_response::Result::Success(ref s) if s.worker_id == 1));
}

#[test]
async fn hello_for_released_slot_answers_released() {
    let setup = TestSetup::new(2);

    setup.pool.try_release_worker(WorkerId(1)).unwrap();
    let response = setup.hello(4001, 1).await;
    assert!(matches!(response, hello_response::Result::Released(_)));
}

#[test]
async fn execution_log_sequence_gap_disables_worker_log_stream_only() {
    let setup = TestSetup::new(1);

    setup.report_log_blob(1, 0, b"first").await;
    // seq 1 skipped; the worker must not send ahead of its ACKs.
    setup.report_log_blob(1, 2, b"third").await;

    let worker = setup.pool.worker(WorkerId(1)).unwrap();
    assert!(worker.log_reader().is_disabled());

    // Pip traffic still flows for this worker.
    let response = setup
        .api
        .report_pip_results(Request::new(ReportPipResultsRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 1,
            results: Some(PipResultsInfo::default()),
        }))
        .await;
    assert!(response.is_ok());

    worker.log_reader().finalize().await;
    assert_eq!(setup.sink(WorkerId(1)).count(), 1);
}

#[test]
async fn duplicate_execution_log_blob_is_applied_once() {
    let setup = TestSetup::new(1);

    setup.report_log_blob(1, 0, b"blob").await;
    setup.report_log_blob(1, 0, b"blob").await;

    let worker = setup.pool.worker(WorkerId(1)).unwrap();
    worker.log_reader().finalize().await;

    assert_eq!(setup.sink(WorkerId(1)).count(), 1);
    assert_eq!(worker.log_reader().last_applied_sequence_number(), 0);
}

#[test]
async fn execution_log_is_dropped_after_scheduler_internal_error() {
    let setup = TestSetup::new(1);
    setup
        .scheduler
        .failed_internally
        .store(true, Ordering::SeqCst);

    setup.report_log_blob(1, 0, b"blob").await;

    let worker = setup.pool.worker(WorkerId(1)).unwrap();
    worker.log_reader().finalize().await;
    assert_eq!(setup.sink(WorkerId(1)).count(), 0);
}

#[test]
async fn forwarded_error_events_are_accounted() {
    let setup = TestSetup::new(1);

    let event = EventMessage {
        id: 0,
        level: forge_api_grpc::proto::forge::common::EventLevel::from(EventLevel::Error) as i32,
        event_id: 4242,
        event_name: "PipFailed".to_string(),
        event_keywords: 0,
        text: "it broke".to_string(),
        pip_process_event: None,
    };

    let response = setup
        .api
        .report_pip_results(Request::new(ReportPipResultsRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 1,
            results: Some(PipResultsInfo {
                completed_pips: vec![],
                build_manifest_events: None,
                forwarded_events: vec![event],
            }),
        }))
        .await;

    assert!(response.is_ok());
    assert!(setup.api.has_logged_error(4242));
    assert!(!setup.api.has_logged_error(4243));
}

#[test]
async fn errors_from_lost_workers_are_downgraded() {
    let setup = TestSetup::new(1);
    setup.pool.worker(WorkerId(1)).unwrap().mark_released();

    let event = EventMessage {
        id: 0,
        level: forge_api_grpc::proto::forge::common::EventLevel::from(EventLevel::Error) as i32,
        event_id: 555,
        event_name: "PipProcessError".to_string(),
        event_keywords: 0,
        text: "stale failure from a dead worker".to_string(),
        pip_process_event: None,
    };

    setup
        .api
        .report_pip_results(Request::new(ReportPipResultsRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 1,
            results: Some(PipResultsInfo {
                completed_pips: vec![],
                build_manifest_events: None,
                forwarded_events: vec![event.clone()],
            }),
        }))
        .await
        .unwrap();

    // Logged at Verbose, so it does not count as an orchestrator error.
    assert!(!setup.api.has_logged_error(555));

    // The same holds for infrastructure errors, which come through as
    // warnings even from a live worker.
    let setup = TestSetup::new(1);
    let infra = EventMessage {
        event_id: 556,
        event_keywords: forge_common::model::EVENT_KEYWORD_INFRASTRUCTURE_ERROR,
        ..event
    };
    setup
        .api
        .report_pip_results(Request::new(ReportPipResultsRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 1,
            results: Some(PipResultsInfo {
                completed_pips: vec![],
                build_manifest_events: None,
                forwarded_events: vec![infra],
            }),
        }))
        .await
        .unwrap();
    assert!(!setup.api.has_logged_error(556));
}

#[test]
#[traced_test]
async fn forwarded_events_are_relogged_with_the_worker_name() {
    let setup = TestSetup::new(1);

    let event = EventMessage {
        id: 0,
        level: forge_api_grpc::proto::forge::common::EventLevel::from(EventLevel::Warning) as i32,
        event_id: 777,
        event_name: "PipSlow".to_string(),
        event_keywords: 0,
        text: "remote compile took 40 minutes".to_string(),
        pip_process_event: None,
    };

    setup
        .api
        .report_pip_results(Request::new(ReportPipResultsRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 1,
            results: Some(PipResultsInfo {
                completed_pips: vec![],
                build_manifest_events: None,
                forwarded_events: vec![event],
            }),
        }))
        .await
        .unwrap();

    assert!(logs_contain("remote compile took 40 minutes"));
    assert!(logs_contain("Worker#1"));
}

#[test]
async fn unknown_worker_id_is_rejected_without_crashing() {
    let setup = TestSetup::new(1);

    let status = setup
        .api
        .report_execution_log(Request::new(ReportExecutionLogRequest {
            invocation_id: Some(setup.invocation_id.clone().into()),
            worker_id: 99,
            events: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    // The pool is unaffected.
    let response = setup.hello(4001, 0).await;
    assert!(matches!(response, hello_response::Result::Success(_)));
}
