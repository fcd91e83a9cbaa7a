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
use forge_common::client::{ConnectionFailure, ConnectionFailureKind};
use forge_common::model::{
    ContentHash, ExecutionResult, ExecutionStatus, PipExecutionStep, PipFingerprint, PipId,
    PipType, SemiStableHash, ServiceLocation, WorkerId, WorkerNodeStatus,
};
use forge_orchestrator::model::{BuildEndParams, BuildStartParams, ExitReason, PipRequest};
use forge_worker::executor::{PipExecutionRequest, PipExecutor};
use integration_tests::TestCluster;
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

struct SucceedingExecutor;

#[async_trait]
impl PipExecutor for SucceedingExecutor {
    async fn execute_pip(&self, request: PipExecutionRequest) -> ExecutionResult {
        ExecutionResult::succeeded(request.pip_id, request.step)
    }
}

/// Accepts pips and never finishes them; used to keep completions pending
/// while the connection is torn down.
struct HangingExecutor;

#[async_trait]
impl PipExecutor for HangingExecutor {
    async fn execute_pip(&self, _request: PipExecutionRequest) -> ExecutionResult {
        futures_pending().await
    }
}

async fn futures_pending() -> ExecutionResult {
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

fn start_params(orchestrator_port: u16) -> BuildStartParams {
    BuildStartParams {
        cached_graph_descriptor_hash: ContentHash::ZERO,
        symlink_file_content_hash: ContentHash::ZERO,
        fingerprint_salt: "it-salt".to_string(),
        orchestrator_location: ServiceLocation::new("localhost", orchestrator_port),
    }
}

fn pip_request(pip_id: u32) -> PipRequest {
    PipRequest {
        pip_id: PipId(pip_id),
        pip_type: PipType::Process,
        semi_stable_hash: SemiStableHash(pip_id as i64),
        fingerprint: PipFingerprint(vec![1, 2, 3]),
        priority: 0,
        step: PipExecutionStep::ExecuteProcess,
    }
}

#[test]
async fn pip_executes_remotely_and_resolves_its_promise() {
    let cluster = TestCluster::start(Arc::new(SucceedingExecutor)).await.unwrap();

    let slot = cluster
        .orchestrator
        .pool()
        .worker(WorkerId(1))
        .unwrap()
        .clone();

    let info = slot
        .attach(start_params(cluster.orchestrator_port))
        .await
        .unwrap();
    assert!(info.available_slots > 0);
    assert_eq!(slot.status(), WorkerNodeStatus::Attached);

    let mut handles = slot
        .execute_pips(vec![pip_request(42)], vec![])
        .await
        .unwrap();
    let handle = handles.remove(0);

    let result = tokio::time::timeout(Duration::from_secs(10), handle.receiver)
        .await
        .expect("pip result did not arrive")
        .expect("completion promise was dropped");

    assert_eq!(result.pip_id, PipId(42));
    assert_eq!(result.status, ExecutionStatus::Succeeded);

    let completions = cluster.scheduler.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, WorkerId(1));
}

#[test]
async fn lost_worker_abandons_pending_pips_for_rescheduling() {
    let cluster = TestCluster::start(Arc::new(HangingExecutor)).await.unwrap();

    let slot = cluster
        .orchestrator
        .pool()
        .worker(WorkerId(1))
        .unwrap()
        .clone();

    slot.attach(start_params(cluster.orchestrator_port))
        .await
        .unwrap();

    let mut handles = slot
        .execute_pips(vec![pip_request(7)], vec![])
        .await
        .unwrap();
    let handle = handles.remove(0);

    // The channel owner reports the loss exactly once, after the channel
    // had been connected.
    slot.clone().handle_connection_failure(&ConnectionFailure {
        kind: ConnectionFailureKind::PeerClosed,
        detail: "connection reset by peer".to_string(),
    });

    let result = tokio::time::timeout(Duration::from_secs(5), handle.receiver)
        .await
        .expect("abandonment did not arrive")
        .expect("completion promise was dropped");

    assert_eq!(result.pip_id, PipId(7));
    assert!(result.is_abandoned());
    assert!(slot.status().is_stopping_or_stopped());

    // After the drain period the slot is terminal.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while slot.status() != WorkerNodeStatus::Stopped {
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot did not stop after the drain period"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[test]
async fn exit_round_trip_stops_worker_and_slot() {
    let cluster = TestCluster::start(Arc::new(SucceedingExecutor)).await.unwrap();

    let slot = cluster
        .orchestrator
        .pool()
        .worker(WorkerId(1))
        .unwrap()
        .clone();

    slot.attach(start_params(cluster.orchestrator_port))
        .await
        .unwrap();

    slot.exit(BuildEndParams {
        reason: ExitReason::BuildCompleted,
        failure: None,
    })
    .await;

    assert_eq!(slot.status(), WorkerNodeStatus::Stopped);

    tokio::time::timeout(
        Duration::from_secs(5),
        cluster.worker.runtime().shutdown.cancelled(),
    )
    .await
    .expect("worker did not shut down after Exit");
}

#[test]
async fn second_worker_attaches_into_second_slot() {
    let cluster = TestCluster::start(Arc::new(SucceedingExecutor)).await.unwrap();

    // The first worker announced itself during cluster start; its slot is
    // taken and a re-announce from the same location is idempotent.
    let pool = cluster.orchestrator.pool();
    assert!(pool.worker(WorkerId(1)).unwrap().location().is_some());
    assert!(pool.worker(WorkerId(2)).unwrap().location().is_none());
}
