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
use forge_common::config::{RemoteServiceConfig, RetryConfig};
use forge_common::model::{ExecutionResult, WorkerId};
use forge_orchestrator::config::OrchestratorConfig;
use forge_orchestrator::scheduler::{ExecutionLogSink, Scheduler};
use forge_orchestrator::OrchestratorService;
use forge_worker::config::WorkerConfig;
use forge_worker::executor::PipExecutor;
use forge_worker::WorkerService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

#[cfg(test)]
test_r::enable!();

pub struct RecordingScheduler {
    pub completed: Mutex<Vec<(WorkerId, ExecutionResult)>>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(Vec::new()),
        })
    }

    pub fn completions(&self) -> Vec<(WorkerId, ExecutionResult)> {
        self.completed.lock().unwrap().clone()
    }
}

impl Default for RecordingScheduler {
    fn default() -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn on_pip_completed(&self, worker_id: WorkerId, result: ExecutionResult) {
        self.completed.lock().unwrap().push((worker_id, result));
    }

    fn has_failed_internally(&self) -> bool {
        false
    }
}

pub struct RecordingSink {
    pub blobs: Mutex<Vec<Vec<u8>>>,
}

impl ExecutionLogSink for RecordingSink {
    fn process(&self, data: &[u8]) -> Result<(), String> {
        self.blobs.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

fn fast_retries() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_jitter_factor: None,
    }
}

/// One orchestrator plus one worker, wired over loopback with a shared
/// invocation id.
pub struct TestCluster {
    pub orchestrator: OrchestratorService,
    pub worker: WorkerService,
    pub scheduler: Arc<RecordingScheduler>,
    pub orchestrator_join_set: JoinSet<Result<(), anyhow::Error>>,
    pub worker_join_set: JoinSet<Result<(), anyhow::Error>>,
    pub orchestrator_port: u16,
    pub worker_port: u16,
}

impl TestCluster {
    pub async fn start(executor: Arc<dyn PipExecutor>) -> Result<Self, anyhow::Error> {
        let session_id = Uuid::new_v4();
        let scheduler = RecordingScheduler::new();

        let orchestrator_config = OrchestratorConfig {
            session_id,
            environment: "it".to_string(),
            engine_version: "1.0.0".to_string(),
            grpc_port: 0,
            remote_worker_count: 2,
            unary_retries: fast_retries(),
            connect_timeout: Duration::from_secs(2),
            worker_drain_timeout: Duration::from_millis(500),
            attach_timeout: Duration::from_secs(10),
            ..OrchestratorConfig::default()
        };

        let orchestrator = OrchestratorService::new(
            orchestrator_config,
            scheduler.clone(),
            |_| {
                Arc::new(RecordingSink {
                    blobs: Mutex::new(Vec::new()),
                })
            },
            None,
        );

        let mut orchestrator_join_set = JoinSet::new();
        let orchestrator_port = orchestrator.run(&mut orchestrator_join_set).await?.grpc_port;

        let worker_config = WorkerConfig {
            session_id,
            environment: "it".to_string(),
            engine_version: "1.0.0".to_string(),
            grpc_port: 0,
            announced_host: "localhost".to_string(),
            orchestrator: RemoteServiceConfig {
                host: "localhost".to_string(),
                port: orchestrator_port,
                connect_timeout: Duration::from_secs(2),
                retries: fast_retries(),
            },
            unary_retries: fast_retries(),
            send_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
            perf_report_interval: Duration::from_millis(200),
            ..WorkerConfig::default()
        };

        let worker = WorkerService::new(worker_config, executor);
        let mut worker_join_set = JoinSet::new();
        let worker_port = worker.run(&mut worker_join_set).await?.grpc_port;

        Ok(Self {
            orchestrator,
            worker,
            scheduler,
            orchestrator_join_set,
            worker_join_set,
            orchestrator_port,
            worker_port,
        })
    }
}
