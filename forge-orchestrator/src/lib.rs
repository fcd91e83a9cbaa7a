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

pub mod config;
pub mod error;
pub mod execution_log;
pub mod grpcapi;
pub mod metrics;
pub mod model;
pub mod remote_worker;
pub mod scheduler;
pub mod worker_pool;

#[cfg(test)]
test_r::enable!();

use crate::config::OrchestratorConfig;
use crate::grpcapi::OrchestratorGrpcApi;
use crate::model::BuildEndParams;
use crate::remote_worker::RemoteWorkerConfig;
use crate::scheduler::{ExecutionLogSink, Scheduler};
use crate::worker_pool::WorkerPool;
use forge_common::model::{ContentHash, InvocationId, WorkerId, WorkerNodeStatus};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

pub struct RunDetails {
    pub grpc_port: u16,
}

/// The orchestrator side of the distributed build: owns the worker slot
/// pool and the server accepting inbound worker RPCs.
pub struct OrchestratorService {
    config: OrchestratorConfig,
    invocation_id: InvocationId,
    pool: Arc<WorkerPool>,
    scheduler: Arc<dyn Scheduler>,
}

impl OrchestratorService {
    pub fn new(
        config: OrchestratorConfig,
        scheduler: Arc<dyn Scheduler>,
        log_sink_factory: impl Fn(WorkerId) -> Arc<dyn ExecutionLogSink>,
        expected_cache_validation_hash: Option<ContentHash>,
    ) -> Self {
        let invocation_id = InvocationId::new(
            config.session_id,
            &config.environment,
            &config.engine_version,
        );

        let worker_config = RemoteWorkerConfig {
            invocation_id: invocation_id.clone(),
            unary_retries: config.unary_retries.clone(),
            connect_timeout: config.connect_timeout,
            drain_timeout: config.worker_drain_timeout,
            attach_timeout: config.attach_timeout,
            expected_cache_validation_hash,
        };

        let pool = Arc::new(WorkerPool::new(
            config.remote_worker_count,
            worker_config,
            scheduler.clone(),
            log_sink_factory,
        ));

        Self {
            config,
            invocation_id,
            pool,
            scheduler,
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Binds and starts the gRPC server. A failed bind is the only startup
    /// error; later failures are logged but never tear down the build.
    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let api = OrchestratorGrpcApi::new(
            self.invocation_id.clone(),
            self.pool.clone(),
            self.scheduler.clone(),
        );

        let grpc_port = grpcapi::start_grpc_server(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.grpc_port).into(),
            api,
            join_set,
        )
        .await?;

        info!(
            invocation_id = %self.invocation_id,
            "Started orchestrator on gRPC port {grpc_port} with {} worker slots",
            self.pool.worker_count()
        );

        Ok(RunDetails { grpc_port })
    }

    /// Drains and stops every worker that ever announced itself. Used at
    /// the end of the build and on orchestrator shutdown.
    pub async fn stop_all_workers(&self, end: BuildEndParams) {
        let exits = self
            .pool
            .workers()
            .filter(|worker| {
                worker.location().is_some() && worker.status() != WorkerNodeStatus::Stopped
            })
            .map(|worker| worker.exit(end.clone()))
            .collect::<Vec<_>>();
        futures::future::join_all(exits).await;
        info!("All workers stopped");
    }
}
