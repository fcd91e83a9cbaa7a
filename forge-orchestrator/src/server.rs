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
use forge_common::model::{ExecutionResult, WorkerId};
use forge_common::tracing::init_tracing;
use forge_common::SafeDisplay;
use forge_orchestrator::config::make_config_loader;
use forge_orchestrator::scheduler::{ExecutionLogSink, Scheduler};
use forge_orchestrator::OrchestratorService;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// Standalone runs carry no embedding build engine; completions and log
/// blobs are traced and dropped.
struct TracingScheduler;

#[async_trait]
impl Scheduler for TracingScheduler {
    async fn on_pip_completed(&self, worker_id: WorkerId, result: ExecutionResult) {
        info!(worker = %worker_id, pip = %result.pip_id, status = ?result.status, "pip completed");
    }

    fn has_failed_internally(&self) -> bool {
        false
    }
}

struct TracingLogSink {
    worker_id: WorkerId,
}

impl ExecutionLogSink for TracingLogSink {
    fn process(&self, data: &[u8]) -> Result<(), String> {
        info!(worker = %self.worker_id, bytes = data.len(), "execution log blob");
        Ok(())
    }
}

fn main() -> Result<(), anyhow::Error> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };

    init_tracing(&config.tracing);
    info!("Orchestrator config:\n{}", config.to_safe_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let service = OrchestratorService::new(
                config,
                Arc::new(TracingScheduler),
                |worker_id| Arc::new(TracingLogSink { worker_id }),
                None,
            );

            let mut join_set = JoinSet::new();
            service.run(&mut join_set).await?;

            while let Some(result) = join_set.join_next().await {
                result??
            }
            Ok(())
        })
}
