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
use forge_common::model::ExecutionResult;
use forge_common::tracing::init_tracing;
use forge_common::SafeDisplay;
use forge_worker::config::make_config_loader;
use forge_worker::executor::{PipExecutionRequest, PipExecutor};
use forge_worker::WorkerService;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// Standalone runs have no embedding build engine; every pip is reported
/// as an immediate success.
struct SucceedingPipExecutor;

#[async_trait]
impl PipExecutor for SucceedingPipExecutor {
    async fn execute_pip(&self, request: PipExecutionRequest) -> ExecutionResult {
        info!(pip = %request.pip_id, step = ?request.step, "executing pip");
        ExecutionResult::succeeded(request.pip_id, request.step)
    }
}

fn main() -> Result<(), anyhow::Error> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };

    init_tracing(&config.tracing);
    info!("Worker config:\n{}", config.to_safe_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let service = WorkerService::new(config, Arc::new(SucceedingPipExecutor));

            let mut join_set = JoinSet::new();
            service.run(&mut join_set).await?;
            service.wait_for_shutdown().await;

            join_set.abort_all();
            Ok(())
        })
}
