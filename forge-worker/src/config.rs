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

use forge_common::config::{ConfigLoader, RemoteServiceConfig, RetryConfig};
use forge_common::tracing::TracingConfig;
use forge_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    /// Invocation id components; handed to the worker by whatever launched
    /// it, they must match the orchestrator's.
    pub session_id: Uuid,
    pub environment: String,
    pub engine_version: String,
    pub grpc_port: u16,
    /// Address under which the orchestrator can reach this worker.
    pub announced_host: String,
    /// Slot to request in Hello; 0 asks for any free slot.
    pub requested_worker_id: u32,
    /// Concurrent pip executions this worker offers to the orchestrator.
    pub pip_slots: u32,
    pub orchestrator: RemoteServiceConfig,
    pub unary_retries: RetryConfig,
    pub streaming_retries: RetryConfig,
    /// Pip results queued before the sender is woken regardless of timing.
    pub max_batch_size: usize,
    /// Minimum pause between two pip result batches.
    #[serde(with = "humantime_serde")]
    pub send_interval: Duration,
    /// Execution log buffer size that forces a flush.
    pub flush_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub perf_report_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("forge-worker"),
            session_id: Uuid::nil(),
            environment: "dev".to_string(),
            engine_version: "0.0.0".to_string(),
            grpc_port: 9702,
            announced_host: "localhost".to_string(),
            requested_worker_id: 0,
            pip_slots: 16,
            orchestrator: RemoteServiceConfig::default(),
            unary_retries: RetryConfig::default(),
            streaming_retries: RetryConfig::streaming(),
            max_batch_size: 32,
            send_interval: Duration::from_millis(50),
            flush_threshold: 32 * 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
            perf_report_interval: Duration::from_secs(5),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "engine version: {}", self.engine_version);
        let _ = writeln!(&mut result, "gRPC port: {}", self.grpc_port);
        let _ = writeln!(&mut result, "announced host: {}", self.announced_host);
        let _ = writeln!(
            &mut result,
            "requested worker id: {}",
            self.requested_worker_id
        );
        let _ = writeln!(&mut result, "pip slots: {}", self.pip_slots);
        let _ = writeln!(&mut result, "orchestrator:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.orchestrator.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "max batch size: {}", self.max_batch_size);
        let _ = writeln!(&mut result, "send interval: {:?}", self.send_interval);
        let _ = writeln!(&mut result, "flush threshold: {}", self.flush_threshold);
        let _ = writeln!(&mut result, "drain timeout: {:?}", self.drain_timeout);
        let _ = writeln!(
            &mut result,
            "perf report interval: {:?}",
            self.perf_report_interval
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/forge-worker.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;
    use std::env;
    use std::path::PathBuf;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
