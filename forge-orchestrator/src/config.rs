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

use forge_common::config::{ConfigLoader, RetryConfig};
use forge_common::tracing::TracingConfig;
use forge_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub tracing: TracingConfig,
    /// Session part of the invocation id; handed to workers at launch so
    /// both sides name the same build.
    pub session_id: Uuid,
    pub environment: String,
    pub engine_version: String,
    pub grpc_port: u16,
    /// Number of remote worker slots (worker ids 1..=N).
    pub remote_worker_count: u32,
    pub unary_retries: RetryConfig,
    pub streaming_retries: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long a stopping worker may drain in-flight results.
    #[serde(with = "humantime_serde")]
    pub worker_drain_timeout: Duration,
    /// How long to wait for AttachCompleted after a successful Attach call.
    #[serde(with = "humantime_serde")]
    pub attach_timeout: Duration,
    pub fingerprint_salt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("forge-orchestrator"),
            session_id: Uuid::nil(),
            environment: "dev".to_string(),
            engine_version: "0.0.0".to_string(),
            grpc_port: 9701,
            remote_worker_count: 4,
            unary_retries: RetryConfig::default(),
            streaming_retries: RetryConfig::streaming(),
            connect_timeout: Duration::from_secs(10),
            worker_drain_timeout: Duration::from_secs(30),
            attach_timeout: Duration::from_secs(60),
            fingerprint_salt: String::new(),
        }
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "session id: {}", self.session_id);
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "engine version: {}", self.engine_version);
        let _ = writeln!(&mut result, "gRPC port: {}", self.grpc_port);
        let _ = writeln!(
            &mut result,
            "remote worker count: {}",
            self.remote_worker_count
        );
        let _ = writeln!(&mut result, "unary retries:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.unary_retries.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "streaming retries:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.streaming_retries.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "connect timeout: {:?}", self.connect_timeout);
        let _ = writeln!(
            &mut result,
            "worker drain timeout: {:?}",
            self.worker_drain_timeout
        );
        let _ = writeln!(&mut result, "attach timeout: {:?}", self.attach_timeout);
        let _ = writeln!(&mut result, "fingerprint salt: ****");
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<OrchestratorConfig> {
    ConfigLoader::new(&PathBuf::from("config/forge-orchestrator.toml"))
}
