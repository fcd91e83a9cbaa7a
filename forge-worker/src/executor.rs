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
use forge_common::model::{
    ContentHash, ExecutionResult, FileHash, PipExecutionStep, PipFingerprint, PipId,
};

/// One pip handed to the local execution engine.
#[derive(Debug, Clone)]
pub struct PipExecutionRequest {
    pub pip_id: PipId,
    pub fingerprint: PipFingerprint,
    pub priority: i32,
    pub step: PipExecutionStep,
}

/// The worker's local execution engine: sandboxing, caching and the real
/// pip semantics live behind this seam.
#[async_trait]
pub trait PipExecutor: Send + Sync {
    /// Runs one pip step to completion. Never fails as an RPC: every
    /// outcome, including crashes, is an `ExecutionResult`.
    async fn execute_pip(&self, request: PipExecutionRequest) -> ExecutionResult;

    /// File content hashes shared by a dispatched batch, for input
    /// materialization.
    fn add_file_hashes(&self, _hashes: Vec<FileHash>) {}

    /// Hash proving this worker's cache configuration matches the build;
    /// reported in AttachCompleted.
    fn cache_validation_hash(&self) -> ContentHash {
        ContentHash::ZERO
    }
}
