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

/// The scheduler as seen from the distribution core: a sink for pip
/// completions and a source of termination state. Scheduling policy, the pip
/// graph and re-dispatch of abandoned pips all live behind this seam.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Called once per completed (or abandoned) pip, after the pending
    /// completion promise was resolved.
    async fn on_pip_completed(&self, worker_id: WorkerId, result: ExecutionResult);

    /// True while the scheduler is terminating because of an internal
    /// error; inbound execution log traffic is dropped in that state.
    fn has_failed_internally(&self) -> bool;
}

/// Consumer of the binary execution log replayed from a worker.
pub trait ExecutionLogSink: Send + Sync {
    fn process(&self, data: &[u8]) -> Result<(), String>;
}
