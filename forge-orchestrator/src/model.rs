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

use forge_common::model::{
    ContentHash, PipExecutionStep, PipFingerprint, PipId, PipType, SemiStableHash, ServiceLocation,
};
use forge_api_grpc::proto::forge::worker::v1 as worker_proto;

/// Build-wide start data handed to every attaching worker. The invocation id
/// and the target worker id are added by the slot when the Attach call is
/// composed.
#[derive(Debug, Clone)]
pub struct BuildStartParams {
    pub cached_graph_descriptor_hash: ContentHash,
    pub symlink_file_content_hash: ContentHash,
    pub fingerprint_salt: String,
    pub orchestrator_location: ServiceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    BuildCompleted,
    EarlyReleased,
    BuildFailed,
}

impl From<ExitReason> for worker_proto::ExitReason {
    fn from(value: ExitReason) -> Self {
        match value {
            ExitReason::BuildCompleted => worker_proto::ExitReason::BuildCompleted,
            ExitReason::EarlyReleased => worker_proto::ExitReason::EarlyReleased,
            ExitReason::BuildFailed => worker_proto::ExitReason::BuildFailed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildEndParams {
    pub reason: ExitReason,
    pub failure: Option<String>,
}

/// One pip to dispatch to a remote worker.
#[derive(Debug, Clone)]
pub struct PipRequest {
    pub pip_id: PipId,
    pub pip_type: PipType,
    pub semi_stable_hash: SemiStableHash,
    pub fingerprint: PipFingerprint,
    pub priority: i32,
    pub step: PipExecutionStep,
}

impl From<&PipRequest> for worker_proto::SinglePipBuildRequest {
    fn from(value: &PipRequest) -> Self {
        Self {
            pip_id: value.pip_id.0,
            fingerprint: Some(value.fingerprint.clone().into()),
            priority: value.priority,
            step: forge_api_grpc::proto::forge::common::PipExecutionStep::from(value.step) as i32,
        }
    }
}

pub use forge_common::model::FileHash;
