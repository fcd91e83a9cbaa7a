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

use forge_common::metrics::api::TraceErrorKind;
use forge_common::model::WorkerId;
use forge_common::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{worker_id} is {status}, cannot {operation}")]
    WrongState {
        worker_id: WorkerId,
        status: String,
        operation: &'static str,
    },
    #[error("{worker_id} has no location assigned yet")]
    NoLocation { worker_id: WorkerId },
    #[error("{rpc} to {worker_id} failed: {detail}")]
    CallFailed {
        worker_id: WorkerId,
        rpc: &'static str,
        detail: String,
    },
    #[error("{rpc} to {worker_id} was cancelled")]
    Cancelled {
        worker_id: WorkerId,
        rpc: &'static str,
    },
    #[error("protocol violation from {worker_id}: {detail}")]
    ProtocolViolation { worker_id: WorkerId, detail: String },
    #[error("{worker_id} did not complete the attach handshake in time")]
    AttachTimeout { worker_id: WorkerId },
}

impl SafeDisplay for WorkerError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

impl TraceErrorKind for WorkerError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            WorkerError::WrongState { .. } => "WrongState",
            WorkerError::NoLocation { .. } => "NoLocation",
            WorkerError::CallFailed { .. } => "CallFailed",
            WorkerError::Cancelled { .. } => "Cancelled",
            WorkerError::ProtocolViolation { .. } => "ProtocolViolation",
            WorkerError::AttachTimeout { .. } => "AttachTimeout",
        }
    }
}
