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

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identity of a single distributed build, shared by the orchestrator and
/// every attached worker. A peer whose invocation id differs from the local
/// one rejects the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId {
    pub session_id: Uuid,
    pub environment: String,
    pub engine_version: String,
}

impl InvocationId {
    pub fn new(session_id: Uuid, environment: &str, engine_version: &str) -> Self {
        Self {
            session_id,
            environment: environment.to_string(),
            engine_version: engine_version.to_string(),
        }
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.session_id, self.environment, self.engine_version
        )
    }
}

impl TryFrom<forge_api_grpc::proto::forge::common::InvocationId> for InvocationId {
    type Error = String;

    fn try_from(
        value: forge_api_grpc::proto::forge::common::InvocationId,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: value.session_id.ok_or("Missing field: session_id")?.into(),
            environment: value.environment,
            engine_version: value.engine_version,
        })
    }
}

impl From<InvocationId> for forge_api_grpc::proto::forge::common::InvocationId {
    fn from(value: InvocationId) -> Self {
        Self {
            session_id: Some(value.session_id.into()),
            environment: value.environment,
            engine_version: value.engine_version,
        }
    }
}

/// Network endpoint of a worker or the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub host: String,
    pub port: u16,
}

impl ServiceLocation {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl Display for ServiceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl TryFrom<forge_api_grpc::proto::forge::common::ServiceLocation> for ServiceLocation {
    type Error = String;

    fn try_from(
        value: forge_api_grpc::proto::forge::common::ServiceLocation,
    ) -> Result<Self, Self::Error> {
        let port: u16 = value
            .port
            .try_into()
            .map_err(|_| format!("Invalid port: {}", value.port))?;
        Ok(Self {
            host: value.host,
            port,
        })
    }
}

impl From<ServiceLocation> for forge_api_grpc::proto::forge::common::ServiceLocation {
    fn from(value: ServiceLocation) -> Self {
        Self {
            host: value.host,
            port: value.port as u32,
        }
    }
}

/// Id of a worker slot on the orchestrator. Id 0 is the local in-process
/// worker and never appears in the remote slot pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub const LOCAL: WorkerId = WorkerId(0);

    pub fn is_remote(&self) -> bool {
        self.0 != 0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Worker#{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct PipId(pub u32);

impl Display for PipId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PipId({})", self.0)
    }
}

/// Stable hash of a pip, used in log lines only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct SemiStableHash(pub i64);

impl Display for SemiStableHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Pip{:016X}", self.0)
    }
}

/// Opaque cache key of a pip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct PipFingerprint(pub Vec<u8>);

impl Display for PipFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<forge_api_grpc::proto::forge::common::PipFingerprint> for PipFingerprint {
    fn from(value: forge_api_grpc::proto::forge::common::PipFingerprint) -> Self {
        Self(value.value)
    }
}

impl From<PipFingerprint> for forge_api_grpc::proto::forge::common::PipFingerprint {
    fn from(value: PipFingerprint) -> Self {
        Self { value: value.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0u8; 32]);
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl TryFrom<forge_api_grpc::proto::forge::common::ContentHash> for ContentHash {
    type Error = String;

    fn try_from(
        value: forge_api_grpc::proto::forge::common::ContentHash,
    ) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = value
            .value
            .as_slice()
            .try_into()
            .map_err(|_| format!("Invalid content hash length: {}", value.value.len()))?;
        Ok(Self(bytes))
    }
}

impl From<ContentHash> for forge_api_grpc::proto::forge::common::ContentHash {
    fn from(value: ContentHash) -> Self {
        Self {
            value: value.0.to_vec(),
        }
    }
}

/// Entry of the file hash table shared by all pips of a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub path: String,
    pub hash: ContentHash,
    pub length: u64,
}

impl TryFrom<forge_api_grpc::proto::forge::worker::v1::FileHashEntry> for FileHash {
    type Error = String;

    fn try_from(
        value: forge_api_grpc::proto::forge::worker::v1::FileHashEntry,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            path: value.path,
            hash: value.hash.ok_or("Missing field: hash")?.try_into()?,
            length: value.length,
        })
    }
}

impl From<&FileHash> for forge_api_grpc::proto::forge::worker::v1::FileHashEntry {
    fn from(value: &FileHash) -> Self {
        Self {
            path: value.path.clone(),
            hash: Some(value.hash.into()),
            length: value.length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum PipType {
    Process,
    Ipc,
    CopyFile,
    WriteFile,
    SealDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum PipExecutionStep {
    None,
    CacheLookup,
    ExecuteProcess,
    PostProcess,
    MaterializeOutputs,
}

impl From<forge_api_grpc::proto::forge::common::PipExecutionStep> for PipExecutionStep {
    fn from(value: forge_api_grpc::proto::forge::common::PipExecutionStep) -> Self {
        use forge_api_grpc::proto::forge::common::PipExecutionStep as Proto;
        match value {
            Proto::None => PipExecutionStep::None,
            Proto::CacheLookup => PipExecutionStep::CacheLookup,
            Proto::ExecuteProcess => PipExecutionStep::ExecuteProcess,
            Proto::PostProcess => PipExecutionStep::PostProcess,
            Proto::MaterializeOutputs => PipExecutionStep::MaterializeOutputs,
        }
    }
}

impl From<PipExecutionStep> for forge_api_grpc::proto::forge::common::PipExecutionStep {
    fn from(value: PipExecutionStep) -> Self {
        use forge_api_grpc::proto::forge::common::PipExecutionStep as Proto;
        match value {
            PipExecutionStep::None => Proto::None,
            PipExecutionStep::CacheLookup => Proto::CacheLookup,
            PipExecutionStep::ExecuteProcess => Proto::ExecuteProcess,
            PipExecutionStep::PostProcess => Proto::PostProcess,
            PipExecutionStep::MaterializeOutputs => Proto::MaterializeOutputs,
        }
    }
}

/// Per-slot state machine of a remote worker, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerNodeStatus {
    NotStarted,
    Starting,
    Attached,
    Stopping,
    Stopped,
}

impl WorkerNodeStatus {
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, WorkerNodeStatus::Stopping | WorkerNodeStatus::Stopped)
    }
}

impl Display for WorkerNodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WorkerNodeStatus::NotStarted => write!(f, "NotStarted"),
            WorkerNodeStatus::Starting => write!(f, "Starting"),
            WorkerNodeStatus::Attached => write!(f, "Attached"),
            WorkerNodeStatus::Stopping => write!(f, "Stopping"),
            WorkerNodeStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ExecutionStatus {
    Succeeded,
    Failed { error: String },
    Cancelled,
    /// Synthetic status produced by the orchestrator when the executing
    /// worker was lost; tells the scheduler to dispatch the pip elsewhere.
    Abandoned { reason: String },
}

/// Scheduler-level result of executing one pip step. Travels between worker
/// and orchestrator as an opaque serialized blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ExecutionResult {
    pub pip_id: PipId,
    pub status: ExecutionStatus,
    pub step: PipExecutionStep,
    pub execution_ms: u64,
    pub suspended_ms: u64,
    pub retry_count: u32,
    pub output_hashes: Vec<(String, ContentHash)>,
}

impl ExecutionResult {
    pub fn succeeded(pip_id: PipId, step: PipExecutionStep) -> Self {
        Self {
            pip_id,
            status: ExecutionStatus::Succeeded,
            step,
            execution_ms: 0,
            suspended_ms: 0,
            retry_count: 0,
            output_hashes: Vec::new(),
        }
    }

    pub fn abandoned(pip_id: PipId, reason: &str) -> Self {
        Self {
            pip_id,
            status: ExecutionStatus::Abandoned {
                reason: reason.to_string(),
            },
            step: PipExecutionStep::None,
            execution_ms: 0,
            suspended_ms: 0,
            retry_count: 0,
            output_hashes: Vec::new(),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.status, ExecutionStatus::Abandoned { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl EventLevel {
    /// Only errors and warnings are candidates for forwarding to the
    /// orchestrator.
    pub fn is_forwardable(&self) -> bool {
        matches!(self, EventLevel::Error | EventLevel::Warning)
    }
}

impl From<forge_api_grpc::proto::forge::common::EventLevel> for EventLevel {
    fn from(value: forge_api_grpc::proto::forge::common::EventLevel) -> Self {
        use forge_api_grpc::proto::forge::common::EventLevel as Proto;
        match value {
            Proto::Verbose => EventLevel::Verbose,
            Proto::Info => EventLevel::Info,
            Proto::Warning => EventLevel::Warning,
            Proto::Error => EventLevel::Error,
        }
    }
}

impl From<EventLevel> for forge_api_grpc::proto::forge::common::EventLevel {
    fn from(value: EventLevel) -> Self {
        use forge_api_grpc::proto::forge::common::EventLevel as Proto;
        match value {
            EventLevel::Verbose => Proto::Verbose,
            EventLevel::Info => Proto::Info,
            EventLevel::Warning => Proto::Warning,
            EventLevel::Error => Proto::Error,
        }
    }
}

/// Keyword bit marking an event that must never leave the process it was
/// raised in.
pub const EVENT_KEYWORD_NOT_FORWARDABLE: i64 = 1 << 4;

/// Keyword bit marking events raised by the distribution RPC layer itself.
/// Forwarding them would feed the failing channel with traffic about its own
/// failure.
pub const EVENT_KEYWORD_DISTRIBUTION_RPC: i64 = 1 << 5;

/// Keyword bit marking an error the worker's own infrastructure detected and
/// cannot survive. The orchestrator logs these at Warning: the worker will
/// exit, the build keeps running.
pub const EVENT_KEYWORD_INFRASTRUCTURE_ERROR: i64 = 1 << 6;

/// Event ids raised by the distribution layer; excluded from forwarding on
/// both sides even when their keywords say nothing.
pub const DISTRIBUTION_EVENT_IDS: &[i32] = &[14001, 14002, 14003, 14010, 14011];

pub fn is_distribution_event_id(event_id: i32) -> bool {
    DISTRIBUTION_EVENT_IDS.contains(&event_id)
}

pub fn is_forwardable_event(level: EventLevel, event_keywords: i64, event_id: i32) -> bool {
    level.is_forwardable()
        && event_keywords & (EVENT_KEYWORD_NOT_FORWARDABLE | EVENT_KEYWORD_DISTRIBUTION_RPC) == 0
        && !is_distribution_event_id(event_id)
}

pub fn current_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn invocation_id() -> InvocationId {
        InvocationId::new(
            Uuid::parse_str("3c6d9f24-94fa-4a36-bd9f-7a6e9ad35a1f").unwrap(),
            "prod",
            "1.2.3",
        )
    }

    #[test]
    fn invocation_id_equality_is_componentwise() {
        let a = invocation_id();
        let b = invocation_id();
        let c = invocation_id();

        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);

        let other_session = InvocationId::new(Uuid::new_v4(), "prod", "1.2.3");
        let other_env = InvocationId::new(a.session_id, "dev", "1.2.3");
        let other_version = InvocationId::new(a.session_id, "prod", "1.2.4");
        let empty_env = InvocationId::new(a.session_id, "", "1.2.3");

        assert_ne!(a, other_session);
        assert_ne!(a, other_env);
        assert_ne!(a, other_version);
        assert_ne!(a, empty_env);
    }

    #[test]
    fn invocation_id_display_form() {
        let id = invocation_id();
        assert_eq!(
            id.to_string(),
            "3c6d9f24-94fa-4a36-bd9f-7a6e9ad35a1f-prod-1.2.3"
        );
    }

    #[test]
    fn invocation_id_proto_round_trip() {
        let id = invocation_id();
        let proto: forge_api_grpc::proto::forge::common::InvocationId = id.clone().into();
        let back: InvocationId = proto.try_into().unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn content_hash_rejects_wrong_length() {
        let proto = forge_api_grpc::proto::forge::common::ContentHash {
            value: vec![1, 2, 3],
        };
        assert!(ContentHash::try_from(proto).is_err());
    }

    #[test]
    fn service_location_rejects_invalid_port() {
        let proto = forge_api_grpc::proto::forge::common::ServiceLocation {
            host: "10.0.0.1".to_string(),
            port: 70000,
        };
        assert!(ServiceLocation::try_from(proto).is_err());
    }

    #[test]
    fn not_forwardable_keyword_is_respected() {
        assert!(is_forwardable_event(EventLevel::Error, 0, 42));
        assert!(is_forwardable_event(EventLevel::Warning, 1 << 1, 42));
        assert!(!is_forwardable_event(
            EventLevel::Error,
            EVENT_KEYWORD_NOT_FORWARDABLE,
            42
        ));
        assert!(!is_forwardable_event(
            EventLevel::Error,
            EVENT_KEYWORD_DISTRIBUTION_RPC,
            42
        ));
        assert!(!is_forwardable_event(EventLevel::Info, 0, 42));
        assert!(!is_forwardable_event(
            EventLevel::Error,
            0,
            DISTRIBUTION_EVENT_IDS[0]
        ));
    }

    #[test]
    fn abandoned_result_is_marked() {
        let result = ExecutionResult::abandoned(PipId(7), "worker lost");
        assert!(result.is_abandoned());
        assert!(!ExecutionResult::succeeded(PipId(7), PipExecutionStep::ExecuteProcess)
            .is_abandoned());
    }
}
