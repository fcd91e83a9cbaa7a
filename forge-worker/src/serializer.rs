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

use forge_common::model::ExecutionResult;
use forge_common::serialization::BufferPool;

/// Serializes pip execution results into the opaque result blob carried by
/// `PipCompletionData`, reusing pooled buffers on the hot path.
pub struct PipResultSerializer {
    pool: BufferPool,
}

impl PipResultSerializer {
    pub fn new() -> Self {
        Self {
            pool: BufferPool::new(),
        }
    }

    pub fn serialize(&self, result: &ExecutionResult) -> Result<Vec<u8>, String> {
        let mut buffer = self.pool.acquire();
        let outcome = bincode::encode_into_std_write(
            result,
            &mut buffer,
            bincode::config::standard(),
        )
        .map(|_| buffer.as_slice().to_vec())
        .map_err(|err| format!("Failed to serialize pip result: {err}"));
        self.pool.release(buffer);
        outcome
    }
}

impl Default for PipResultSerializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use forge_common::model::{ExecutionStatus, PipExecutionStep, PipId};
    use forge_common::serialization::deserialize;

    #[test]
    fn serialized_result_round_trips_under_scheduler_equality() {
        let serializer = PipResultSerializer::new();
        let result = ExecutionResult {
            pip_id: PipId(42),
            status: ExecutionStatus::Failed {
                error: "compiler crashed".to_string(),
            },
            step: PipExecutionStep::ExecuteProcess,
            execution_ms: 777,
            suspended_ms: 3,
            retry_count: 2,
            output_hashes: vec![(
                "obj/foo.o".to_string(),
                forge_common::model::ContentHash([9u8; 32]),
            )],
        };

        let blob = serializer.serialize(&result).unwrap();
        let back: ExecutionResult = deserialize(&blob).unwrap();
        assert_eq!(result, back);

        // The pooled buffer does not leak state between serializations.
        let second = ExecutionResult::succeeded(PipId(1), PipExecutionStep::CacheLookup);
        let blob2 = serializer.serialize(&second).unwrap();
        let back2: ExecutionResult = deserialize(&blob2).unwrap();
        assert_eq!(second, back2);
    }
}
