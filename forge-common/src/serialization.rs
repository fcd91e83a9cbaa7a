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

use std::sync::Mutex;

pub fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, String> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| format!("Failed to serialize value: {err}"))
}

pub fn deserialize<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, String> {
    let (value, consumed) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|err| format!("Failed to deserialize value: {err}"))?;
    if consumed != data.len() {
        Err(format!(
            "Failed to deserialize value: {} trailing bytes",
            data.len() - consumed
        ))
    } else {
        Ok(value)
    }
}

/// Unbounded free-list of byte buffers for serializers on hot paths.
/// Buffers are cleared on release, capacity is kept.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.buffers.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.buffers.lock().unwrap().push(buffer);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::{ExecutionResult, PipExecutionStep, PipId};

    #[test]
    fn execution_result_round_trips() {
        let result = ExecutionResult {
            pip_id: PipId(42),
            status: crate::model::ExecutionStatus::Succeeded,
            step: PipExecutionStep::ExecuteProcess,
            execution_ms: 1234,
            suspended_ms: 5,
            retry_count: 1,
            output_hashes: vec![("out/a.o".to_string(), crate::model::ContentHash([7u8; 32]))],
        };

        let bytes = serialize(&result).unwrap();
        let back: ExecutionResult = deserialize(&bytes).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let result = ExecutionResult::succeeded(PipId(1), PipExecutionStep::CacheLookup);
        let mut bytes = serialize(&result).unwrap();
        bytes.push(0);
        assert!(deserialize::<ExecutionResult>(&bytes).is_err());
    }

    #[test]
    fn buffer_pool_reuses_capacity() {
        let pool = BufferPool::new();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(&[1, 2, 3]);
        let capacity = buffer.capacity();
        pool.release(buffer);

        let buffer = pool.acquire();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
    }
}
