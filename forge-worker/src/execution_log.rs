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

use crate::metrics::record_execution_log_flush;
use forge_api_grpc::proto::forge::orchestrator::v1::ExecutionLogData;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct LogTargetState {
    buffer: Vec<u8>,
    next_sequence_number: i32,
    active: bool,
}

/// Execution log sink on the worker: buffers binary log events in memory
/// and emits numbered `ExecutionLogData` blobs for the notification sender.
///
/// Sequence numbers start at 0 and increment strictly; once deactivated
/// (worker exit), subsequent writes are dropped.
pub struct NotifyExecutionLogTarget {
    state: Mutex<LogTargetState>,
    flush_sender: mpsc::UnboundedSender<ExecutionLogData>,
    flush_threshold: usize,
}

impl NotifyExecutionLogTarget {
    pub fn new(
        flush_threshold: usize,
        flush_sender: mpsc::UnboundedSender<ExecutionLogData>,
    ) -> Self {
        Self {
            state: Mutex::new(LogTargetState {
                buffer: Vec::new(),
                next_sequence_number: 0,
                active: true,
            }),
            flush_sender,
            flush_threshold,
        }
    }

    /// Appends one binary log record; flushes when the buffer reached the
    /// threshold.
    pub fn record(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            return;
        }
        state.buffer.extend_from_slice(data);
        if state.buffer.len() >= self.flush_threshold {
            self.flush_locked(&mut state);
        }
    }

    /// Flushes whatever is buffered, if anything.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        if state.active && !state.buffer.is_empty() {
            self.flush_locked(&mut state);
        }
    }

    /// Stops accepting writes; the final buffer content is flushed first.
    pub fn deactivate(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            return;
        }
        if !state.buffer.is_empty() {
            self.flush_locked(&mut state);
        }
        state.active = false;
        debug!("execution log target deactivated");
    }

    fn flush_locked(&self, state: &mut LogTargetState) {
        let blob = std::mem::take(&mut state.buffer);
        let sequence_number = state.next_sequence_number;
        state.next_sequence_number += 1;
        record_execution_log_flush(blob.len());
        debug!(sequence_number, bytes = blob.len(), "execution log flush");
        let _ = self.flush_sender.send(ExecutionLogData {
            sequence_number,
            data_blob: blob,
        });
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn target_with_threshold(
        threshold: usize,
    ) -> (
        NotifyExecutionLogTarget,
        mpsc::UnboundedReceiver<ExecutionLogData>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (NotifyExecutionLogTarget::new(threshold, sender), receiver)
    }

    #[test]
    async fn buffer_at_threshold_flushes_and_below_does_not() {
        let (target, mut flushes) = target_with_threshold(1024);

        target.record(&vec![0u8; 1023]);
        assert!(flushes.try_recv().is_err());

        target.record(&[0u8]);
        let flush = flushes.try_recv().unwrap();
        assert_eq!(flush.sequence_number, 0);
        assert_eq!(flush.data_blob.len(), 1024);
    }

    #[test]
    async fn sequence_numbers_start_at_zero_and_increment() {
        let (target, mut flushes) = target_with_threshold(8);

        target.record(&[1u8; 8]);
        target.record(&[2u8; 8]);
        target.record(&[3u8; 8]);

        assert_eq!(flushes.try_recv().unwrap().sequence_number, 0);
        assert_eq!(flushes.try_recv().unwrap().sequence_number, 1);
        assert_eq!(flushes.try_recv().unwrap().sequence_number, 2);
    }

    #[test]
    async fn deactivate_flushes_remainder_and_drops_later_writes() {
        let (target, mut flushes) = target_with_threshold(1024);

        target.record(&[1, 2, 3]);
        target.deactivate();

        let last = flushes.try_recv().unwrap();
        assert_eq!(last.sequence_number, 0);
        assert_eq!(last.data_blob, vec![1, 2, 3]);

        target.record(&[4, 5, 6]);
        target.flush();
        assert!(flushes.try_recv().is_err());
    }

    #[test]
    async fn manual_flush_of_empty_buffer_is_a_no_op() {
        let (target, mut flushes) = target_with_threshold(1024);
        target.flush();
        assert!(flushes.try_recv().is_err());
    }
}
