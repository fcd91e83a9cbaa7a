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

use crate::metrics::record_execution_log_blob;
use crate::scheduler::ExecutionLogSink;
use bytes::Bytes;
use forge_common::model::WorkerId;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

/// Replays the numbered execution log blobs of one worker into the
/// scheduler's log sink, in exact sequence order.
///
/// Blobs pass through a single-slot queue; the inbound RPC is acknowledged
/// once its blob is enqueued, which gives the worker back-pressure without
/// waiting for sink processing. The worker keeps at most one
/// ReportExecutionLog call in flight, so sequence numbers can only arrive in
/// order or as duplicates of already acknowledged blobs.
pub struct WorkerExecutionLogReader {
    worker_id: WorkerId,
    sender: Mutex<Option<mpsc::Sender<(i32, Bytes)>>>,
    last_enqueued_seq: AtomicI64,
    last_applied_seq: Arc<AtomicI64>,
    disabled: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl WorkerExecutionLogReader {
    pub fn new(worker_id: WorkerId, sink: Arc<dyn ExecutionLogSink>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<(i32, Bytes)>(1);
        let (done_sender, done) = watch::channel(false);
        let last_applied_seq = Arc::new(AtomicI64::new(-1));
        let disabled = Arc::new(AtomicBool::new(false));

        let applied = last_applied_seq.clone();
        let disable_flag = disabled.clone();
        tokio::spawn(async move {
            while let Some((seq, blob)) = receiver.recv().await {
                if disable_flag.load(Ordering::SeqCst) {
                    continue;
                }
                match sink.process(&blob) {
                    Ok(()) => {
                        applied.store(seq as i64, Ordering::SeqCst);
                        record_execution_log_blob();
                    }
                    Err(err) => {
                        // A corrupt blob poisons only this worker's log
                        // stream, not the build.
                        error!(
                            worker = %worker_id,
                            sequence_number = seq,
                            "Failed to decode execution log blob, disabling log processing: {err}"
                        );
                        disable_flag.store(true, Ordering::SeqCst);
                    }
                }
            }
            let _ = done_sender.send(true);
        });

        Self {
            worker_id,
            sender: Mutex::new(Some(sender)),
            last_enqueued_seq: AtomicI64::new(-1),
            last_applied_seq,
            disabled,
            done,
        }
    }

    /// Enqueues one blob. Returns once the blob is in the queue; the caller
    /// acknowledges the RPC afterwards.
    ///
    /// Duplicates of already acknowledged sequence numbers are dropped. A
    /// sequence number further ahead than `last + 1` is a protocol
    /// violation: the worker must not send ahead without an ACK. It disables
    /// log processing for this worker and leaves the build running.
    pub async fn receive(&self, sequence_number: i32, blob: Bytes) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }

        let last = self.last_enqueued_seq.load(Ordering::SeqCst);
        let seq = sequence_number as i64;

        if seq <= last {
            debug!(
                worker = %self.worker_id,
                sequence_number,
                "Dropping duplicate execution log blob"
            );
            return;
        }

        if seq > last + 1 {
            error!(
                worker = %self.worker_id,
                sequence_number,
                last_sequence_number = last,
                "Execution log sequence gap, disabling log processing for this worker"
            );
            self.disabled.store(true, Ordering::SeqCst);
            return;
        }

        let sender = self.sender.lock().await;
        if let Some(sender) = sender.as_ref() {
            if sender.send((sequence_number, blob)).await.is_ok() {
                self.last_enqueued_seq.store(seq, Ordering::SeqCst);
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn last_applied_sequence_number(&self) -> i64 {
        self.last_applied_seq.load(Ordering::SeqCst)
    }

    /// Stops accepting blobs and waits until everything already enqueued has
    /// been applied. Safe to call more than once, and resolves immediately
    /// when no blob was ever received.
    pub async fn finalize(&self) {
        {
            let mut sender = self.sender.lock().await;
            *sender = None;
        }
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        info!(
            worker = %self.worker_id,
            last_sequence_number = self.last_applied_sequence_number(),
            "Execution log reader finalized"
        );
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        blobs: StdMutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                blobs: StdMutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn count(&self) -> usize {
            self.blobs.lock().unwrap().len()
        }
    }

    impl ExecutionLogSink for RecordingSink {
        fn process(&self, data: &[u8]) -> Result<(), String> {
            if self.fail.load(Ordering::SeqCst) {
                Err("decode failure".to_string())
            } else {
                self.blobs.lock().unwrap().push(data.to_vec());
                Ok(())
            }
        }
    }

    #[test]
    async fn blobs_are_applied_in_sequence_order() {
        let sink = RecordingSink::new();
        let reader = WorkerExecutionLogReader::new(WorkerId(1), sink.clone());

        reader.receive(0, Bytes::from_static(b"a")).await;
        reader.receive(1, Bytes::from_static(b"b")).await;
        reader.receive(2, Bytes::from_static(b"c")).await;
        reader.finalize().await;

        assert_eq!(
            *sink.blobs.lock().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(reader.last_applied_sequence_number(), 2);
    }

    #[test]
    async fn duplicate_blob_is_applied_once() {
        let sink = RecordingSink::new();
        let reader = WorkerExecutionLogReader::new(WorkerId(1), sink.clone());

        reader.receive(0, Bytes::from_static(b"a")).await;
        reader.receive(0, Bytes::from_static(b"a")).await;
        reader.finalize().await;

        assert_eq!(sink.count(), 1);
        assert_eq!(reader.last_applied_sequence_number(), 0);
        assert!(!reader.is_disabled());
    }

    #[test]
    async fn sequence_gap_disables_the_reader_only() {
        let sink = RecordingSink::new();
        let reader = WorkerExecutionLogReader::new(WorkerId(1), sink.clone());

        reader.receive(0, Bytes::from_static(b"a")).await;
        reader.receive(2, Bytes::from_static(b"c")).await;

        assert!(reader.is_disabled());

        // Further blobs are ignored, the reader still finalizes.
        reader.receive(1, Bytes::from_static(b"b")).await;
        reader.finalize().await;

        assert_eq!(sink.count(), 1);
    }

    #[test]
    async fn decode_failure_disables_further_processing() {
        let sink = RecordingSink::new();
        let reader = WorkerExecutionLogReader::new(WorkerId(1), sink.clone());

        reader.receive(0, Bytes::from_static(b"a")).await;
        reader.finalize().await;
        assert_eq!(sink.count(), 1);

        sink.fail.store(true, Ordering::SeqCst);
        let reader2 = WorkerExecutionLogReader::new(WorkerId(2), sink.clone());
        reader2.receive(0, Bytes::from_static(b"bad")).await;
        reader2.finalize().await;
        assert!(reader2.is_disabled());
    }

    #[test]
    async fn finalize_without_any_blob_resolves() {
        let sink = RecordingSink::new();
        let reader = WorkerExecutionLogReader::new(WorkerId(1), sink.clone());
        reader.finalize().await;
        reader.finalize().await;
        assert_eq!(sink.count(), 0);
    }
}
