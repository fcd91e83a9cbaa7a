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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_counter, register_histogram, register_int_gauge, Counter, Histogram,
    IntGauge,
};

lazy_static! {
    static ref RESULT_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "forge_worker_result_queue_depth",
        "Pip results waiting for the notification sender"
    )
    .unwrap();
    static ref RESULT_BATCHES_TOTAL: Counter = register_counter!(
        "forge_worker_result_batches_total",
        "Number of PipResultsInfo batches sent to the orchestrator"
    )
    .unwrap();
    static ref EXECUTION_LOG_FLUSH_BYTES: Histogram = register_histogram!(histogram_opts!(
        "forge_worker_execution_log_flush_bytes",
        "Size of flushed execution log blobs",
        vec![1024.0, 65536.0, 1048576.0, 8388608.0, 33554432.0, 67108864.0]
    ))
    .unwrap();
    static ref DROPPED_EVENTS_TOTAL: Counter = register_counter!(
        "forge_worker_dropped_events_total",
        "Events lost by the forwarding listener (lag or send failure)"
    )
    .unwrap();
}

pub fn record_result_queue_depth(depth: i64) {
    RESULT_QUEUE_DEPTH.set(depth);
}

pub fn record_result_batch() {
    RESULT_BATCHES_TOTAL.inc();
}

pub fn record_execution_log_flush(bytes: usize) {
    EXECUTION_LOG_FLUSH_BYTES.observe(bytes as f64);
}

pub fn record_dropped_event() {
    DROPPED_EVENTS_TOTAL.inc();
}
