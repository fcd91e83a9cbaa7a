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

use forge_common::metrics::DEFAULT_TIME_BUCKETS;
use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_counter, register_counter_vec, register_histogram, Counter,
    CounterVec, Histogram,
};
use std::time::Duration;

lazy_static! {
    static ref REMOTE_RESULT_SEND_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "forge_remote_result_send_seconds",
        "End to end latency between a worker queuing a pip result and the orchestrator receiving it",
        DEFAULT_TIME_BUCKETS.to_vec()
    ))
    .unwrap();
    static ref FORWARDED_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "forge_forwarded_events_total",
        "Number of worker events re-logged on the orchestrator",
        &["level"]
    )
    .unwrap();
    static ref EXECUTION_LOG_BLOBS_TOTAL: Counter = register_counter!(
        "forge_execution_log_blobs_total",
        "Number of execution log blobs applied to the log sink"
    )
    .unwrap();
    static ref PIPS_ABANDONED_TOTAL: Counter = register_counter!(
        "forge_pips_abandoned_total",
        "Number of pips abandoned because their worker was lost"
    )
    .unwrap();
}

pub fn record_remote_result_send(latency: Duration) {
    REMOTE_RESULT_SEND_SECONDS.observe(latency.as_secs_f64());
}

pub fn record_forwarded_event(level: &str) {
    FORWARDED_EVENTS_TOTAL.with_label_values(&[level]).inc();
}

pub fn record_execution_log_blob() {
    EXECUTION_LOG_BLOBS_TOTAL.inc();
}

pub fn record_abandoned_pips(count: u64) {
    PIPS_ABANDONED_TOTAL.inc_by(count as f64);
}
