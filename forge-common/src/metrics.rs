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

pub const DEFAULT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub mod api {
    use super::DEFAULT_TIME_BUCKETS;
    use lazy_static::lazy_static;
    use prometheus::{
        histogram_opts, register_counter_vec, register_histogram_vec, CounterVec, HistogramVec,
    };
    use std::time::Duration;

    lazy_static! {
        static ref GRPC_API_SUCCESS_SECONDS: HistogramVec = register_histogram_vec!(
            histogram_opts!(
                "grpc_api_success_seconds",
                "Duration of successful gRPC API calls",
                DEFAULT_TIME_BUCKETS.to_vec()
            ),
            &["api"]
        )
        .unwrap();
        static ref GRPC_API_FAILURE_TOTAL: CounterVec = register_counter_vec!(
            "grpc_api_failure_total",
            "Number of failed gRPC API calls",
            &["api", "error_kind"]
        )
        .unwrap();
    }

    /// Coarse classification of an error for the failure counter's label.
    pub trait TraceErrorKind {
        fn trace_error_kind(&self) -> &'static str;
    }

    pub fn record_grpc_success(api: &str, duration: Duration) {
        GRPC_API_SUCCESS_SECONDS
            .with_label_values(&[api])
            .observe(duration.as_secs_f64());
    }

    pub fn record_grpc_failure(api: &str, error_kind: &'static str) {
        GRPC_API_FAILURE_TOTAL
            .with_label_values(&[api, error_kind])
            .inc();
    }
}

/// Creates the tracing span wrapping one inbound gRPC API request.
#[macro_export]
macro_rules! recorded_grpc_api_request {
    ($api_name:expr, $($fields:tt)*) => {
        tracing::info_span!("grpc_api_request", api = $api_name, $($fields)*)
    };
}
