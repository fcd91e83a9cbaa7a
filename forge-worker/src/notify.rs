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

use crate::metrics::{record_result_batch, record_result_queue_depth};
use forge_api_grpc::proto::forge::orchestrator::v1::orchestrator_service_client::OrchestratorServiceClient;
use forge_api_grpc::proto::forge::orchestrator::v1::{
    report_execution_log_response, report_pip_results_response, EventMessage, ExecutionLogData,
    PipCompletionData, PipResultsInfo, ReportExecutionLogRequest, ReportPipResultsRequest,
};
use forge_common::client::GrpcClient;
use forge_common::config::RetryConfig;
use forge_common::model::{current_unix_millis, InvocationId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

pub type OrchestratorClient = GrpcClient<OrchestratorServiceClient<Channel>>;

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub max_batch_size: usize,
    pub send_interval: Duration,
    pub streaming_retries: RetryConfig,
}

/// Multiplexes the worker's three outbound streams (pip results, execution
/// log blobs, forwarded events) into serial RPCs to the orchestrator.
///
/// A single sender task composes and sends messages one at a time: the next
/// message goes out only after the previous call returned. This keeps at
/// most one ReportExecutionLog in flight, which the orchestrator's log
/// reader relies on for its sequence ordering.
pub struct WorkerNotificationManager {
    results_sender: mpsc::Sender<PipCompletionData>,
    events_sender: mpsc::UnboundedSender<EventMessage>,
    draining: CancellationToken,
    done: watch::Receiver<bool>,
    queue_depth: Arc<AtomicI64>,
}

impl WorkerNotificationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        client: Arc<OrchestratorClient>,
        invocation_id: InvocationId,
        worker_id: Arc<AtomicU32>,
        config: NotificationConfig,
        flush_receiver: mpsc::UnboundedReceiver<ExecutionLogData>,
        fatal: CancellationToken,
    ) -> Self {
        let (results_sender, results_receiver) = mpsc::channel(512);
        let (events_sender, events_receiver) = mpsc::unbounded_channel();
        let draining = CancellationToken::new();
        let (done_sender, done) = watch::channel(false);
        let queue_depth = Arc::new(AtomicI64::new(0));

        let sender = NotificationSender {
            client,
            invocation_id,
            worker_id,
            config,
            draining: draining.clone(),
            fatal,
            queue_depth: queue_depth.clone(),
        };
        tokio::spawn(async move {
            sender
                .run(results_receiver, events_receiver, flush_receiver)
                .await;
            let _ = done_sender.send(true);
        });

        Self {
            results_sender,
            events_sender,
            draining,
            done,
            queue_depth,
        }
    }

    /// Queue endpoint the pip executor pushes finished pips into
    /// (`ReadyToSendResultList`).
    pub async fn enqueue_pip_result(&self, data: PipCompletionData) -> Result<(), String> {
        if self.draining.is_cancelled() {
            return Err("notification manager is draining".to_string());
        }
        self.results_sender
            .send(data)
            .await
            .map_err(|_| "notification sender is gone".to_string())?;
        record_result_queue_depth(self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(())
    }

    /// Queue endpoint of the forwarding event listener.
    pub fn events_sender(&self) -> mpsc::UnboundedSender<EventMessage> {
        self.events_sender.clone()
    }

    /// Switches to draining: no new pip results are accepted, everything
    /// already queued is flushed, then the sender exits.
    pub fn start_draining(&self) {
        self.draining.cancel();
    }

    /// Starts draining and waits for the sender to finish, bounded by
    /// `timeout`. Returns false when the drain timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.start_draining();
        let mut done = self.done.clone();
        let wait = async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

struct NotificationSender {
    client: Arc<OrchestratorClient>,
    invocation_id: InvocationId,
    worker_id: Arc<AtomicU32>,
    config: NotificationConfig,
    draining: CancellationToken,
    fatal: CancellationToken,
    queue_depth: Arc<AtomicI64>,
}

impl NotificationSender {
    async fn run(
        &self,
        mut results: mpsc::Receiver<PipCompletionData>,
        mut events: mpsc::UnboundedReceiver<EventMessage>,
        mut flushes: mpsc::UnboundedReceiver<ExecutionLogData>,
    ) {
        let mut pending_pips: Vec<PipCompletionData> = Vec::new();
        let mut pending_events: Vec<EventMessage> = Vec::new();
        let mut pending_flushes: VecDeque<ExecutionLogData> = VecDeque::new();
        let mut results_closed = false;
        let mut events_closed = false;
        let mut flushes_closed = false;
        let mut last_send = Instant::now();

        loop {
            // Log blobs go out first and strictly in order; each send
            // completes before the next is composed.
            while let Some(blob) = pending_flushes.pop_front() {
                if !self.send_execution_log(blob).await {
                    return;
                }
            }

            let draining = self.draining.is_cancelled();
            let batch_full = pending_pips.len() >= self.config.max_batch_size;
            let interval_elapsed = last_send.elapsed() >= self.config.send_interval;
            let have_payload = !pending_pips.is_empty() || !pending_events.is_empty();

            if (!pending_pips.is_empty() && (interval_elapsed || batch_full))
                || (draining && have_payload)
            {
                let batch_len = pending_pips.len().min(self.config.max_batch_size);
                let batch: Vec<PipCompletionData> = pending_pips.drain(..batch_len).collect();
                let forwarded: Vec<EventMessage> = std::mem::take(&mut pending_events);
                record_result_queue_depth(
                    self.queue_depth
                        .fetch_sub(batch.len() as i64, Ordering::SeqCst)
                        - batch.len() as i64,
                );
                if !self.send_pip_results(batch, forwarded).await {
                    return;
                }
                last_send = Instant::now();
                continue;
            }

            if draining {
                // No timers while draining; pull whatever the sources still
                // hold and leave once everything is empty.
                let mut received_any = false;
                while let Ok(pip) = results.try_recv() {
                    pending_pips.push(pip);
                    received_any = true;
                }
                while let Ok(event) = events.try_recv() {
                    pending_events.push(event);
                    received_any = true;
                }
                while let Ok(flush) = flushes.try_recv() {
                    pending_flushes.push_back(flush);
                    received_any = true;
                }
                if !received_any
                    && pending_pips.is_empty()
                    && pending_events.is_empty()
                    && pending_flushes.is_empty()
                {
                    break;
                }
                continue;
            }

            if results_closed && events_closed && flushes_closed && !have_payload {
                break;
            }

            tokio::select! {
                received = results.recv(), if !results_closed => match received {
                    Some(pip) => pending_pips.push(pip),
                    None => results_closed = true,
                },
                received = events.recv(), if !events_closed => match received {
                    Some(event) => pending_events.push(event),
                    None => events_closed = true,
                },
                received = flushes.recv(), if !flushes_closed => match received {
                    Some(flush) => pending_flushes.push_back(flush),
                    None => flushes_closed = true,
                },
                _ = tokio::time::sleep_until(last_send + self.config.send_interval),
                    if !pending_pips.is_empty() => {},
                _ = self.draining.cancelled() => {},
            }
        }

        info!("notification sender drained");
    }

    async fn send_pip_results(
        &self,
        mut pips: Vec<PipCompletionData>,
        forwarded_events: Vec<EventMessage>,
    ) -> bool {
        let now = current_unix_millis();
        for pip in &mut pips {
            pip.before_send_timestamp = now;
        }
        let pip_count = pips.len();

        let request = ReportPipResultsRequest {
            invocation_id: Some(self.invocation_id.clone().into()),
            worker_id: self.worker_id.load(Ordering::SeqCst),
            results: Some(PipResultsInfo {
                completed_pips: pips,
                build_manifest_events: None,
                forwarded_events,
            }),
        };

        let result = self
            .client
            .call_with_retries(
                "ReportPipResults",
                &self.config.streaming_retries,
                None,
                &self.fatal,
                move |client| {
                    let request = request.clone();
                    Box::pin(async move {
                        client
                            .report_pip_results(request)
                            .await
                            .map(|response| response.into_inner())
                    })
                },
            )
            .await;

        if result.is_cancelled() {
            return false;
        }
        if !result.is_succeeded() {
            warn!(
                "failed to report pip results, shutting worker down: {}",
                result.last_failure()
            );
            self.fatal.cancel();
            return false;
        }
        if let Some(report_pip_results_response::Result::Error(body)) =
            result.value().result.as_ref()
        {
            warn!(
                "orchestrator rejected pip results, shutting worker down: {}",
                body.error
            );
            self.fatal.cancel();
            return false;
        }

        record_result_batch();
        debug!(pips = pip_count, "sent pip result batch");
        true
    }

    async fn send_execution_log(&self, events: ExecutionLogData) -> bool {
        let sequence_number = events.sequence_number;
        let request = ReportExecutionLogRequest {
            invocation_id: Some(self.invocation_id.clone().into()),
            worker_id: self.worker_id.load(Ordering::SeqCst),
            events: Some(events),
        };

        let result = self
            .client
            .call_with_retries(
                "ReportExecutionLog",
                &self.config.streaming_retries,
                None,
                &self.fatal,
                move |client| {
                    let request = request.clone();
                    Box::pin(async move {
                        client
                            .report_execution_log(request)
                            .await
                            .map(|response| response.into_inner())
                    })
                },
            )
            .await;

        if result.is_cancelled() {
            return false;
        }
        if !result.is_succeeded() {
            warn!(
                sequence_number,
                "failed to report execution log, shutting worker down: {}",
                result.last_failure()
            );
            self.fatal.cancel();
            return false;
        }
        if let Some(report_execution_log_response::Result::Error(body)) =
            result.value().result.as_ref()
        {
            warn!(
                sequence_number,
                "orchestrator rejected execution log, shutting worker down: {}", body.error
            );
            self.fatal.cancel();
            return false;
        }

        debug!(sequence_number, "sent execution log blob");
        true
    }
}
