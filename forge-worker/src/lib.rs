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

pub mod config;
pub mod events;
pub mod execution_log;
pub mod executor;
pub mod grpcapi;
pub mod metrics;
pub mod notify;
pub mod serializer;

#[cfg(test)]
test_r::enable!();

use crate::config::WorkerConfig;
use crate::events::{start_forwarding_listener, EventBus};
use crate::execution_log::NotifyExecutionLogTarget;
use crate::executor::{PipExecutionRequest, PipExecutor};
use crate::grpcapi::WorkerGrpcApi;
use crate::notify::{NotificationConfig, OrchestratorClient, WorkerNotificationManager};
use crate::serializer::PipResultSerializer;
use forge_api_grpc::proto::forge::common::PipExecutionStep as ProtoPipExecutionStep;
use forge_api_grpc::proto::forge::orchestrator::v1::orchestrator_service_client::OrchestratorServiceClient;
use forge_api_grpc::proto::forge::orchestrator::v1::{
    hello_response, AttachCompletedRequest, AttachCompletionInfo, HelloRequest, PipCompletionData,
    ReportWorkerPerfInfoRequest, WorkerPerfInfo, WorkerResourceInfo,
};
use forge_common::client::{GrpcClient, GrpcClientConfig};
use forge_common::model::{InvocationId, ServiceLocation, WorkerId};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RunDetails {
    pub grpc_port: u16,
}

/// Everything the worker's RPC handlers and background tasks share.
pub struct WorkerRuntime {
    pub invocation_id: InvocationId,
    pub worker_id: Arc<AtomicU32>,
    pub client: Arc<OrchestratorClient>,
    pub notifications: WorkerNotificationManager,
    pub log_target: Arc<NotifyExecutionLogTarget>,
    pub event_bus: EventBus,
    pub executor: Arc<dyn PipExecutor>,
    pub serializer: Arc<PipResultSerializer>,
    /// Worker-global cancellation: fired on Exit and on unhandled sender
    /// errors.
    pub shutdown: CancellationToken,
    pub drain_timeout: std::time::Duration,
    pub pip_slots: u32,
    attached: AtomicBool,
}

impl WorkerRuntime {
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn mark_attached(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    /// Spawns the local execution of one pip; its result is serialized and
    /// queued for the notification sender when it finishes.
    pub fn spawn_pip(self: Arc<Self>, request: PipExecutionRequest) {
        let this = self;
        tokio::spawn(async move {
            let pip_id = request.pip_id;
            let step = request.step;
            let queued_at = tokio::time::Instant::now();
            let result = this.executor.execute_pip(request).await;

            let result_blob = match this.serializer.serialize(&result) {
                Ok(blob) => blob,
                Err(err) => {
                    warn!(pip = %pip_id, "failed to serialize pip result: {err}");
                    return;
                }
            };

            let data = PipCompletionData {
                pip_id: pip_id.0,
                step: ProtoPipExecutionStep::from(step) as i32,
                queue_ticks: 0,
                execute_ticks: queued_at.elapsed().as_millis() as i64,
                result_blob,
                before_send_timestamp: 0,
            };

            if let Err(err) = this.notifications.enqueue_pip_result(data).await {
                debug!(pip = %pip_id, "dropping pip result: {err}");
            }
        });
    }

    /// Reports AttachCompleted back to the orchestrator, off the Attach
    /// handler's callstack.
    pub fn spawn_attach_completed(self: Arc<Self>) {
        let this = self;
        tokio::spawn(async move {
            let mut system = System::new();
            system.refresh_memory();
            let resources = WorkerResourceInfo {
                total_ram_mb: system.total_memory() / (1024 * 1024),
                total_processor_count: num_cpus(),
            };

            let request = AttachCompletedRequest {
                invocation_id: Some(this.invocation_id.clone().into()),
                worker_id: this.worker_id.load(Ordering::SeqCst),
                info: Some(AttachCompletionInfo {
                    available_slots: this.pip_slots,
                    cache_validation_hash: Some(this.executor.cache_validation_hash().into()),
                    resources: Some(resources),
                }),
            };

            let result = this
                .client
                .call("AttachCompleted", None, &this.shutdown, move |client| {
                    let request = request.clone();
                    Box::pin(async move {
                        client
                            .attach_completed(request)
                            .await
                            .map(|response| response.into_inner())
                    })
                })
                .await;

            if !result.is_succeeded() {
                warn!("failed to report AttachCompleted, exiting");
                this.shutdown.cancel();
            }
        });
    }

    /// Orderly exit: the log target stops accepting events (its remainder
    /// is flushed), the sender drains, then the worker-global cancellation
    /// fires.
    pub fn begin_exit(self: Arc<Self>) {
        let this = self;
        tokio::spawn(async move {
            info!("draining before exit");
            this.log_target.deactivate();
            if !this.notifications.drain(this.drain_timeout).await {
                warn!("notification drain timed out");
            }
            this.shutdown.cancel();
        });
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// The worker side of the distributed build: a gRPC server for the
/// orchestrator's calls plus the outbound notification machinery.
pub struct WorkerService {
    config: WorkerConfig,
    runtime: Arc<WorkerRuntime>,
}

impl WorkerService {
    pub fn new(config: WorkerConfig, executor: Arc<dyn PipExecutor>) -> Self {
        let invocation_id = InvocationId::new(
            config.session_id,
            &config.environment,
            &config.engine_version,
        );

        let shutdown = CancellationToken::new();
        let worker_id = Arc::new(AtomicU32::new(config.requested_worker_id));

        let client: Arc<OrchestratorClient> = Arc::new(GrpcClient::new(
            "orchestrator-service",
            OrchestratorServiceClient::new,
            config.orchestrator.uri(),
            GrpcClientConfig {
                retries: config.unary_retries.clone(),
                connect_timeout: config.orchestrator.connect_timeout,
            },
        ));

        let (flush_sender, flush_receiver) = mpsc::unbounded_channel();
        let log_target = Arc::new(NotifyExecutionLogTarget::new(
            config.flush_threshold,
            flush_sender,
        ));

        let notifications = WorkerNotificationManager::start(
            client.clone(),
            invocation_id.clone(),
            worker_id.clone(),
            NotificationConfig {
                max_batch_size: config.max_batch_size,
                send_interval: config.send_interval,
                streaming_retries: config.streaming_retries.clone(),
            },
            flush_receiver,
            shutdown.clone(),
        );

        let event_bus = EventBus::new();
        start_forwarding_listener(&event_bus, notifications.events_sender(), shutdown.clone());

        let runtime = Arc::new(WorkerRuntime {
            invocation_id,
            worker_id,
            client,
            notifications,
            log_target,
            event_bus,
            executor,
            serializer: Arc::new(PipResultSerializer::new()),
            shutdown,
            drain_timeout: config.drain_timeout,
            pip_slots: config.pip_slots,
            attached: AtomicBool::new(false),
        });

        Self { config, runtime }
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.runtime.invocation_id
    }

    /// Starts the gRPC server, announces this worker to the orchestrator
    /// and begins periodic perf reporting.
    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let api = WorkerGrpcApi::new(self.runtime.clone());
        let grpc_port = grpcapi::start_grpc_server(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.grpc_port).into(),
            api,
            join_set,
        )
        .await?;

        let location = ServiceLocation::new(&self.config.announced_host, grpc_port);
        match self.say_hello(location.clone()).await? {
            HelloOutcome::Assigned(worker_id) => {
                self.runtime.worker_id.store(worker_id.0, Ordering::SeqCst);
                info!(worker = %worker_id, %location, "announced to orchestrator");
                self.start_perf_reporting();
            }
            HelloOutcome::NoSlots => {
                info!("orchestrator has no free worker slots, exiting");
                self.runtime.shutdown.cancel();
            }
            HelloOutcome::Released => {
                info!("worker slot was already released, exiting without attaching");
                self.runtime.shutdown.cancel();
            }
        }

        Ok(RunDetails { grpc_port })
    }

    async fn say_hello(&self, location: ServiceLocation) -> Result<HelloOutcome, anyhow::Error> {
        let request = HelloRequest {
            invocation_id: Some(self.runtime.invocation_id.clone().into()),
            location: Some(location.into()),
            requested_worker_id: self.config.requested_worker_id,
        };

        let result = self
            .runtime
            .client
            .call("Hello", None, &self.runtime.shutdown, move |client| {
                let request = request.clone();
                Box::pin(async move {
                    client.hello(request).await.map(|response| response.into_inner())
                })
            })
            .await;

        if !result.is_succeeded() {
            anyhow::bail!("Hello failed: {}", result.last_failure());
        }

        match result.into_value().result {
            Some(hello_response::Result::Success(success)) => {
                Ok(HelloOutcome::Assigned(WorkerId(success.worker_id)))
            }
            Some(hello_response::Result::NoSlots(_)) => Ok(HelloOutcome::NoSlots),
            Some(hello_response::Result::Released(_)) => Ok(HelloOutcome::Released),
            None => anyhow::bail!("Hello response carried no result"),
        }
    }

    fn start_perf_reporting(&self) {
        let runtime = self.runtime.clone();
        let interval = self.config.perf_report_interval;
        tokio::spawn(async move {
            let mut system = System::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = runtime.shutdown.cancelled() => break,
                }

                system.refresh_memory();
                system.refresh_cpu_usage();
                let perf_info = WorkerPerfInfo {
                    cpu_usage_percent: system.global_cpu_usage() as f64,
                    available_ram_mb: system.available_memory() / (1024 * 1024),
                    used_ram_mb: system.used_memory() / (1024 * 1024),
                    executing_pip_count: 0,
                };

                let request = ReportWorkerPerfInfoRequest {
                    invocation_id: Some(runtime.invocation_id.clone().into()),
                    worker_id: runtime.worker_id.load(Ordering::SeqCst),
                    perf_info: Some(perf_info),
                };

                let result = runtime
                    .client
                    .call("ReportWorkerPerfInfo", None, &runtime.shutdown, move |client| {
                        let request = request.clone();
                        Box::pin(async move {
                            client
                                .report_worker_perf_info(request)
                                .await
                                .map(|response| response.into_inner())
                        })
                    })
                    .await;

                if !result.is_succeeded() && !result.is_cancelled() {
                    debug!("perf report failed: {}", result.last_failure());
                }
            }
        });
    }

    /// Blocks until the worker-global cancellation fires, then closes the
    /// outbound channel.
    pub async fn wait_for_shutdown(&self) {
        self.runtime.shutdown.cancelled().await;
        self.runtime.client.close().await;
        info!("worker shut down");
    }
}

enum HelloOutcome {
    Assigned(WorkerId),
    NoSlots,
    Released,
}
