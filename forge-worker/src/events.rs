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

use crate::metrics::record_dropped_event;
use forge_api_grpc::proto::forge::common::EventLevel as ProtoEventLevel;
use forge_api_grpc::proto::forge::orchestrator::v1::{EventMessage, PipProcessEventFields};
use forge_common::model::{is_forwardable_event, EventLevel};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One event on the worker's in-process log bus.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: EventLevel,
    pub event_id: i32,
    pub event_name: String,
    pub event_keywords: i64,
    pub text: String,
    /// Structured payload of a pip process error/warning; forwarded
    /// bit-exact when present.
    pub pip_process_event: Option<PipProcessEventFields>,
}

impl LogEvent {
    pub fn new(level: EventLevel, event_id: i32, event_name: &str, text: &str) -> Self {
        Self {
            level,
            event_id,
            event_name: event_name.to_string(),
            event_keywords: 0,
            text: text.to_string(),
            pip_process_event: None,
        }
    }

    pub fn with_keywords(mut self, keywords: i64) -> Self {
        self.event_keywords = keywords;
        self
    }

    pub fn with_pip_process_event(mut self, fields: PipProcessEventFields) -> Self {
        self.pip_process_event = Some(fields);
        self
    }
}

/// In-process event bus the worker's subsystems publish log events to.
pub struct EventBus {
    sender: broadcast::Sender<LogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn publish(&self, event: LogEvent) {
        // No subscribers is fine; events are fire and forget.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribes to the event bus and repackages forwardable errors and
/// warnings as `EventMessage`s for the notification sender.
///
/// Message ids are monotonic per worker. Lagged or undeliverable events are
/// counted and dropped; a listener failure never reaches the RPC loop.
pub fn start_forwarding_listener(
    bus: &EventBus,
    sink: mpsc::UnboundedSender<EventMessage>,
    cancellation: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    let next_id = AtomicI32::new(0);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = receiver.recv() => event,
                _ = cancellation.cancelled() => break,
            };

            match event {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "forwarding listener lagged behind the event bus");
                    for _ in 0..skipped {
                        record_dropped_event();
                    }
                }
                Ok(event) => {
                    if !is_forwardable_event(event.level, event.event_keywords, event.event_id) {
                        continue;
                    }
                    let message = EventMessage {
                        id: next_id.fetch_add(1, Ordering::SeqCst),
                        level: ProtoEventLevel::from(event.level) as i32,
                        event_id: event.event_id,
                        event_name: event.event_name,
                        event_keywords: event.event_keywords,
                        text: event.text,
                        pip_process_event: event.pip_process_event,
                    };
                    if sink.send(message).is_err() {
                        record_dropped_event();
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use forge_common::model::{
        EVENT_KEYWORD_DISTRIBUTION_RPC, EVENT_KEYWORD_NOT_FORWARDABLE,
    };

    async fn collect_forwarded(events: Vec<LogEvent>) -> Vec<EventMessage> {
        let bus = EventBus::new();
        let (sink, mut received) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        let handle = start_forwarding_listener(&bus, sink, cancellation.clone());

        // Subscription exists before publishing, events cannot be missed.
        for event in events {
            bus.publish(event);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancellation.cancel();
        let _ = handle.await;

        let mut collected = Vec::new();
        while let Ok(message) = received.try_recv() {
            collected.push(message);
        }
        collected
    }

    #[test]
    async fn only_errors_and_warnings_are_forwarded() {
        let forwarded = collect_forwarded(vec![
            LogEvent::new(EventLevel::Error, 100, "PipFailed", "boom"),
            LogEvent::new(EventLevel::Info, 101, "Progress", "50%"),
            LogEvent::new(EventLevel::Verbose, 102, "Detail", "noise"),
            LogEvent::new(EventLevel::Warning, 103, "PipSlow", "slow"),
        ])
        .await;

        assert_eq!(
            forwarded.iter().map(|m| m.event_id).collect::<Vec<_>>(),
            vec![100, 103]
        );
    }

    #[test]
    async fn not_forwardable_keywords_never_reach_the_wire() {
        let forwarded = collect_forwarded(vec![
            LogEvent::new(EventLevel::Error, 100, "Internal", "secret")
                .with_keywords(EVENT_KEYWORD_NOT_FORWARDABLE),
            LogEvent::new(EventLevel::Error, 101, "RpcFailure", "feedback loop")
                .with_keywords(EVENT_KEYWORD_DISTRIBUTION_RPC),
            LogEvent::new(EventLevel::Error, 102, "PipFailed", "real"),
        ])
        .await;

        assert_eq!(
            forwarded.iter().map(|m| m.event_id).collect::<Vec<_>>(),
            vec![102]
        );
    }

    #[test]
    async fn message_ids_are_monotonic() {
        let forwarded = collect_forwarded(vec![
            LogEvent::new(EventLevel::Error, 100, "A", "a"),
            LogEvent::new(EventLevel::Error, 100, "B", "b"),
            LogEvent::new(EventLevel::Warning, 100, "C", "c"),
        ])
        .await;

        assert_eq!(forwarded.iter().map(|m| m.id).collect::<Vec<_>>(), vec![
            0, 1, 2
        ]);
    }

    #[test]
    async fn pip_process_event_fields_are_preserved() {
        let fields = PipProcessEventFields {
            pip_semi_stable_hash: 0x1234,
            pip_description: "compile foo.c".to_string(),
            spec_path: "src/build.dsc".to_string(),
            working_directory: "/work".to_string(),
            executable: "cc".to_string(),
            output: "error: oops".to_string(),
            paths_to_log: "/logs/foo".to_string(),
            exit_code: 1,
            optional_message: "".to_string(),
            short_description: "foo.c".to_string(),
            pip_execution_time_ms: 250,
        };

        let forwarded = collect_forwarded(vec![LogEvent::new(
            EventLevel::Error,
            200,
            "PipProcessError",
            "",
        )
        .with_pip_process_event(fields.clone())])
        .await;

        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].pip_process_event.as_ref().unwrap(), &fields);
    }
}
