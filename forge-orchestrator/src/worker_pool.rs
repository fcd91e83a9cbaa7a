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

use crate::remote_worker::{RemoteWorker, RemoteWorkerConfig};
use crate::scheduler::{ExecutionLogSink, Scheduler};
use forge_common::model::{ServiceLocation, WorkerId, WorkerNodeStatus};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloResult {
    Ok(WorkerId),
    NoSlots,
    Released,
}

/// The orchestrator's fixed array of remote worker slots, worker ids 1..=N.
///
/// A single mutex serializes `hello` and release decisions; lookups by id
/// are plain array indexing and take no lock.
pub struct WorkerPool {
    slots: Vec<Arc<RemoteWorker>>,
    hello_lock: Mutex<()>,
}

impl WorkerPool {
    pub fn new(
        count: u32,
        config: RemoteWorkerConfig,
        scheduler: Arc<dyn Scheduler>,
        log_sink_factory: impl Fn(WorkerId) -> Arc<dyn ExecutionLogSink>,
    ) -> Self {
        let slots = (1..=count)
            .map(|id| {
                let worker_id = WorkerId(id);
                RemoteWorker::new(
                    worker_id,
                    config.clone(),
                    scheduler.clone(),
                    log_sink_factory(worker_id),
                )
            })
            .collect();
        Self {
            slots,
            hello_lock: Mutex::new(()),
        }
    }

    pub fn worker_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<&Arc<RemoteWorker>> {
        if worker_id.is_remote() {
            self.slots.get((worker_id.0 - 1) as usize)
        } else {
            None
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<RemoteWorker>> {
        self.slots.iter()
    }

    /// Slot assignment for a dynamically announced worker.
    ///
    /// Idempotent for a re-announcing worker: the slot already holding this
    /// location is confirmed with `Ok`. A requested id beyond the pool or
    /// already taken yields `NoSlots`; a slot that was stopped before the
    /// worker arrived yields `Released` so the worker exits without
    /// attaching.
    pub fn hello(&self, location: ServiceLocation, requested_id: u32) -> HelloResult {
        let _guard = self.hello_lock.lock().unwrap();

        if let Some(existing) = self
            .slots
            .iter()
            .find(|slot| slot.location().as_ref() == Some(&location))
        {
            return self.confirm(existing, location);
        }

        let slot = if requested_id != 0 {
            match self.worker(WorkerId(requested_id)) {
                None => return HelloResult::NoSlots,
                Some(slot) if slot.location().is_some() => return HelloResult::NoSlots,
                Some(slot) => slot,
            }
        } else {
            match self.slots.iter().find(|slot| slot.location().is_none()) {
                None => return HelloResult::NoSlots,
                Some(slot) => slot,
            }
        };

        if slot.status().is_stopping_or_stopped() {
            return HelloResult::Released;
        }

        match slot.clone().set_location(location.clone()) {
            Ok(()) => {
                info!(worker = %slot.worker_id(), %location, "worker announced");
                HelloResult::Ok(slot.worker_id())
            }
            Err(_) => HelloResult::NoSlots,
        }
    }

    fn confirm(&self, slot: &Arc<RemoteWorker>, location: ServiceLocation) -> HelloResult {
        if slot.status().is_stopping_or_stopped() {
            HelloResult::Released
        } else {
            info!(worker = %slot.worker_id(), %location, "worker re-announced");
            HelloResult::Ok(slot.worker_id())
        }
    }

    /// Marks a slot releasable before any worker announced for it, or after
    /// the slot quiesced. A slot still holding in-flight pips is refused:
    /// the scheduler must stop dispatching and drain it first.
    pub fn try_release_worker(&self, worker_id: WorkerId) -> Result<(), String> {
        let _guard = self.hello_lock.lock().unwrap();

        let slot = self
            .worker(worker_id)
            .ok_or_else(|| format!("unknown worker id {worker_id}"))?;

        if slot.has_in_flight_pips() {
            return Err(format!(
                "{worker_id} still has in-flight pips, drain it before releasing"
            ));
        }

        match slot.status() {
            WorkerNodeStatus::Attached => Err(format!(
                "{worker_id} is attached, use Exit to stop it before releasing"
            )),
            _ => {
                slot.mark_released();
                info!(worker = %worker_id, "slot released");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::scheduler::tests_support::{NullScheduler, NullSink};
    use forge_common::config::RetryConfig;
    use forge_common::model::InvocationId;
    use std::time::Duration;
    use uuid::Uuid;

    fn pool(count: u32) -> WorkerPool {
        let config = RemoteWorkerConfig {
            invocation_id: InvocationId::new(Uuid::new_v4(), "test", "0.0.0"),
            unary_retries: RetryConfig::default(),
            connect_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(100),
            attach_timeout: Duration::from_secs(1),
            expected_cache_validation_hash: None,
        };
        WorkerPool::new(count, config, NullScheduler::new(), |_| NullSink::new())
    }

    fn location(port: u16) -> ServiceLocation {
        ServiceLocation::new("10.0.0.1", port)
    }

    #[test]
    async fn hello_assigns_first_free_slot() {
        let pool = pool(2);
        assert_eq!(
            pool.hello(location(4001), 0),
            HelloResult::Ok(WorkerId(1))
        );
        assert_eq!(
            pool.hello(location(4002), 0),
            HelloResult::Ok(WorkerId(2))
        );
        assert_eq!(pool.hello(location(4003), 0), HelloResult::NoSlots);
    }

    #[test]
    async fn hello_is_idempotent_per_location() {
        let pool = pool(2);
        assert_eq!(
            pool.hello(location(4001), 0),
            HelloResult::Ok(WorkerId(1))
        );
        assert_eq!(
            pool.hello(location(4001), 0),
            HelloResult::Ok(WorkerId(1))
        );
        // The second slot is still free.
        assert_eq!(
            pool.hello(location(4002), 0),
            HelloResult::Ok(WorkerId(2))
        );
    }

    #[test]
    async fn hello_respects_requested_id() {
        let pool = pool(3);
        assert_eq!(
            pool.hello(location(4001), 2),
            HelloResult::Ok(WorkerId(2))
        );
        // Same slot requested again by a different worker.
        assert_eq!(pool.hello(location(4002), 2), HelloResult::NoSlots);
        // Beyond the pool.
        assert_eq!(pool.hello(location(4003), 4), HelloResult::NoSlots);
        // Dynamic announce takes the earliest free slot.
        assert_eq!(
            pool.hello(location(4004), 0),
            HelloResult::Ok(WorkerId(1))
        );
    }

    #[test]
    async fn hello_for_released_slot_tells_the_worker_to_exit() {
        let pool = pool(2);
        pool.try_release_worker(WorkerId(1)).unwrap();
        assert_eq!(pool.hello(location(4001), 1), HelloResult::Released);
    }

    #[test]
    async fn release_requires_quiesced_slot() {
        let pool = pool(1);
        assert!(pool.try_release_worker(WorkerId(1)).is_ok());
        assert!(pool.try_release_worker(WorkerId(9)).is_err());
    }
}
