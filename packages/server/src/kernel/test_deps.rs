//! Fully in-memory dependency wiring for tests.
//!
//! Same component graph as production, with every trait bound to its
//! in-memory implementation and the upstream instance replaced by the
//! scripted mock.

use std::sync::Arc;

use crate::domains::sync::conflict::{ConflictPolicy, ConflictResolver};
use crate::domains::sync::engine::{SyncConfig, SyncEngine};
use crate::domains::sync::source::MockTicketSource;
use crate::domains::sync::store::MemoryTicketStore;
use crate::kernel::changelog::MemoryChangeLog;
use crate::kernel::deps::ServerDeps;
use crate::kernel::jobs::{CancelRegistry, JobQueue, MemoryJobQueue, QueueEvents};
use crate::kernel::pipeline::MetricsRecorder;
use crate::kernel::scheduler::{MemoryScheduleStore, Scheduler};
use crate::kernel::stream_hub::StreamHub;

/// In-memory dependency graph with handles onto the scripted parts.
pub struct TestHarness {
    pub deps: Arc<ServerDeps>,
    pub queue: Arc<dyn JobQueue>,
    pub source: Arc<MockTicketSource>,
    pub store: Arc<MemoryTicketStore>,
    pub change_log: Arc<MemoryChangeLog>,
    pub schedule_store: Arc<MemoryScheduleStore>,
}

/// Build the full in-memory graph with the default conflict policy.
pub fn harness() -> TestHarness {
    harness_with_policy(ConflictPolicy::NewestWins)
}

pub fn harness_with_policy(policy: ConflictPolicy) -> TestHarness {
    let events = QueueEvents::default();
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::with_events(events.clone()));
    let source = Arc::new(MockTicketSource::new());
    let store = Arc::new(MemoryTicketStore::new());
    let change_log = Arc::new(MemoryChangeLog::new());
    let schedule_store = Arc::new(MemoryScheduleStore::new());

    let sync_config = SyncConfig {
        batch_delay: std::time::Duration::ZERO,
        table_delay: std::time::Duration::ZERO,
        ..Default::default()
    };
    let sync = Arc::new(SyncEngine::new(
        source.clone(),
        store.clone(),
        change_log.clone(),
        ConflictResolver::new(policy),
        sync_config,
    ));
    let scheduler = Arc::new(Scheduler::new(schedule_store.clone(), queue.clone()));

    let deps = Arc::new(ServerDeps::new(
        queue.clone(),
        events,
        change_log.clone(),
        store.clone(),
        source.clone(),
        sync,
        scheduler,
        Arc::new(CancelRegistry::new()),
        StreamHub::new(),
        Arc::new(MetricsRecorder::new()),
    ));

    TestHarness {
        deps,
        queue,
        source,
        store,
        change_log,
        schedule_store,
    }
}

/// Shortcut when only the dependency struct is needed.
pub fn memory_deps() -> Arc<ServerDeps> {
    harness().deps
}
