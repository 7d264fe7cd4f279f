//! Shared dependency set threaded to job handlers and HTTP routes.
//!
//! Constructed once at process start; no global state. Components are held
//! behind their traits so production (PostgreSQL + ServiceNow) and tests
//! (in-memory + scripted mock) wire the same struct.

use std::sync::Arc;

use crate::domains::sync::engine::SyncEngine;
use crate::domains::sync::source::TicketSource;
use crate::domains::sync::store::TicketStore;
use crate::kernel::changelog::ChangeLog;
use crate::kernel::jobs::{CancelRegistry, JobQueue, QueueEvents};
use crate::kernel::pipeline::MetricsRecorder;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::stream_hub::StreamHub;

#[derive(Clone)]
pub struct ServerDeps {
    pub job_queue: Arc<dyn JobQueue>,
    pub queue_events: QueueEvents,
    pub change_log: Arc<dyn ChangeLog>,
    pub ticket_store: Arc<dyn TicketStore>,
    pub ticket_source: Arc<dyn TicketSource>,
    pub sync: Arc<SyncEngine>,
    pub scheduler: Arc<Scheduler>,
    pub cancellations: Arc<CancelRegistry>,
    pub stream_hub: StreamHub,
    /// System-wide stream metrics fed to the performance event stream.
    pub pipeline_metrics: Arc<MetricsRecorder>,
}

impl ServerDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_queue: Arc<dyn JobQueue>,
        queue_events: QueueEvents,
        change_log: Arc<dyn ChangeLog>,
        ticket_store: Arc<dyn TicketStore>,
        ticket_source: Arc<dyn TicketSource>,
        sync: Arc<SyncEngine>,
        scheduler: Arc<Scheduler>,
        cancellations: Arc<CancelRegistry>,
        stream_hub: StreamHub,
        pipeline_metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            job_queue,
            queue_events,
            change_log,
            ticket_store,
            ticket_source,
            sync,
            scheduler,
            cancellations,
            stream_hub,
            pipeline_metrics,
        }
    }
}
