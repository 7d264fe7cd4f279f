//! Ticket synchronization domain: upstream source, local store, conflict
//! resolution, the sync engine, and the background job handlers.

pub mod conflict;
pub mod engine;
pub mod jobs;
pub mod models;
pub mod source;
pub mod store;

pub use conflict::{Conflict, ConflictPolicy, ConflictResolver};
pub use engine::{SyncConfig, SyncEngine, SyncMode, SyncResult};
pub use models::{RelatedSlaEntry, TicketEnvelope, TicketTable};
pub use source::{MockTicketSource, ServiceNowSource, TicketSource};
pub use store::{MemoryTicketStore, PostgresTicketStore, TicketStore};
