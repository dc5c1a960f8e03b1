//! fleetsync synchronization services
//!
//! This module provides everything that runs on top of the storage layer:
//! - Sync journal: append-only audit log of sync activity
//! - Transactional outbox drained into live broadcast
//! - Conflict detection, recording and resolution
//! - Sync manager: periodic passes on disconnected nodes
//! - Retention pruning and materialized view refresh
//! - The platform composition root

pub mod conflict;
pub mod engine;
pub mod journal;
pub mod outbox;
pub mod platform;
pub mod retention;
pub mod state;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use conflict::{
    Conflict, ConflictDetector, ConflictLog, ConflictResolver, ConflictType, RecordSnapshot,
    Resolution, ResolutionStrategy, ResolutionSummary, Side,
};
pub use engine::{SyncConfig, SyncManager, SyncRunResult};
pub use journal::{Journal, JournalEntry, JournalStatus, NewJournalEntry};
pub use outbox::{Broadcaster, ChannelBroadcaster, DrainReport, LogBroadcaster, Outbox, OutboxEvent};
pub use platform::{Platform, PlatformConfig, PlatformStatus};
pub use retention::{
    ClassOutcome, DataClass, PruneRunResult, PruningService, RetentionConfig, RetentionTarget,
};
pub use state::{SyncLifecycle, SyncState};
pub use views::{ViewOutcome, ViewRefreshConfig, ViewRefreshReport, ViewRefreshScheduler};
