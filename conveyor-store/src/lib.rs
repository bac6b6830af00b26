//! The Conveyor persistent store.
//!
//! Consumers program against the narrow traits in [`store`]; the
//! [`memory::MemoryStore`] implementation is complete and backs tests and
//! single-node deployments, while [`postgres::PgStore`] backs multi-node
//! fleets. Leases are rows in the store, never in-process locks: they are
//! the only cross-process mutex in the system.

pub mod algorithm;
pub mod error;
pub mod memory;
pub mod page;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};

/// Trait imports for store consumers.
pub mod prelude {
    pub use crate::store::{
        BuildStore, ContainerStore, EventCursor, EventStore, Lease, LeaseStore, PipeStore,
        PipelineStore, Store, TeamStore, VersionStore, VolumeStore,
    };
}
pub use page::{Page, Pagination};
pub use store::{
    AbortNotifier, BoxLease, BuildStore, ContainerStore, EventCursor, EventStore,
    EventStreamError, Lease, LeaseStore, PausedState, PipeStore, PipelineStore, Store, TeamStore,
    VersionStore, VolumeStore,
};
