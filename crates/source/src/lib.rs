//! Tabula data sources: the contract the sync engine expects from its backend.
//!
//! The engine never talks to a REST API directly. It needs three capabilities:
//! fetch one page, fetch cheap aggregate stats, and perform a write. Anything
//! that can do those (an HTTP client, the in-memory backend below, a test
//! double) plugs in through [`DataSource`] and [`MutationSink`].

#![forbid(unsafe_code)]

use tabula_core::{ErrorKind, Filters, MutationRequest, PageResult, QuerySpec, ResourceName, Stats, WriteResult};

pub mod json;
pub mod memory;
pub mod shape;

pub use json::{Endpoint, JsonSource, MutationRoute, Transport};
pub use memory::{MemoryBackend, Record, RecordId};
pub use shape::ResponseShape;

pub type SourceResult<T> = Result<T, ErrorKind>;

/// Read side of a backend, for items of type `I`.
#[async_trait::async_trait]
pub trait DataSource<I>: Send + Sync {
    /// Must honor page, page size, search, filters and a single sort, and return
    /// a `total_count` for the current filter/search combination.
    async fn fetch_page(&self, resource: &ResourceName, query: &QuerySpec) -> SourceResult<PageResult<I>>;

    /// Aggregate counters, independent of pagination.
    async fn fetch_stats(&self, resource: &ResourceName, filters: Option<&Filters>) -> SourceResult<Stats>;
}

/// Write side of a backend.
#[async_trait::async_trait]
pub trait MutationSink: Send + Sync {
    /// Bulk kinds answer with [`WriteResult::Bulk`]; single writes with `Applied`.
    async fn mutate(&self, request: &MutationRequest) -> SourceResult<WriteResult>;
}
