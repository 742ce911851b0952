//! Tabula core types shared by the source, store and ops crates.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod mutation;
pub mod query;

pub use config::EngineConfig;
pub use error::ErrorKind;
pub use mutation::{BulkFailure, BulkReport, MutationKind, MutationRequest, WriteResult};
pub use query::{Direction, FetchMode, FilterValue, Filters, QuerySpec, SortSpec};

pub mod prelude {
    pub use super::{
        BulkFailure, BulkReport, Direction, ErrorKind, FetchMode, FilterValue, Filters, Identified,
        MutationKind, MutationRequest, PageResult, QuerySpec, ResourceName, SortSpec, Stats,
        WriteResult,
    };
}

/// Name of a server-paginated collection (e.g. `subscriptions`, `pending`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(Cow<'static, str>);

impl ResourceName {
    pub const SUBSCRIPTIONS: ResourceName = ResourceName(Cow::Borrowed("subscriptions"));
    pub const PENDING: ResourceName = ResourceName(Cow::Borrowed("pending"));
    pub const LEGACY: ResourceName = ResourceName(Cow::Borrowed("legacy"));
    pub const USERS: ResourceName = ResourceName(Cow::Borrowed("users"));
    pub const AUDIT_LOG: ResourceName = ResourceName(Cow::Borrowed("audit_log"));
    pub const KNOWLEDGE_BASE: ResourceName = ResourceName(Cow::Borrowed("knowledge_base"));

    pub const fn from_static(name: &'static str) -> Self { Self(Cow::Borrowed(name)) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for ResourceName {
    fn from(v: String) -> Self { Self(Cow::Owned(v)) }
}

impl From<&str> for ResourceName {
    fn from(v: &str) -> Self { Self(Cow::Owned(v.to_string())) }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Items materialized by a view must expose a stable unique identity.
pub trait Identified {
    type Id: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    fn id(&self) -> Self::Id;
}

/// Raw server response for one QuerySpec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<I> {
    /// Server-defined order, preserved as received.
    pub items: Vec<I>,
    /// Authoritative total for the current filter/search combination.
    pub total_count: u64,
    pub server_page: u32,
    pub server_page_size: u32,
}

/// Pagination-independent counters keyed by name (`pending`, `total_all`, ...).
pub type Stats = BTreeMap<String, u64>;
