//! Tabula store: one controller per resource keeps a locally materialized,
//! filterable, load-more view of a server-paginated collection.
//!
//! Ordering within a resource is enforced only by request sequence numbers:
//! the newest issued request wins, older responses are dropped on arrival.

#![forbid(unsafe_code)]

pub mod controller;
pub mod debounce;
pub mod executor;
pub mod merge;
pub mod query_state;
pub mod stats;
pub mod view;

pub use controller::{FetchStatus, Refreshable, ViewController};
pub use debounce::{spawn_query_input, QueryInput, QueryInputHandle};
pub use executor::{Acceptance, FetchExecutor, RequestHandle};
pub use merge::{merge, merge_by, MergeOutcome};
pub use query_state::QueryState;
pub use stats::StatsState;
pub use view::ViewState;
