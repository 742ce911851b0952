#![forbid(unsafe_code)]

use serde::Serialize;
use tabula_core::{ErrorKind, QuerySpec};

/// Materialized view of one resource. Readers get it as an immutable snapshot;
/// only the owning controller produces new ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState<I> {
    /// Unique by identity, server order preserved across appends.
    pub items: Vec<I>,
    pub total_count: u64,
    pub loading: bool,
    pub loading_more: bool,
    pub error: Option<ErrorKind>,
    /// Query whose response produced `items`; None until the first page lands.
    pub last_applied_query: Option<QuerySpec>,
    pub last_sequence_served: u64,
}

impl<I> Default for ViewState<I> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
            loading: false,
            loading_more: false,
            error: None,
            last_applied_query: None,
            last_sequence_served: 0,
        }
    }
}

impl<I> ViewState<I> {
    pub fn empty() -> Self { Self::default() }

    /// Derived, never stored.
    pub fn has_more(&self) -> bool { (self.items.len() as u64) < self.total_count }

    pub fn is_busy(&self) -> bool { self.loading || self.loading_more }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}
