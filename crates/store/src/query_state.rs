//! QueryState: turns raw UI input into QuerySpecs.
//!
//! Search keystrokes only update the raw text and push a deadline out; a new
//! spec is emitted once input has been quiet for the debounce window. Any
//! other change folds the pending text in immediately and cancels the timer,
//! so one burst of edits yields exactly one spec.

#![forbid(unsafe_code)]

use std::time::Duration;

use tabula_core::{FilterValue, Filters, QuerySpec, SortSpec};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct QueryState {
    current: QuerySpec,
    raw_search: String,
    deadline: Option<Instant>,
    debounce: Duration,
}

impl QueryState {
    pub fn new(initial: QuerySpec, debounce: Duration) -> Self {
        let raw_search = initial.search().unwrap_or_default().to_string();
        Self { current: initial, raw_search, deadline: None, debounce }
    }

    /// Last emitted spec.
    pub fn current(&self) -> &QuerySpec { &self.current }
    pub fn raw_search(&self) -> &str { &self.raw_search }
    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn type_search(&mut self, text: &str, now: Instant) {
        self.raw_search = text.to_string();
        self.deadline = Some(now + self.debounce);
    }

    /// Emit the debounced search once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<QuerySpec> {
        match self.deadline {
            Some(d) if now >= d => self.flush(),
            _ => None,
        }
    }

    /// Commit pending search text right away (e.g. Enter pressed).
    pub fn flush(&mut self) -> Option<QuerySpec> {
        self.deadline = None;
        let next = self.current.with_search(Some(&self.raw_search));
        self.emit(next)
    }

    pub fn set_filter(&mut self, key: &str, value: Option<FilterValue>) -> Option<QuerySpec> {
        let next = self.folded().with_filter(key, value);
        self.emit(next)
    }

    pub fn set_filters(&mut self, filters: Filters) -> Option<QuerySpec> {
        let next = self.folded().with_filters(filters);
        self.emit(next)
    }

    /// Clicking the sorted column flips direction; another column sorts ascending.
    pub fn toggle_sort(&mut self, field: &str) -> Option<QuerySpec> {
        let sort = match self.current.sort() {
            Some(s) if s.field == field => SortSpec { field: s.field.clone(), direction: s.direction.flip() },
            _ => SortSpec::asc(field),
        };
        let next = self.folded().with_sort(Some(sort));
        self.emit(next)
    }

    pub fn set_page_size(&mut self, page_size: u32) -> Option<QuerySpec> {
        let next = self.folded().with_page_size(page_size);
        self.emit(next)
    }

    /// Drop filters and search in one spec.
    pub fn clear_filters(&mut self) -> Option<QuerySpec> {
        self.raw_search.clear();
        self.deadline = None;
        let next = self.current.cleared();
        self.emit(next)
    }

    fn folded(&mut self) -> QuerySpec {
        self.deadline = None;
        self.current.with_search(Some(&self.raw_search))
    }

    /// Only a spec that differs from the current one is worth a fetch.
    fn emit(&mut self, next: QuerySpec) -> Option<QuerySpec> {
        if next == self.current { return None; }
        self.current = next.clone();
        Some(next)
    }
}
