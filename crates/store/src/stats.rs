//! Derived counters (badge counts) fetched independently of the list.

#![forbid(unsafe_code)]

use serde::Serialize;
use tabula_core::{ErrorKind, Stats};

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatsState {
    pub counters: Stats,
    pub loading: bool,
    pub error: Option<ErrorKind>,
    /// Bumped on every applied refresh; 0 means never loaded.
    pub generation: u64,
}

impl StatsState {
    pub fn get(&self, key: &str) -> Option<u64> { self.counters.get(key).copied() }

    pub fn is_loaded(&self) -> bool { self.generation > 0 }
}
