//! Runtime knobs read from `TABULA_*` environment variables.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_NOTICE_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub page_size: u32,
    pub debounce_ms: u64,
    pub notice_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, debounce_ms: DEFAULT_DEBOUNCE_MS, notice_cap: DEFAULT_NOTICE_CAP }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            page_size: parse_positive(&get, "TABULA_PAGE_SIZE", d.page_size),
            debounce_ms: parse_or(&get, "TABULA_DEBOUNCE_MS", d.debounce_ms),
            notice_cap: parse_positive(&get, "TABULA_NOTICE_CAP", d.notice_cap),
        }
    }

    pub fn debounce(&self) -> Duration { Duration::from_millis(self.debounce_ms) }
}

fn parse_or<T: std::str::FromStr + Copy>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "invalid config value; using default");
                default
            }
        },
    }
}

fn parse_positive<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + PartialOrd + Default,
{
    let v = parse_or(get, key, default);
    if v > T::default() { v } else {
        warn!(key, "config value must be positive; using default");
        default
    }
}
