//! FetchExecutor: sequence bookkeeping for one resource's request stream.
//!
//! No transport-level cancellation is assumed. A response is applied only if
//! its sequence is the newest issued; everything else is dropped silently.

#![forbid(unsafe_code)]

use tabula_core::{FetchMode, QuerySpec};

#[derive(Debug, Clone, PartialEq)]
pub struct RequestHandle {
    pub seq: u64,
    pub mode: FetchMode,
    pub query: QuerySpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Current,
    Superseded { newest: u64 },
}

#[derive(Debug, Default)]
pub struct FetchExecutor {
    issued: u64,
    served: u64,
    pending: Option<(u64, FetchMode)>,
}

impl FetchExecutor {
    pub fn new() -> Self { Self::default() }

    pub fn issue(&mut self, query: QuerySpec, mode: FetchMode) -> RequestHandle {
        self.issued += 1;
        self.pending = Some((self.issued, mode));
        RequestHandle { seq: self.issued, mode, query }
    }

    /// Settle a response. Only the newest issued sequence is `Current`; on
    /// acceptance it becomes `last_served` and nothing is pending any more.
    pub fn complete(&mut self, seq: u64) -> Acceptance {
        if seq != self.issued {
            return Acceptance::Superseded { newest: self.issued };
        }
        self.served = seq;
        self.pending = None;
        Acceptance::Current
    }

    /// Invalidate everything in flight (view torn down).
    pub fn invalidate(&mut self) {
        self.issued += 1;
        self.pending = None;
    }

    pub fn issued(&self) -> u64 { self.issued }
    pub fn last_served(&self) -> u64 { self.served }

    /// Mode of the newest request if it has not been answered yet.
    pub fn in_flight(&self) -> Option<FetchMode> { self.pending.map(|(_, m)| m) }
}
