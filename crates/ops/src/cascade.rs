//! CascadeGraph: static table from mutation kind to the views it invalidates.

#![forbid(unsafe_code)]

use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use tabula_core::{MutationKind, ResourceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshScope {
    /// Reset fetch of the list; only for mounted views.
    List,
    /// Derived counters; always.
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RefreshTarget {
    pub resource: ResourceName,
    pub scope: RefreshScope,
}

impl RefreshTarget {
    pub fn list(resource: ResourceName) -> Self { Self { resource, scope: RefreshScope::List } }
    pub fn stats(resource: ResourceName) -> Self { Self { resource, scope: RefreshScope::Stats } }
}

impl fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            RefreshScope::List => "list",
            RefreshScope::Stats => "stats",
        };
        write!(f, "{} {}", self.resource, scope)
    }
}

/// How many rows a mutation kind addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arity {
    /// Needs `target`.
    One,
    /// Needs `{ "ids": [...] }` or `{ "all": true }`.
    Many,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeRule {
    /// Resource the write belongs to; its list is always re-fetched.
    pub owner: ResourceName,
    pub dependents: SmallVec<[RefreshTarget; 4]>,
    pub arity: Arity,
    /// Drop the target row from the owner's list right after the write.
    pub forget_target: bool,
}

impl CascadeRule {
    pub fn single(owner: ResourceName) -> Self {
        Self { owner, dependents: SmallVec::new(), arity: Arity::One, forget_target: false }
    }

    pub fn bulk(owner: ResourceName) -> Self {
        Self { arity: Arity::Many, ..Self::single(owner) }
    }

    pub fn refreshes(mut self, target: RefreshTarget) -> Self {
        self.dependents.push(target);
        self
    }

    pub fn forgetting_target(mut self) -> Self {
        self.forget_target = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CascadeGraph {
    rules: FxHashMap<MutationKind, CascadeRule>,
}

impl CascadeGraph {
    pub fn new() -> Self { Self::default() }

    pub fn rule(mut self, kind: MutationKind, rule: CascadeRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn get(&self, kind: &MutationKind) -> Option<&CascadeRule> { self.rules.get(kind) }

    pub fn kinds(&self) -> impl Iterator<Item = &MutationKind> { self.rules.keys() }

    /// Everything a successful `kind` write must refresh: the owner's list
    /// first, then each dependent once. Empty for unknown kinds.
    pub fn plan(&self, kind: &MutationKind) -> Vec<RefreshTarget> {
        let Some(rule) = self.rules.get(kind) else { return Vec::new() };
        let mut out = Vec::with_capacity(rule.dependents.len() + 1);
        out.push(RefreshTarget::list(rule.owner.clone()));
        for t in &rule.dependents {
            if !out.contains(t) { out.push(t.clone()); }
        }
        out
    }

    /// The console's write rules.
    pub fn console() -> Self {
        let pending_fanout = |rule: CascadeRule| {
            rule.refreshes(RefreshTarget::stats(ResourceName::PENDING))
                .refreshes(RefreshTarget::list(ResourceName::SUBSCRIPTIONS))
                .refreshes(RefreshTarget::stats(ResourceName::LEGACY))
        };
        Self::new()
            .rule(
                MutationKind::MARK_PENDING_COMPLETE,
                pending_fanout(CascadeRule::single(ResourceName::PENDING)).forgetting_target(),
            )
            .rule(MutationKind::BULK_PROCESS_PENDING, pending_fanout(CascadeRule::bulk(ResourceName::PENDING)))
            .rule(MutationKind::CANCEL_SUBSCRIPTION, CascadeRule::single(ResourceName::SUBSCRIPTIONS))
            .rule(
                MutationKind::PROCESS_LEGACY,
                CascadeRule::single(ResourceName::LEGACY)
                    .refreshes(RefreshTarget::stats(ResourceName::LEGACY))
                    .refreshes(RefreshTarget::list(ResourceName::SUBSCRIPTIONS)),
            )
            .rule(MutationKind::UPDATE_USER, CascadeRule::single(ResourceName::USERS))
            .rule(MutationKind::DELETE_USER, CascadeRule::single(ResourceName::USERS).forgetting_target())
            .rule(MutationKind::DELETE_KB_ENTRY, CascadeRule::single(ResourceName::KNOWLEDGE_BASE).forgetting_target())
    }
}
