//! Best-fit operation matching
//!
//! Consumers ask for a set of attributes, not for a specific operation.
//! The scheduler keeps one pool per operation flavor and picks the
//! schedulable candidate whose attribute set overlaps the request most.
//! Pools are sorted ascending by attribute-set size at construction, and
//! ties keep the earliest candidate, so the smallest sufficient operation
//! wins.

use crate::ops::Operation;
use crate::types::Attribute;
use std::sync::Arc;
use tracing::debug;

/// Matches attribute requests against pools of operations
pub struct Scheduler {
    get: Vec<Arc<dyn Operation>>,
    set: Vec<Arc<dyn Operation>>,
    periodic: Vec<Arc<dyn Operation>>,
    event: Vec<Arc<dyn Operation>>,
}

impl Scheduler {
    pub fn new(
        get: Vec<Arc<dyn Operation>>,
        set: Vec<Arc<dyn Operation>>,
        periodic: Vec<Arc<dyn Operation>>,
        event: Vec<Arc<dyn Operation>>,
    ) -> Self {
        Self {
            get: presort(get),
            set: presort(set),
            periodic: presort(periodic),
            event: presort(event),
        }
    }

    /// Best one-shot read operation for `attributes`
    pub fn get(&self, attributes: &[Attribute], strict: bool) -> Option<Arc<dyn Operation>> {
        best_fit(&self.get, attributes, strict)
    }

    /// Best write operation for `attributes`
    pub fn set(&self, attributes: &[Attribute], strict: bool) -> Option<Arc<dyn Operation>> {
        best_fit(&self.set, attributes, strict)
    }

    /// Best periodic sampling operation for `attributes`
    pub fn periodic(&self, attributes: &[Attribute], strict: bool) -> Option<Arc<dyn Operation>> {
        best_fit(&self.periodic, attributes, strict)
    }

    /// Best event stream operation for `attributes`
    pub fn event(&self, attributes: &[Attribute], strict: bool) -> Option<Arc<dyn Operation>> {
        best_fit(&self.event, attributes, strict)
    }
}

fn presort(mut pool: Vec<Arc<dyn Operation>>) -> Vec<Arc<dyn Operation>> {
    // Stable, so insertion order breaks size ties.
    pool.sort_by_key(|op| op.attributes().len());
    pool
}

/// How many requested attributes the operation can produce
fn score(operation: &dyn Operation, requested: &[Attribute]) -> usize {
    requested
        .iter()
        .filter(|attr| operation.attributes().contains(attr))
        .count()
}

/// Pick the schedulable candidate with the strictly highest overlap.
///
/// No overlap at all means no match. In strict mode a winner that cannot
/// produce the full request is rejected rather than returned partially.
fn best_fit(
    pool: &[Arc<dyn Operation>],
    requested: &[Attribute],
    strict: bool,
) -> Option<Arc<dyn Operation>> {
    let mut best: Option<(&Arc<dyn Operation>, usize)> = None;
    for candidate in pool {
        if !candidate.schedulable() {
            continue;
        }
        let overlap = score(candidate.as_ref(), requested);
        if overlap > best.map(|(_, s)| s).unwrap_or(0) {
            best = Some((candidate, overlap));
        }
    }
    let (winner, overlap) = best?;
    if strict && overlap < requested.len() {
        debug!(operation = winner.id(), overlap, requested = requested.len(), "strict request not covered");
        return None;
    }
    Some(winner.clone())
}
