//! Preemption: evict lower-priority allocations to make room.
//!
//! Only allocations of other jobs whose priority is at least
//! [`PREEMPTION_PRIORITY_DELTA`] below the placing job are candidates.
//! Victims are taken lowest priority first (then by ID) until the ask fits.

use fleetgrid_state::{Allocation, Node, allocs_fit};
use tracing::debug;

/// Minimum priority gap between the placing job and its victims.
pub const PREEMPTION_PRIORITY_DELTA: u8 = 10;

/// Choose allocations on `node` to evict so that `ask` fits.
///
/// `current` holds the node's proposed non-terminal allocations. Returns
/// `None` when evicting every eligible victim still would not make room.
pub fn select_victims(
    node: &Node,
    current: &[&Allocation],
    ask: &Allocation,
    priority: u8,
) -> Option<Vec<Allocation>> {
    let mut victims: Vec<&Allocation> = current
        .iter()
        .copied()
        .filter(|a| {
            a.job_id != ask.job_id
                && a.job_priority.saturating_add(PREEMPTION_PRIORITY_DELTA) <= priority
        })
        .collect();
    if victims.is_empty() {
        return None;
    }
    victims.sort_by(|a, b| a.job_priority.cmp(&b.job_priority).then_with(|| a.id.cmp(&b.id)));

    let mut evicted: Vec<Allocation> = Vec::new();
    let mut remaining: Vec<&Allocation> = current.to_vec();
    for victim in victims {
        remaining.retain(|a| a.id != victim.id);
        evicted.push(victim.clone());

        let fit = allocs_fit(node, remaining.iter().copied().chain([ask]));
        if fit.fits {
            debug!(
                node = %node.id,
                evicted = evicted.len(),
                job = %ask.job_id,
                "preemption makes room"
            );
            return Some(evicted);
        }
    }
    None
}
