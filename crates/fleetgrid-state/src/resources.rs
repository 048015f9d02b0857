//! Resource model: capacity, reservation, and consumption arithmetic.
//!
//! Nodes advertise total and reserved [`Resources`]; allocations carry
//! [`AllocatedResources`]. [`allocs_fit`] is the single source of truth for
//! "does this set of allocations fit on this node", shared by the placer and
//! the plan submission gate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::types::{Allocation, Node};

/// CPU, memory, disk, and network bandwidth quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// CPU shares (MHz).
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    /// Network bandwidth in megabits.
    #[serde(default)]
    pub mbits: u64,
}

impl Resources {
    pub const fn new(cpu: u64, memory_mb: u64, disk_mb: u64, mbits: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            disk_mb,
            mbits,
        }
    }

    /// Subtract `other`, clamping every dimension at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            mbits: self.mbits.saturating_sub(other.mbits),
        }
    }

    /// Check that `self` covers `other` in every dimension.
    ///
    /// Returns the first exhausted dimension in the order cpu, memory,
    /// disk, network.
    pub fn superset(&self, other: &Resources) -> Result<(), Dimension> {
        if other.cpu > self.cpu {
            return Err(Dimension::Cpu);
        }
        if other.memory_mb > self.memory_mb {
            return Err(Dimension::Memory);
        }
        if other.disk_mb > self.disk_mb {
            return Err(Dimension::Disk);
        }
        if other.mbits > self.mbits {
            return Err(Dimension::Bandwidth);
        }
        Ok(())
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, other: &Resources) {
        self.cpu += other.cpu;
        self.memory_mb += other.memory_mb;
        self.disk_mb += other.disk_mb;
        self.mbits += other.mbits;
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, other: Resources) -> Resources {
        self += &other;
        self
    }
}

/// A resource dimension that can be exhausted on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
    Bandwidth,
    Ports,
}

impl Dimension {
    /// Operator-facing label used as the key of `dimension_exhausted`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Disk => "disk",
            Dimension::Bandwidth => "network: bandwidth exceeded",
            Dimension::Ports => "network: reserved port collision",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources granted to a single allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedResources {
    /// Per-task cpu/memory grants.
    #[serde(default)]
    pub tasks: BTreeMap<String, Resources>,
    /// Group-level ephemeral disk.
    #[serde(default)]
    pub shared_disk_mb: u64,
    /// Group-level network bandwidth.
    #[serde(default)]
    pub shared_mbits: u64,
    /// Static host ports claimed by the allocation.
    #[serde(default)]
    pub ports: BTreeSet<u16>,
}

impl AllocatedResources {
    /// Flatten the per-task and shared grants into one comparable quantity.
    pub fn comparable(&self) -> Resources {
        let mut total = Resources::new(0, 0, self.shared_disk_mb, self.shared_mbits);
        for task in self.tasks.values() {
            total += task;
        }
        total
    }
}

/// Outcome of fitting a set of allocations onto a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitResult {
    pub fits: bool,
    /// The first dimension that overflowed, if any.
    pub dimension: Option<Dimension>,
    /// Sum of the allocations' comparable resources.
    pub used: Resources,
}

/// Check whether the given allocations fit on the node's unreserved capacity.
///
/// Terminal allocations are the caller's responsibility to filter out. Port
/// collisions between allocations, or with the node's reserved ports, are
/// reported as [`Dimension::Ports`].
pub fn allocs_fit<'a, I>(node: &Node, allocs: I) -> FitResult
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let mut used = Resources::default();
    let mut ports: BTreeSet<u16> = node.reserved_ports.clone();
    let mut port_collision = false;

    for alloc in allocs {
        used += &alloc.allocated.comparable();
        for port in &alloc.allocated.ports {
            if !ports.insert(*port) {
                port_collision = true;
            }
        }
    }

    if port_collision {
        return FitResult {
            fits: false,
            dimension: Some(Dimension::Ports),
            used,
        };
    }

    match node.available().superset(&used) {
        Ok(()) => FitResult {
            fits: true,
            dimension: None,
            used,
        },
        Err(dimension) => FitResult {
            fits: false,
            dimension: Some(dimension),
            used,
        },
    }
}

/// Best-fit score of a node given its projected usage. Range: 0.0..=1.0.
///
/// Fuller nodes score higher. The exponential form punishes leaving a
/// little free capacity on many nodes more than leaving a lot on one.
pub fn score_fit(node: &Node, used: &Resources) -> f64 {
    let available = node.available();
    let free_pct = |avail: u64, used: u64| {
        if avail == 0 {
            0.0
        } else {
            (1.0 - used as f64 / avail as f64).clamp(0.0, 1.0)
        }
    };

    let free_cpu = free_pct(available.cpu, used.cpu);
    let free_mem = free_pct(available.memory_mb, used.memory_mb);

    let total = 10f64.powf(free_cpu) + 10f64.powf(free_mem);
    (20.0 - total).clamp(0.0, 18.0) / 18.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn node(cpu: u64, mem: u64) -> Node {
        let mut n = Node::new("n1", "dc1");
        n.resources = Resources::new(cpu, mem, 10_000, 1000);
        n.reserved = Resources::new(100, 256, 0, 0);
        n
    }

    fn alloc(id: &str, cpu: u64, mem: u64) -> Allocation {
        let mut a = Allocation::new(id, "job", "web", 0, "n1");
        a.allocated.tasks.insert("web".to_string(), Resources::new(cpu, mem, 0, 0));
        a
    }

    #[test]
    fn superset_reports_first_exhausted_dimension() {
        let cap = Resources::new(1000, 1024, 100, 10);
        assert!(cap.superset(&Resources::new(1000, 1024, 100, 10)).is_ok());
        assert_eq!(cap.superset(&Resources::new(1001, 0, 0, 0)), Err(Dimension::Cpu));
        assert_eq!(cap.superset(&Resources::new(0, 2048, 0, 0)), Err(Dimension::Memory));
        assert_eq!(cap.superset(&Resources::new(0, 0, 101, 0)), Err(Dimension::Disk));
        assert_eq!(cap.superset(&Resources::new(0, 0, 0, 11)), Err(Dimension::Bandwidth));
    }

    #[test]
    fn comparable_sums_tasks_and_shared() {
        let mut res = AllocatedResources {
            shared_disk_mb: 150,
            shared_mbits: 10,
            ..Default::default()
        };
        res.tasks.insert("a".into(), Resources::new(500, 256, 0, 0));
        res.tasks.insert("b".into(), Resources::new(100, 64, 0, 0));

        assert_eq!(res.comparable(), Resources::new(600, 320, 150, 10));
    }

    #[test]
    fn fit_respects_reserved_capacity() {
        let n = node(1000, 1024);
        // 900 cpu is available after the 100 reserved.
        let ok = allocs_fit(&n, [&alloc("a", 900, 512)]);
        assert!(ok.fits);

        let over = allocs_fit(&n, [&alloc("a", 901, 512)]);
        assert!(!over.fits);
        assert_eq!(over.dimension, Some(Dimension::Cpu));
    }

    #[test]
    fn fit_detects_port_collisions() {
        let mut n = node(4000, 8192);
        n.reserved_ports.insert(22);

        let mut a = alloc("a", 100, 100);
        a.allocated.ports.insert(8080);
        let mut b = alloc("b", 100, 100);
        b.allocated.ports.insert(8080);
        let result = allocs_fit(&n, [&a, &b]);
        assert_eq!(result.dimension, Some(Dimension::Ports));

        let mut ssh = alloc("c", 100, 100);
        ssh.allocated.ports.insert(22);
        assert!(!allocs_fit(&n, [&ssh]).fits);
    }

    #[test]
    fn score_fit_prefers_fuller_nodes() {
        let n = node(1100, 2304);
        let empty = score_fit(&n, &Resources::default());
        let half = score_fit(&n, &Resources::new(500, 1024, 0, 0));
        let full = score_fit(&n, &Resources::new(1000, 2048, 0, 0));

        assert!(empty < half);
        assert!(half < full);
        assert!((full - 1.0).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&empty));
    }
}
