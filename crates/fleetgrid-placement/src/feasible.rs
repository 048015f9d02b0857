//! Feasibility: hard constraints a node must satisfy before it is scored.
//!
//! Checks run in a fixed order: status, scheduling eligibility, datacenter,
//! drivers, then job, group, and task constraints. Placement-scoped
//! operands (`distinct_hosts`, `distinct_property`) depend on what else is
//! placed and are checked separately by [`check_distinct`].
//!
//! Everything except status and eligibility is a function of the node's
//! computed class, so [`FeasibilityChecker`] caches results per class unless
//! a constraint references a unique node value.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use fleetgrid_state::{Allocation, Constraint, Job, Node, Operand, TaskGroup};
use regex::Regex;
use semver::{Version, VersionReq};
use thiserror::Error;

/// Why a node was filtered out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterReason {
    #[error("node not ready")]
    NotReady,

    #[error("node not eligible")]
    Ineligible,

    #[error("datacenter not targeted")]
    Datacenter,

    #[error("missing driver: {0}")]
    MissingDriver(String),

    #[error("{0}")]
    Constraint(String),

    #[error("distinct_hosts")]
    DistinctHosts,

    #[error("distinct_property: {0}")]
    DistinctProperty(String),
}

// ── Operand evaluation ────────────────────────────────────────────

/// Evaluates individual constraints, caching compiled regexes and version
/// requirements for the lifetime of one evaluation.
#[derive(Debug, Default)]
pub struct ConstraintChecker {
    regexes: HashMap<String, Option<Regex>>,
    versions: HashMap<(String, bool), Option<VersionReq>>,
}

impl ConstraintChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `node` satisfies `constraint`. Placement-scoped operands
    /// always pass here.
    pub fn check(&mut self, node: &Node, constraint: &Constraint) -> bool {
        let lval = constraint.ltarget.resolve(node);
        let rval = constraint.rtarget.resolve(node);

        match constraint.operand {
            Operand::DistinctHosts | Operand::DistinctProperty => true,
            Operand::IsSet => lval.is_some(),
            Operand::IsNotSet => lval.is_none(),
            Operand::Equal => matches!((lval, rval), (Some(l), Some(r)) if l == r),
            Operand::NotEqual => lval != rval,
            Operand::Lt | Operand::Lte | Operand::Gt | Operand::Gte => match (lval, rval) {
                (Some(l), Some(r)) => check_order(constraint.operand, l, r),
                _ => false,
            },
            Operand::Version | Operand::Semver => match (lval, rval) {
                (Some(l), Some(r)) => {
                    self.check_version(l, r, constraint.operand == Operand::Semver)
                }
                _ => false,
            },
            Operand::Regexp => match (lval, rval) {
                (Some(l), Some(r)) => self.check_regexp(l, r),
                _ => false,
            },
            Operand::SetContainsAll | Operand::SetContainsAny => match (lval, rval) {
                (Some(l), Some(r)) => {
                    check_set(l, r, constraint.operand == Operand::SetContainsAny)
                }
                _ => false,
            },
        }
    }

    fn check_regexp(&mut self, value: &str, pattern: &str) -> bool {
        let re = self
            .regexes
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok());
        re.as_ref().is_some_and(|re| re.is_match(value))
    }

    fn check_version(&mut self, value: &str, requirement: &str, strict: bool) -> bool {
        let req = self
            .versions
            .entry((requirement.to_string(), strict))
            .or_insert_with(|| parse_requirement(requirement));
        let Some(req) = req.as_ref() else {
            return false;
        };
        let version = if strict {
            Version::parse(value.trim()).ok()
        } else {
            parse_lenient_version(value)
        };
        version.is_some_and(|v| req.matches(&v))
    }
}

/// Integer, then float, then lexical ordering.
fn check_order(operand: Operand, l: &str, r: &str) -> bool {
    use std::cmp::Ordering;

    let ordering = match (l.parse::<i64>(), r.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => match (l.parse::<f64>(), r.parse::<f64>()) {
            (Ok(a), Ok(b)) => match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return false,
            },
            _ => l.cmp(r),
        },
    };
    match operand {
        Operand::Lt => ordering == Ordering::Less,
        Operand::Lte => ordering != Ordering::Greater,
        Operand::Gt => ordering == Ordering::Greater,
        Operand::Gte => ordering != Ordering::Less,
        _ => false,
    }
}

fn check_set(l: &str, r: &str, any: bool) -> bool {
    let have: BTreeSet<&str> = l.split(',').map(str::trim).collect();
    let mut want = r.split(',').map(str::trim).filter(|s| !s.is_empty());
    if any {
        want.any(|w| have.contains(w))
    } else {
        want.all(|w| have.contains(w))
    }
}

/// Parse a comma-separated requirement. A bare version means exact match.
fn parse_requirement(raw: &str) -> Option<VersionReq> {
    let normalized = raw
        .split(',')
        .map(str::trim)
        .map(|part| {
            if part.starts_with(|c: char| c.is_ascii_digit()) {
                format!("={part}")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    VersionReq::parse(&normalized).ok()
}

/// Parse `1`, `1.2`, `v1.2.3`, or `1.2.3-beta` by padding missing components.
fn parse_lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let (core, rest) = match raw.find(['-', '+']) {
        Some(pos) => raw.split_at(pos),
        None => (raw, ""),
    };
    let mut parts = core
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.resize(3, 0);
    Version::parse(&format!("{}.{}.{}{rest}", parts[0], parts[1], parts[2])).ok()
}

/// Check every constraint, returning the first one the node fails.
pub fn check_constraints(node: &Node, constraints: &[Constraint]) -> Result<(), FilterReason> {
    let mut checker = ConstraintChecker::new();
    check_all(&mut checker, node, constraints)
}

fn check_all(
    checker: &mut ConstraintChecker,
    node: &Node,
    constraints: &[Constraint],
) -> Result<(), FilterReason> {
    for constraint in constraints {
        if !checker.check(node, constraint) {
            return Err(FilterReason::Constraint(constraint.to_string()));
        }
    }
    Ok(())
}

// ── Node feasibility ──────────────────────────────────────────────

/// Per-evaluation feasibility checker for one job.
pub struct FeasibilityChecker<'j> {
    job: &'j Job,
    constraints: ConstraintChecker,
    /// (group, computed class) → cached verdict.
    class_cache: BTreeMap<(String, String), Result<(), FilterReason>>,
    /// Computed class → whether any group could run there.
    class_eligibility: BTreeMap<String, bool>,
    escaped: bool,
}

impl<'j> FeasibilityChecker<'j> {
    pub fn new(job: &'j Job) -> Self {
        Self {
            job,
            constraints: ConstraintChecker::new(),
            class_cache: BTreeMap::new(),
            class_eligibility: BTreeMap::new(),
            escaped: false,
        }
    }

    /// Shared access to the operand evaluator, for affinity matching.
    pub fn constraint_checker(&mut self) -> &mut ConstraintChecker {
        &mut self.constraints
    }

    /// Check everything but the placement-scoped operands.
    pub fn check(&mut self, node: &Node, group: &TaskGroup) -> Result<(), FilterReason> {
        if !node.is_ready() {
            return Err(FilterReason::NotReady);
        }
        if !node.is_eligible() {
            return Err(FilterReason::Ineligible);
        }

        let escaped = group_escapes(self.job, group);
        if escaped {
            self.escaped = true;
        } else if !node.computed_class.is_empty() {
            let key = (group.name.clone(), node.computed_class.clone());
            if let Some(cached) = self.class_cache.get(&key) {
                return cached.clone();
            }
            let verdict = self.check_class(node, group);
            self.record_class(&node.computed_class, verdict.is_ok());
            self.class_cache.insert(key, verdict.clone());
            return verdict;
        }
        self.check_class(node, group)
    }

    fn check_class(&mut self, node: &Node, group: &TaskGroup) -> Result<(), FilterReason> {
        let job = self.job;
        if !job.datacenters.is_empty()
            && !job
                .datacenters
                .iter()
                .any(|dc| dc == "*" || *dc == node.datacenter)
        {
            return Err(FilterReason::Datacenter);
        }
        for driver in group.drivers() {
            if !node.driver_healthy(driver) {
                return Err(FilterReason::MissingDriver(driver.to_string()));
            }
        }
        check_all(&mut self.constraints, node, &job.constraints)?;
        check_all(&mut self.constraints, node, &group.constraints)?;
        for task in &group.tasks {
            check_all(&mut self.constraints, node, &task.constraints)?;
        }
        Ok(())
    }

    fn record_class(&mut self, class: &str, eligible: bool) {
        let entry = self.class_eligibility.entry(class.to_string()).or_insert(false);
        *entry |= eligible;
    }

    /// Computed classes seen so far and whether any group fit them.
    pub fn class_eligibility(&self) -> &BTreeMap<String, bool> {
        &self.class_eligibility
    }

    /// Whether some constraint referenced a unique value, so class-level
    /// eligibility is not conclusive.
    pub fn escaped(&self) -> bool {
        self.escaped
    }
}

fn group_escapes(job: &Job, group: &TaskGroup) -> bool {
    job.constraints
        .iter()
        .chain(&group.constraints)
        .chain(group.tasks.iter().flat_map(|t| &t.constraints))
        .any(Constraint::is_unique)
}

// ── Placement-scoped operands ─────────────────────────────────────

/// Check `distinct_hosts` and `distinct_property` constraints.
///
/// `proposed` pairs every live or planned allocation of the job with the
/// node it is (or will be) on. Job-level constraints count every group;
/// group-level constraints count only `group`.
pub fn check_distinct(
    node: &Node,
    job: &Job,
    group: &TaskGroup,
    proposed: &[(&Node, &Allocation)],
) -> Result<(), FilterReason> {
    let scopes = [(&job.constraints, None), (&group.constraints, Some(group.name.as_str()))];
    for (constraints, scope) in scopes {
        let in_scope = |alloc: &Allocation| scope.is_none_or(|g| alloc.task_group == g);
        for constraint in constraints.iter().filter(|c| c.operand.is_placement_scoped()) {
            match constraint.operand {
                Operand::DistinctHosts => {
                    if proposed
                        .iter()
                        .any(|(n, a)| n.id == node.id && in_scope(a))
                    {
                        return Err(FilterReason::DistinctHosts);
                    }
                }
                Operand::DistinctProperty => {
                    let Some(value) = constraint.ltarget.resolve(node) else {
                        return Err(FilterReason::DistinctProperty(
                            constraint.ltarget.to_string(),
                        ));
                    };
                    let limit = match constraint.rtarget.resolve(node) {
                        Some(raw) if !raw.is_empty() => raw.parse::<usize>().unwrap_or(1),
                        _ => 1,
                    };
                    let used = proposed
                        .iter()
                        .filter(|(n, a)| {
                            in_scope(a) && constraint.ltarget.resolve(n) == Some(value)
                        })
                        .count();
                    if used >= limit {
                        return Err(FilterReason::DistinctProperty(
                            constraint.ltarget.to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
