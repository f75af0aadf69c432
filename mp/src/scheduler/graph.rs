//! Dependency validation and dispatch ordering
//!
//! Units whose prerequisites can never be satisfied (duplicate id, unknown
//! prerequisite, membership in a cycle, or depending on such a unit) are
//! reported as blocked; everything else is ordered dependencies first,
//! otherwise in declaration order.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::domain::CollectorUnit;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyPlan {
    /// Indices of dispatchable units, dependencies first
    pub order: Vec<usize>,
    /// Indices of units that can never run, with the reason
    pub blocked: Vec<(usize, String)>,
}

/// Build the dispatch plan for `units`
pub fn plan(units: &[CollectorUnit]) -> DependencyPlan {
    debug!(unit_count = units.len(), "plan: called");
    let mut index_map: HashMap<&str, usize> = HashMap::new();
    let mut blocked: HashMap<usize, String> = HashMap::new();

    for (idx, unit) in units.iter().enumerate() {
        if index_map.contains_key(unit.id.as_str()) {
            blocked.insert(idx, format!("duplicate unit id {}", unit.id));
        } else {
            index_map.insert(unit.id.as_str(), idx);
        }
    }

    for (idx, unit) in units.iter().enumerate() {
        if blocked.contains_key(&idx) {
            continue;
        }
        if let Some(missing) = unit.prerequisites.iter().find(|p| !index_map.contains_key(p.as_str())) {
            blocked.insert(idx, format!("unknown prerequisite {}", missing));
        }
    }

    let deps = |idx: usize| -> Vec<usize> {
        units[idx]
            .prerequisites
            .iter()
            .filter_map(|p| index_map.get(p.as_str()).copied())
            .collect()
    };

    for idx in 0..units.len() {
        if !blocked.contains_key(&idx) && has_cycle_dfs(idx, &deps) {
            debug!(id = %units[idx].id, "plan: unit sits on a dependency cycle");
            blocked.insert(idx, "dependency cycle".to_string());
        }
    }

    // Dependents of blocked units are blocked too
    loop {
        let mut changed = false;
        for idx in 0..units.len() {
            if blocked.contains_key(&idx) {
                continue;
            }
            if let Some(dep) = deps(idx).into_iter().find(|d| blocked.contains_key(d)) {
                blocked.insert(idx, format!("prerequisite {} cannot run", units[dep].id));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for idx in 0..units.len() {
        if !blocked.contains_key(&idx) {
            topo_dfs_idx(idx, &deps, &mut visited, &mut order);
        }
    }

    let mut blocked: Vec<(usize, String)> = blocked.into_iter().collect();
    blocked.sort();
    debug!(order_len = order.len(), blocked = blocked.len(), "plan: complete");
    DependencyPlan { order, blocked }
}

/// Whether `start` can reach itself through prerequisite edges
fn has_cycle_dfs(start: usize, deps: &impl Fn(usize) -> Vec<usize>) -> bool {
    let mut visited = HashSet::new();
    let mut stack = deps(start);
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if visited.insert(node) {
            stack.extend(deps(node));
        }
    }
    false
}

/// Post-order DFS: prerequisites are pushed before their dependents
fn topo_dfs_idx(idx: usize, deps: &impl Fn(usize) -> Vec<usize>, visited: &mut HashSet<usize>, result: &mut Vec<usize>) {
    if !visited.insert(idx) {
        return;
    }
    for dep in deps(idx) {
        topo_dfs_idx(dep, deps, visited, result);
    }
    result.push(idx);
}
