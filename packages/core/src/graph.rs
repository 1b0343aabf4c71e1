//! Dependency graph validation.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::JobError;
use crate::job::JobId;

/// Check a batch of dependency edges for cycles and return a leaves-first
/// insertion order (Kahn's algorithm).
///
/// `edges` maps each job in the batch to the set of jobs it depends on.
/// Dependencies outside the batch are assumed to already exist in the store;
/// since existing jobs cannot depend on ids minted afterwards, they can never
/// close a cycle and are ignored here.
pub fn toposort(edges: &HashMap<JobId, BTreeSet<JobId>>) -> Result<Vec<JobId>, JobError> {
    for (id, deps) in edges {
        if deps.contains(id) {
            return Err(JobError::CyclicDependency(*id));
        }
    }

    let mut indegree: HashMap<JobId, usize> = HashMap::with_capacity(edges.len());
    let mut dependents: HashMap<JobId, Vec<JobId>> = HashMap::new();
    for (id, deps) in edges {
        let internal = deps.iter().filter(|d| edges.contains_key(d));
        let mut degree = 0;
        for dep in internal {
            dependents.entry(*dep).or_default().push(*id);
            degree += 1;
        }
        indegree.insert(*id, degree);
    }

    let mut queue: VecDeque<JobId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            let degree = indegree
                .get_mut(dependent)
                .expect("dependent is part of the batch");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(*dependent);
            }
        }
    }

    if order.len() != edges.len() {
        let culprit = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .min()
            .expect("unsorted node remains when a cycle exists");
        return Err(JobError::CyclicDependency(culprit));
    }

    Ok(order)
}
