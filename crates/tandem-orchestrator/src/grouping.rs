//! Dependency grouping.
//!
//! Tasks with the same set of component dependencies share an optimizer.
//! A task whose set is a strict subset of another set joins the group of a
//! maximal superset, so every component is optimized by the group that owns
//! it. Partial overlaps are never merged.

use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_training::{ComponentKey, TaskDescriptor};
use tracing::{debug, warn};

/// Training tasks optimized together.
#[derive(Debug, Clone)]
pub struct Group {
    dependencies: Vec<ComponentKey>,
    tasks: Vec<Arc<TaskDescriptor>>,
}

impl Group {
    /// Component keys of the group, in first-discovered order.
    #[must_use]
    pub fn dependencies(&self) -> &[ComponentKey] {
        &self.dependencies
    }

    #[must_use]
    pub fn tasks(&self) -> &[Arc<TaskDescriptor>] {
        &self.tasks
    }

    /// Short component names joined with `+`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.dependencies.is_empty() {
            return "(no components)".to_string();
        }
        self.dependencies.iter().map(ComponentKey::short_name).collect::<Vec<_>>().join("+")
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self { parent: (0..len).collect() }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    /// Attaches `child`'s set under `root`'s set.
    fn attach(&mut self, child: usize, root: usize) {
        let (child, root) = (self.find(child), self.find(root));
        if child != root {
            self.parent[child] = root;
        }
    }
}

struct Node {
    order: Vec<ComponentKey>,
    set: BTreeSet<ComponentKey>,
    tasks: Vec<usize>,
}

/// Groups training tasks by dependency set.
///
/// Groups come back ordered by their earliest task; tasks inside a group
/// keep discovery order.
pub(crate) fn group_tasks(tasks: &[Arc<TaskDescriptor>]) -> Vec<Group> {
    let mut nodes: Vec<Node> = Vec::new();
    for (index, task) in tasks.iter().enumerate() {
        let order = task.component_keys();
        let set: BTreeSet<ComponentKey> = order.iter().copied().collect();
        match nodes.iter_mut().find(|n| n.set == set) {
            Some(node) => node.tasks.push(index),
            None => nodes.push(Node { order, set, tasks: vec![index] }),
        }
    }

    let is_strict_subset = |a: &BTreeSet<ComponentKey>, b: &BTreeSet<ComponentKey>| {
        a.len() < b.len() && a.is_subset(b)
    };

    let maximal: Vec<bool> = nodes
        .iter()
        .map(|n| !nodes.iter().any(|other| is_strict_subset(&n.set, &other.set)))
        .collect();

    let mut sets = DisjointSet::new(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if maximal[i] {
            continue;
        }
        let candidates: Vec<usize> = (0..nodes.len())
            .filter(|&j| maximal[j] && is_strict_subset(&node.set, &nodes[j].set))
            .collect();
        // Largest superset first, then earliest discovered.
        let Some(&target) = candidates.iter().max_by(|&&a, &&b| {
            nodes[a].set.len().cmp(&nodes[b].set.len()).then(b.cmp(&a))
        }) else {
            continue;
        };
        if candidates.len() > 1 {
            warn!(
                subset = ?node.order,
                chosen = ?nodes[target].order,
                candidates = candidates.len(),
                "Dependency set fits several groups; merging into the first"
            );
        }
        debug!(subset = ?node.order, superset = ?nodes[target].order, "Merging dependency subset");
        sets.attach(i, target);
    }

    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for i in 0..nodes.len() {
        let root = sets.find(i);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(i),
            None => groups.push((root, vec![i])),
        }
    }

    let mut result: Vec<(usize, Group)> = groups
        .into_iter()
        .map(|(root, members)| {
            let mut indices: Vec<usize> =
                members.iter().flat_map(|&m| nodes[m].tasks.iter().copied()).collect();
            indices.sort_unstable();
            let first = indices.first().copied().unwrap_or(usize::MAX);
            let group = Group {
                dependencies: nodes[root].order.clone(),
                tasks: indices.into_iter().map(|i| Arc::clone(&tasks[i])).collect(),
            };
            (first, group)
        })
        .collect();
    result.sort_by_key(|(first, _)| *first);
    result.into_iter().map(|(_, group)| group).collect()
}
