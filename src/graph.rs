//! Task dependency graph built from `depends` edges (Arc<str> optimized)
//!
//! Uses Arc<str> for zero-cost cloning of task IDs.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::workflow::WorkflowDefinition;

/// Graph of task dependencies: an edge `dep -> task` for every entry in
/// `task.depends`.
pub struct TaskGraph {
    /// task_id -> list of successor task_ids (tasks depending on it)
    adjacency: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// task_id -> list of predecessor task_ids (its dependencies)
    predecessors: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// All task IDs in declaration order
    task_ids: Vec<Arc<str>>,
    /// Quick lookup for task existence (also reused for Arc interning)
    task_set: FxHashSet<Arc<str>>,
}

impl TaskGraph {
    pub fn from_workflow(workflow: &WorkflowDefinition) -> Self {
        let capacity = workflow.tasks.len();
        let mut adjacency: FxHashMap<Arc<str>, Vec<Arc<str>>> = FxHashMap::default();
        let mut predecessors: FxHashMap<Arc<str>, Vec<Arc<str>>> = FxHashMap::default();
        let mut task_ids: Vec<Arc<str>> = Vec::with_capacity(capacity);
        let mut task_set: FxHashSet<Arc<str>> = FxHashSet::default();

        // Create Arc<str> once per task, reuse everywhere
        for task in &workflow.tasks {
            let id: Arc<str> = Arc::from(task.id.as_str());
            task_ids.push(Arc::clone(&id));
            task_set.insert(Arc::clone(&id));
            adjacency.insert(Arc::clone(&id), Vec::new());
            predecessors.insert(id, Vec::new());
        }

        for task in &workflow.tasks {
            let tgt = task_set
                .get(task.id.as_str())
                .cloned()
                .unwrap_or_else(|| Arc::from(task.id.as_str()));
            for dep in &task.depends {
                let src = task_set
                    .get(dep.as_str())
                    .cloned()
                    .unwrap_or_else(|| Arc::from(dep.as_str()));
                adjacency
                    .entry(Arc::clone(&src))
                    .or_default()
                    .push(Arc::clone(&tgt));
                predecessors
                    .entry(Arc::clone(&tgt))
                    .or_default()
                    .push(src);
            }
        }

        Self {
            adjacency,
            predecessors,
            task_ids,
            task_set,
        }
    }

    /// Get dependencies of a task
    #[inline]
    pub fn dependencies(&self, task_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors
            .get(task_id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Get tasks that depend on the given task
    #[inline]
    pub fn dependents(&self, task_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.adjacency
            .get(task_id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// All task ids in declaration order
    pub fn task_ids(&self) -> &[Arc<str>] {
        &self.task_ids
    }

    /// Check if task exists
    #[inline]
    pub fn contains(&self, task_id: &str) -> bool {
        self.task_set.contains(task_id)
    }

    /// Tasks with no dependencies (entry points)
    pub fn roots(&self) -> Vec<Arc<str>> {
        self.task_ids
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .cloned()
            .collect()
    }

    /// Check if there's a dependency path from `from` to `to` (BFS)
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(current) {
                for neighbor in neighbors {
                    if neighbor.as_ref() == to {
                        return true;
                    }
                    if visited.insert(neighbor.as_ref()) {
                        queue.push_back(neighbor.as_ref());
                    }
                }
            }
        }

        false
    }

    /// Detect a dependency cycle via DFS with recursion-stack coloring.
    ///
    /// Returns true if any back-edge exists. Unknown `depends` references
    /// are ignored here; reference resolution is the validator's job.
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<&str, Color> = self
            .task_ids
            .iter()
            .map(|id| (id.as_ref(), Color::White))
            .collect();

        // Iterative DFS: (node, next-child index) frames avoid recursion
        // depth limits on long chains.
        for start in &self.task_ids {
            if colors[start.as_ref()] != Color::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_ref(), 0)];
            colors.insert(start.as_ref(), Color::Gray);

            while let Some((node, child_idx)) = stack.pop() {
                let children = self.dependents(node);
                if child_idx < children.len() {
                    stack.push((node, child_idx + 1));
                    let child = children[child_idx].as_ref();
                    match colors.get(child).copied() {
                        Some(Color::Gray) => return true,
                        Some(Color::White) => {
                            colors.insert(child, Color::Gray);
                            stack.push((child, 0));
                        }
                        _ => {}
                    }
                } else {
                    colors.insert(node, Color::Black);
                }
            }
        }

        false
    }
}
