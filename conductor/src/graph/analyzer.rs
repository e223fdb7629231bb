//! Validation, layering, critical path and prioritization of a dependency graph.

use super::item::{DependencyEdge, ItemStatus, WorkItem};
use super::scoring::{PriorityScore, ScoreWeights};
use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

const SLACK_EPSILON: f64 = 1e-9;

/// The longest weighted dependency chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Item ids from root to leaf.
    pub items: Vec<String>,
    /// Sum of the chain's weights; the minimum completion time of the graph.
    pub length: f64,
}

/// Summary of a graph analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAnalysis {
    /// Number of items.
    pub total_items: usize,
    /// Layers of mutually independent items, each sorted by score.
    pub parallel_groups: Vec<Vec<String>>,
    /// The critical path.
    pub critical_path: CriticalPath,
    /// Every item in a dependency-respecting, score-ordered sequence.
    pub prioritized: Vec<String>,
    /// Size of the largest parallel group.
    pub max_parallelism: usize,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    earliest_start: f64,
    latest_start: f64,
}

/// A validated, acyclic dependency graph of work items.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    layers: Vec<Vec<usize>>,
    depth: Vec<usize>,
}

impl DependencyGraph {
    /// Builds a graph from items and extra edges.
    ///
    /// Each item's `dependencies` and every edge are merged. Fails on an empty
    /// item set, duplicate ids, references to unknown ids, or a cycle.
    pub fn new(items: Vec<WorkItem>, edges: &[DependencyEdge]) -> Result<Self, GraphError> {
        if items.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut index = HashMap::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if index.insert(item.id.clone(), i).is_some() {
                return Err(GraphError::Validation {
                    message: format!("duplicate item id '{}'", item.id),
                    item: Some(item.id.clone()),
                    reference: Some(item.id.clone()),
                });
            }
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
        for (i, item) in items.iter().enumerate() {
            for dep in &item.dependencies {
                let d = *index
                    .get(dep)
                    .ok_or_else(|| GraphError::dangling(&item.id, dep))?;
                dependencies[i].push(d);
            }
        }
        for edge in edges {
            let to = *index
                .get(&edge.to)
                .ok_or_else(|| GraphError::dangling(&edge.from, &edge.to))?;
            let from = *index
                .get(&edge.from)
                .ok_or_else(|| GraphError::dangling(&edge.to, &edge.from))?;
            dependencies[to].push(from);
        }
        for deps in &mut dependencies {
            deps.sort_unstable();
            deps.dedup();
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let mut graph = Self {
            items,
            index,
            dependencies,
            dependents,
            layers: Vec::new(),
            depth: Vec::new(),
        };
        graph.compute_layers();
        let placed: usize = graph.layers.iter().map(Vec::len).sum();
        if placed < graph.items.len() {
            return Err(GraphError::CircularDependency {
                cycle: graph.find_cycle(),
            });
        }

        debug!(
            items = graph.items.len(),
            layers = graph.layers.len(),
            "Dependency graph built"
        );
        Ok(graph)
    }

    /// Builds a graph from items alone.
    pub fn from_items(items: Vec<WorkItem>) -> Result<Self, GraphError> {
        Self::new(items, &[])
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false: construction rejects empty graphs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in declaration order.
    #[must_use]
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Looks up an item.
    pub fn get(&self, id: &str) -> Result<&WorkItem, GraphError> {
        self.position(id).map(|i| &self.items[i])
    }

    /// Ids this item depends on, merged from its declaration and the edges.
    pub fn dependencies(&self, id: &str) -> Result<Vec<&str>, GraphError> {
        let i = self.position(id)?;
        Ok(self.ids(&self.dependencies[i]))
    }

    /// Ids that directly depend on this item.
    pub fn dependents(&self, id: &str) -> Result<Vec<&str>, GraphError> {
        let i = self.position(id)?;
        Ok(self.ids(&self.dependents[i]))
    }

    /// Layer index of this item; roots are at depth 0.
    pub fn depth(&self, id: &str) -> Result<usize, GraphError> {
        self.position(id).map(|i| self.depth[i])
    }

    /// Items partitioned into layers of mutually independent items.
    ///
    /// Every dependency of an item in group `k` is in a group before `k`.
    /// Within a group, items are ordered by descending score under the
    /// default weights, then by id.
    #[must_use]
    pub fn parallel_groups(&self) -> Vec<Vec<String>> {
        self.parallel_groups_with(&ScoreWeights::default())
    }

    /// Like [`parallel_groups`](Self::parallel_groups) with explicit weights.
    #[must_use]
    pub fn parallel_groups_with(&self, weights: &ScoreWeights) -> Vec<Vec<String>> {
        let scores = self.raw_scores(weights);
        self.layers
            .iter()
            .map(|layer| {
                let mut layer = layer.clone();
                self.sort_by_score(&mut layer, &scores);
                layer.into_iter().map(|i| self.items[i].id.clone()).collect()
            })
            .collect()
    }

    /// Scores every item, in declaration order.
    #[must_use]
    pub fn priority_scores(&self, weights: &ScoreWeights) -> Vec<PriorityScore> {
        let scores = self.raw_scores(weights);
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| PriorityScore {
                id: item.id.clone(),
                score: scores[i],
                priority_level: item.priority.level(),
                dependents: self.dependents[i].len(),
                depth: self.depth[i],
            })
            .collect()
    }

    /// Every item in a dependency-respecting order, highest score first within each layer.
    #[must_use]
    pub fn prioritized_queue(&self, weights: &ScoreWeights) -> Vec<String> {
        self.parallel_groups_with(weights).into_iter().flatten().collect()
    }

    /// Items that can start now, highest score first.
    ///
    /// An item is ready when it is pending, not in `completed`, and every
    /// dependency is either in `completed` or has status `completed`.
    #[must_use]
    pub fn ready_items(&self, completed: &HashSet<String>, weights: &ScoreWeights) -> Vec<String> {
        let is_done =
            |i: usize| completed.contains(&self.items[i].id) || self.items[i].status == ItemStatus::Completed;
        let mut ready: Vec<usize> = (0..self.items.len())
            .filter(|&i| self.items[i].status == ItemStatus::Pending && !is_done(i))
            .filter(|&i| self.dependencies[i].iter().all(|&d| is_done(d)))
            .collect();
        let scores = self.raw_scores(weights);
        self.sort_by_score(&mut ready, &scores);
        ready.into_iter().map(|i| self.items[i].id.clone()).collect()
    }

    /// The longest weighted chain of dependencies.
    #[must_use]
    pub fn critical_path(&self) -> CriticalPath {
        let timings = self.timings();
        let length = self.project_length(&timings);
        let is_critical = |i: usize| (timings[i].latest_start - timings[i].earliest_start).abs() < SLACK_EPSILON;

        let mut items = Vec::new();
        let mut current = (0..self.items.len())
            .find(|&i| self.dependencies[i].is_empty() && is_critical(i));
        while let Some(i) = current {
            items.push(self.items[i].id.clone());
            let finish = timings[i].earliest_start + self.items[i].effective_weight();
            current = self.dependents[i].iter().copied().find(|&d| {
                is_critical(d) && (timings[d].earliest_start - finish).abs() < SLACK_EPSILON
            });
        }

        CriticalPath { items, length }
    }

    /// How long this item can slip without delaying the whole graph.
    pub fn slack(&self, id: &str) -> Result<f64, GraphError> {
        let i = self.position(id)?;
        let timing = self.timings()[i];
        Ok((timing.latest_start - timing.earliest_start).max(0.0))
    }

    /// Returns true if delaying this item delays the whole graph.
    pub fn is_critical(&self, id: &str) -> Result<bool, GraphError> {
        self.slack(id).map(|slack| slack < SLACK_EPSILON)
    }

    /// Runs every analysis with the given weights.
    #[must_use]
    pub fn analyze(&self, weights: &ScoreWeights) -> GraphAnalysis {
        let parallel_groups = self.parallel_groups_with(weights);
        let max_parallelism = parallel_groups.iter().map(Vec::len).max().unwrap_or(0);
        let prioritized = parallel_groups.iter().flatten().cloned().collect();
        GraphAnalysis {
            total_items: self.items.len(),
            critical_path: self.critical_path(),
            parallel_groups,
            prioritized,
            max_parallelism,
        }
    }

    fn position(&self, id: &str) -> Result<usize, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::IssueNotFound { id: id.to_string() })
    }

    fn ids(&self, indices: &[usize]) -> Vec<&str> {
        indices.iter().map(|&i| self.items[i].id.as_str()).collect()
    }

    fn raw_scores(&self, weights: &ScoreWeights) -> Vec<f64> {
        (0..self.items.len())
            .map(|i| weights.score(self.items[i].priority.level(), self.dependents[i].len(), self.depth[i]))
            .collect()
    }

    fn sort_by_score(&self, indices: &mut [usize], scores: &[f64]) {
        indices.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.items[a].id.cmp(&self.items[b].id))
        });
    }

    /// Extracts one cycle after layering has left some items unplaced.
    ///
    /// An item is unplaced exactly when one of its dependencies is unplaced,
    /// so following unplaced dependencies from any unplaced item must revisit
    /// an item. The returned path starts and ends on that item.
    fn find_cycle(&self) -> Vec<String> {
        let mut placed = vec![false; self.items.len()];
        for &i in self.layers.iter().flatten() {
            placed[i] = true;
        }

        let mut seen_at: Vec<Option<usize>> = vec![None; self.items.len()];
        let mut path = Vec::new();
        let mut current = (0..self.items.len()).find(|&i| !placed[i]);
        while let Some(node) = current {
            if let Some(start) = seen_at[node] {
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&i: &usize| self.items[i].id.clone()).collect();
                cycle.push(self.items[node].id.clone());
                return cycle;
            }
            seen_at[node] = Some(path.len());
            path.push(node);
            current = self.dependencies[node].iter().copied().find(|&d| !placed[d]);
        }
        Vec::new()
    }

    fn compute_layers(&mut self) {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut depth = vec![0; self.items.len()];
        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.items.len()).filter(|&i| in_degree[i] == 0).collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                depth[node] = layers.len();
                for &dependent in &self.dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            layers.push(current);
            current = next;
        }

        self.layers = layers;
        self.depth = depth;
    }

    fn timings(&self) -> Vec<Timing> {
        let order: Vec<usize> = self.layers.iter().flatten().copied().collect();
        let mut earliest_start = vec![0.0_f64; self.items.len()];
        for &i in &order {
            earliest_start[i] = self.dependencies[i]
                .iter()
                .map(|&d| earliest_start[d] + self.items[d].effective_weight())
                .fold(0.0, f64::max);
        }

        let length = (0..self.items.len())
            .map(|i| earliest_start[i] + self.items[i].effective_weight())
            .fold(0.0, f64::max);

        let mut latest_start = vec![0.0_f64; self.items.len()];
        for &i in order.iter().rev() {
            let latest_finish = self.dependents[i]
                .iter()
                .map(|&d| latest_start[d])
                .fold(length, f64::min);
            latest_start[i] = latest_finish - self.items[i].effective_weight();
        }

        earliest_start
            .into_iter()
            .zip(latest_start)
            .map(|(earliest_start, latest_start)| Timing {
                earliest_start,
                latest_start,
            })
            .collect()
    }

    fn project_length(&self, timings: &[Timing]) -> f64 {
        timings
            .iter()
            .zip(&self.items)
            .map(|(t, item)| t.earliest_start + item.effective_weight())
            .fold(0.0, f64::max)
    }
}
