//! Work items and dependency edges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    /// Not started.
    #[default]
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
    /// Waiting on something outside the graph.
    Blocked,
}

/// Declared priority of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Lowest.
    Low,
    /// Default.
    #[default]
    Medium,
    /// Above default.
    High,
    /// Highest.
    Critical,
}

impl Priority {
    /// Numeric level used by scoring, 1 (low) to 4 (critical).
    #[must_use]
    pub fn level(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A node in the dependency graph, such as an issue to implement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Unique id.
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Current status.
    #[serde(default)]
    pub status: ItemStatus,
    /// Declared priority.
    #[serde(default)]
    pub priority: Priority,
    /// Ids that must complete before this item starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated effort for critical path computation; 1 when absent.
    #[serde(default)]
    pub weight: Option<f64>,
}

impl WorkItem {
    /// Creates a pending, medium-priority item.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            status: ItemStatus::default(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            weight: None,
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Sets the effort weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub(crate) fn effective_weight(&self) -> f64 {
        match self.weight {
            Some(w) if w.is_finite() && w >= 0.0 => w,
            _ => 1.0,
        }
    }
}

/// `from` must complete before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The prerequisite.
    pub from: String,
    /// The dependent.
    pub to: String,
}

impl DependencyEdge {
    /// Creates an edge.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ItemStatus::InProgress).unwrap(),
            r#""inProgress""#
        );
        let item: WorkItem = serde_json::from_str(r#"{"id": "ISSUE-1"}"#).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.priority, Priority::Medium);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert_eq!(Priority::Low.level(), 1);
        assert_eq!(Priority::Critical.to_string(), "critical");
    }

    #[test]
    fn test_invalid_weight_defaults_to_one() {
        assert!((WorkItem::new("a").with_weight(-3.0).effective_weight() - 1.0).abs() < f64::EPSILON);
        assert!((WorkItem::new("a").with_weight(2.5).effective_weight() - 2.5).abs() < f64::EPSILON);
    }
}
