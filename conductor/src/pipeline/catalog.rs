//! Stage catalogs: the fixed stage topology of each pipeline mode.

use crate::core::PipelineMode;
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stage in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Opaque identifier passed to the executor.
    pub agent_type: String,
    /// Stages that must complete first; each must be declared earlier.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Root stage that runs concurrently with the other parallel roots.
    #[serde(default)]
    pub parallel: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Consult the approval policy before running.
    #[serde(default)]
    pub requires_approval: bool,
    /// Per-stage timeout overriding the orchestrator default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StageDefinition {
    /// Creates a sequential stage with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            depends_on: Vec::new(),
            parallel: false,
            description: String::new(),
            requires_approval: false,
            timeout_ms: None,
        }
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on(mut self, stages: &[&str]) -> Self {
        self.depends_on
            .extend(stages.iter().map(|s| (*s).to_string()));
        self
    }

    /// Marks the stage as a parallel root.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Gates the stage behind the approval policy.
    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Sets a per-stage timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }
}

/// One step of a catalog's execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep<'a> {
    /// Parallel roots, launched together and awaited jointly.
    Parallel(&'a [StageDefinition]),
    /// A single stage, run after everything before it.
    Sequential(&'a StageDefinition),
}

/// A validated, ordered list of stage definitions for one mode.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    mode: PipelineMode,
    roots: Vec<StageDefinition>,
    rest: Vec<StageDefinition>,
    order: Vec<String>,
    position: HashMap<String, usize>,
}

impl StageCatalog {
    /// Validates and builds a catalog.
    ///
    /// Names must be unique, every dependency must name an earlier stage, and
    /// parallel stages may not have dependencies.
    pub fn new(mode: PipelineMode, stages: Vec<StageDefinition>) -> Result<Self, PipelineError> {
        let invalid = |message: String, stages: Vec<String>| PipelineError::InvalidCatalog {
            mode: mode.to_string(),
            message,
            stages,
        };

        if stages.is_empty() {
            return Err(invalid("catalog has no stages".into(), Vec::new()));
        }

        let mut position = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                if !position.contains_key(dep) {
                    let kind = if stages.iter().any(|s| &s.name == dep) {
                        "forward or circular"
                    } else {
                        "unknown"
                    };
                    return Err(invalid(
                        format!("stage '{}' has {kind} dependency '{dep}'", stage.name),
                        vec![stage.name.clone(), dep.clone()],
                    ));
                }
            }
            if stage.parallel && !stage.depends_on.is_empty() {
                return Err(invalid(
                    format!("parallel stage '{}' declares dependencies", stage.name),
                    vec![stage.name.clone()],
                ));
            }
            if position.insert(stage.name.clone(), i).is_some() {
                return Err(invalid(
                    format!("duplicate stage name '{}'", stage.name),
                    vec![stage.name.clone()],
                ));
            }
        }

        let order = stages.iter().map(|s| s.name.clone()).collect();
        let (roots, rest) = stages.into_iter().partition(|s| s.parallel);
        Ok(Self {
            mode,
            roots,
            rest,
            order,
            position,
        })
    }

    /// The built-in catalog for `mode`.
    pub fn for_mode(mode: PipelineMode) -> Result<Self, PipelineError> {
        let stages = match mode {
            PipelineMode::Greenfield => vec![
                StageDefinition::new("requirements", "requirements-analyst")
                    .parallel()
                    .with_description("Capture functional and non-functional requirements"),
                StageDefinition::new("ux-research", "ux-researcher")
                    .parallel()
                    .with_description("Research users, flows and interface conventions"),
                StageDefinition::new("architecture", "architect")
                    .depends_on(&["requirements", "ux-research"])
                    .with_description("Design components, data model and interfaces"),
                StageDefinition::new("issue-planning", "planner")
                    .depends_on(&["architecture"])
                    .with_description("Break the design into dependency-ordered issues"),
                StageDefinition::new("implementation", "developer")
                    .depends_on(&["issue-planning"])
                    .requiring_approval()
                    .with_description("Implement the planned issues"),
                StageDefinition::new("code-review", "reviewer")
                    .depends_on(&["implementation"])
                    .requiring_approval()
                    .with_description("Review the implementation"),
            ],
            PipelineMode::Enhancement => vec![
                StageDefinition::new("codebase-analysis", "code-analyst")
                    .with_description("Map the existing codebase and its conventions"),
                StageDefinition::new("requirements", "requirements-analyst")
                    .depends_on(&["codebase-analysis"])
                    .with_description("Capture the requested change against the existing system"),
                StageDefinition::new("implementation", "developer")
                    .depends_on(&["requirements"])
                    .requiring_approval()
                    .with_description("Implement the change"),
                StageDefinition::new("code-review", "reviewer")
                    .depends_on(&["implementation"])
                    .with_description("Review the change"),
            ],
            PipelineMode::Import => vec![
                StageDefinition::new("issue-import", "issue-importer")
                    .with_description("Import issues from the tracker"),
                StageDefinition::new("issue-triage", "planner")
                    .depends_on(&["issue-import"])
                    .with_description("Order imported issues by dependency and priority"),
                StageDefinition::new("implementation", "developer")
                    .depends_on(&["issue-triage"])
                    .requiring_approval()
                    .with_description("Implement the triaged issues"),
                StageDefinition::new("code-review", "reviewer")
                    .depends_on(&["implementation"])
                    .with_description("Review the implementation"),
            ],
        };
        Self::new(mode, stages)
    }

    /// The catalog's mode.
    #[must_use]
    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Always false: construction rejects empty catalogs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Stage names in declaration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Declaration index of a stage.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.position.get(name).copied()
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.roots
            .iter()
            .chain(&self.rest)
            .find(|stage| stage.name == name)
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        let mut all: Vec<&StageDefinition> = self.roots.iter().chain(&self.rest).collect();
        all.sort_by_key(|stage| self.position.get(&stage.name).copied().unwrap_or(usize::MAX));
        all.into_iter()
    }

    /// The parallel roots.
    #[must_use]
    pub fn parallel_roots(&self) -> &[StageDefinition] {
        &self.roots
    }

    /// Parallel roots first as one joint step, then every other stage in declaration order.
    #[must_use]
    pub fn execution_plan(&self) -> Vec<PlanStep<'_>> {
        let mut plan = Vec::with_capacity(self.rest.len() + 1);
        if !self.roots.is_empty() {
            plan.push(PlanStep::Parallel(&self.roots));
        }
        plan.extend(self.rest.iter().map(PlanStep::Sequential));
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn linear(names: &[&str]) -> Vec<StageDefinition> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let stage = StageDefinition::new(*name, "agent");
                if i == 0 {
                    stage
                } else {
                    stage.depends_on(&[names[i - 1]])
                }
            })
            .collect()
    }

    #[test]
    fn test_builtin_catalogs_are_topological() {
        for mode in PipelineMode::ALL {
            let catalog = StageCatalog::for_mode(mode).unwrap();
            assert_eq!(catalog.mode(), mode);
            for stage in catalog.stages() {
                let own = catalog.position(&stage.name).unwrap();
                for dep in &stage.depends_on {
                    assert!(catalog.position(dep).unwrap() < own, "{mode}: {dep} before {}", stage.name);
                }
            }
        }
    }

    #[test]
    fn test_greenfield_plan_starts_with_parallel_roots() {
        let catalog = StageCatalog::for_mode(PipelineMode::Greenfield).unwrap();
        let plan = catalog.execution_plan();

        match plan[0] {
            PlanStep::Parallel(roots) => {
                let names: Vec<_> = roots.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, vec!["requirements", "ux-research"]);
            }
            PlanStep::Sequential(_) => panic!("expected parallel roots first"),
        }
        assert_eq!(plan.len(), 5);
        assert!(catalog.get("implementation").unwrap().requires_approval);
    }

    #[test]
    fn test_linear_catalog_plan() {
        let catalog = StageCatalog::new(PipelineMode::Enhancement, linear(&["a", "b", "c"])).unwrap();
        let plan = catalog.execution_plan();

        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|step| matches!(step, PlanStep::Sequential(_))));
        assert_eq!(catalog.names(), ["a", "b", "c"]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let stages = vec![
            StageDefinition::new("a", "agent").depends_on(&["b"]),
            StageDefinition::new("b", "agent"),
        ];
        let err = StageCatalog::new(PipelineMode::Import, stages).unwrap_err();

        assert_eq!(err.kind(), "invalid_catalog");
        assert!(err.to_string().contains("forward or circular"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let stages = vec![StageDefinition::new("a", "agent").depends_on(&["ghost"])];
        let err = StageCatalog::new(PipelineMode::Import, stages).unwrap_err();
        assert!(err.to_string().contains("unknown dependency 'ghost'"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let stages = vec![StageDefinition::new("a", "agent").depends_on(&["a"])];
        assert!(StageCatalog::new(PipelineMode::Import, stages).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let stages = vec![StageDefinition::new("a", "x"), StageDefinition::new("a", "y")];
        let err = StageCatalog::new(PipelineMode::Import, stages).unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn test_parallel_with_dependencies_rejected() {
        let stages = vec![
            StageDefinition::new("a", "x"),
            StageDefinition::new("b", "y").depends_on(&["a"]).parallel(),
        ];
        assert!(StageCatalog::new(PipelineMode::Import, stages).is_err());
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(StageCatalog::new(PipelineMode::Greenfield, Vec::new()).is_err());
    }

    #[test]
    fn test_stage_definition_wire_format() {
        let stage: StageDefinition = serde_json::from_str(
            r#"{"name": "review", "agentType": "reviewer", "dependsOn": ["impl"], "requiresApproval": true}"#,
        )
        .unwrap();

        assert_eq!(stage.depends_on, vec!["impl"]);
        assert!(stage.requires_approval);
        assert!(!stage.parallel);
    }
}
