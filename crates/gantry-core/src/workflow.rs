//! Workflow definition types.
//!
//! These types describe the static job graph a caller submits: job
//! templates, their dependency edges, run conditions, matrix fan-out,
//! and the run-level concurrency policy. They are immutable once a run
//! starts; everything dynamic lives in [`crate::run`].

use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of parameter bindings for one matrix instance.
///
/// Ordered map so expansion and display are deterministic.
pub type ParameterSet = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    pub jobs: Vec<JobTemplate>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub id: JobId,
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    /// Bound on simultaneously running instances of this template.
    /// `None` means unbounded.
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    60 * 60 * 1000
}

impl JobTemplate {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            depends_on: vec![],
            condition: Condition::default(),
            matrix: None,
            max_parallel: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Effective parallelism cap: the template-level setting wins over
    /// the matrix-level one.
    pub fn effective_max_parallel(&self) -> Option<u32> {
        self.max_parallel
            .or_else(|| self.matrix.as_ref().and_then(|m| m.max_parallel))
    }
}

/// When a job's instances are allowed to run relative to the aggregate
/// status of its prerequisites.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Run only if every prerequisite aggregates to success; otherwise
    /// the instances are skipped without dispatching.
    #[default]
    OnSuccess,
    /// Run once all prerequisites are terminal, regardless of their
    /// outcome. Used for checker jobs that consolidate upstream results.
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    /// Cartesian dimensions; expansion iterates keys in order.
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<serde_json::Value>>,
    /// Extra parameter sets appended after the cartesian product.
    #[serde(default)]
    pub include: Vec<ParameterSet>,
    /// Parameter sets removed from the product; a combination is
    /// excluded when every key in the exclude entry matches.
    #[serde(default)]
    pub exclude: Vec<ParameterSet>,
    /// When true, the first failing instance cancels all non-terminal
    /// siblings of the same template.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

impl MatrixConfig {
    /// A matrix given directly as an ordered list of parameter sets.
    pub fn from_parameter_sets(sets: Vec<ParameterSet>) -> Self {
        Self {
            include: sets,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    /// Named group; at most one run per derived key is active at a time.
    pub group: String,
    /// Whether admitting a new run preempts the current holder.
    #[serde(default)]
    pub cancel_in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_template_defaults() {
        let json = r#"{"id": "build"}"#;
        let template: JobTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.condition, Condition::OnSuccess);
        assert_eq!(template.timeout_ms, 3_600_000);
        assert!(template.depends_on.is_empty());
        assert!(template.matrix.is_none());
    }

    #[test]
    fn test_effective_max_parallel_prefers_template() {
        let mut template = JobTemplate::new("test");
        template.matrix = Some(MatrixConfig {
            max_parallel: Some(8),
            ..Default::default()
        });
        assert_eq!(template.effective_max_parallel(), Some(8));
        template.max_parallel = Some(2);
        assert_eq!(template.effective_max_parallel(), Some(2));
    }
}
