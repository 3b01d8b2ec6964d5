//! Structural validation of the job graph.

use gantry_core::ids::JobId;
use gantry_core::workflow::{JobTemplate, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in job dependencies")]
    CycleDetected,
    #[error("Unknown job dependency: {0}")]
    UnknownDependency(String),
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),
    #[error("Invalid timeout for job {0}: must be positive")]
    InvalidTimeout(String),
    #[error("Empty workflow")]
    EmptyWorkflow,
}

/// A node in the validated job graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub job_id: JobId,
    pub template: JobTemplate,
}

/// Directed acyclic graph over job templates. Construction through
/// [`GraphBuilder::build`] is the submission-time validation step: a
/// workflow that fails here never starts a run.
#[derive(Debug)]
pub struct WorkflowGraph {
    graph: DiGraph<GraphNode, ()>,
    id_to_index: HashMap<JobId, NodeIndex>,
}

impl WorkflowGraph {
    /// Jobs with no dependencies.
    pub fn roots(&self) -> Vec<&GraphNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Jobs that must complete before the given job can run.
    pub fn predecessors(&self, job_id: &JobId) -> Vec<&GraphNode> {
        self.id_to_index
            .get(job_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs unblocked by the given job completing.
    pub fn successors(&self, job_id: &JobId) -> Vec<&GraphNode> {
        self.id_to_index
            .get(job_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs in a dependency-respecting order.
    pub fn topological_order(&self) -> Result<Vec<&GraphNode>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|_| GraphError::CycleDetected)
    }

    pub fn jobs(&self) -> Vec<&GraphNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for validated workflow graphs.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build and validate the graph from a workflow definition.
    pub fn build(&self, workflow: &WorkflowDefinition) -> Result<WorkflowGraph, GraphError> {
        if workflow.jobs.is_empty() {
            return Err(GraphError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut id_to_index = HashMap::new();

        for job in &workflow.jobs {
            if job.timeout_ms == 0 {
                return Err(GraphError::InvalidTimeout(job.id.to_string()));
            }
            let node = GraphNode {
                job_id: job.id.clone(),
                template: job.clone(),
            };
            let idx = graph.add_node(node);
            if id_to_index.insert(job.id.clone(), idx).is_some() {
                return Err(GraphError::DuplicateJob(job.id.to_string()));
            }
        }

        for job in &workflow.jobs {
            let job_idx = id_to_index[&job.id];
            for dep in &job.depends_on {
                let dep_idx = id_to_index
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency(dep.to_string()))?;
                graph.add_edge(*dep_idx, job_idx, ());
            }
        }

        let dag = WorkflowGraph { graph, id_to_index };

        // Verify no cycles
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::workflow::JobTemplate;

    fn make_job(id: &str, depends_on: Vec<&str>) -> JobTemplate {
        let mut template = JobTemplate::new(id);
        template.depends_on = depends_on.into_iter().map(JobId::from).collect();
        template
    }

    fn make_workflow(jobs: Vec<JobTemplate>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".to_string(),
            jobs,
            concurrency: None,
        }
    }

    #[test]
    fn test_linear_graph() {
        let workflow = make_workflow(vec![
            make_job("build", vec![]),
            make_job("test", vec!["build"]),
            make_job("deploy", vec!["test"]),
        ]);

        let dag = GraphBuilder::new().build(&workflow).unwrap();

        let roots = dag.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].job_id.as_str(), "build");

        let order = dag.topological_order().unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].job_id.as_str(), "build");
    }

    #[test]
    fn test_diamond_graph() {
        let workflow = make_workflow(vec![
            make_job("build", vec![]),
            make_job("test-unit", vec!["build"]),
            make_job("test-integration", vec!["build"]),
            make_job("check", vec!["test-unit", "test-integration"]),
        ]);

        let dag = GraphBuilder::new().build(&workflow).unwrap();
        assert_eq!(dag.successors(&JobId::from("build")).len(), 2);
        assert_eq!(dag.predecessors(&JobId::from("check")).len(), 2);
    }

    #[test]
    fn test_cycle_rejected() {
        let workflow = make_workflow(vec![
            make_job("a", vec!["b"]),
            make_job("b", vec!["a"]),
        ]);

        let err = GraphBuilder::new().build(&workflow).unwrap_err();
        assert_eq!(err, GraphError::CycleDetected);
    }

    #[test]
    fn test_self_cycle_rejected() {
        let workflow = make_workflow(vec![make_job("a", vec!["a"])]);
        let err = GraphBuilder::new().build(&workflow).unwrap_err();
        assert_eq!(err, GraphError::CycleDetected);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let workflow = make_workflow(vec![make_job("a", vec!["missing"])]);
        let err = GraphBuilder::new().build(&workflow).unwrap_err();
        assert_eq!(err, GraphError::UnknownDependency("missing".to_string()));
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let workflow = make_workflow(vec![make_job("a", vec![]), make_job("a", vec![])]);
        let err = GraphBuilder::new().build(&workflow).unwrap_err();
        assert_eq!(err, GraphError::DuplicateJob("a".to_string()));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut job = make_job("a", vec![]);
        job.timeout_ms = 0;
        let err = GraphBuilder::new().build(&make_workflow(vec![job])).unwrap_err();
        assert_eq!(err, GraphError::InvalidTimeout("a".to_string()));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = GraphBuilder::new().build(&make_workflow(vec![])).unwrap_err();
        assert_eq!(err, GraphError::EmptyWorkflow);
    }
}
