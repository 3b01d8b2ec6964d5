//! Matrix expansion: one job template into independent instances.

use gantry_core::ids::{InstanceId, JobId};
use gantry_core::run::{InstanceStatus, JobInstance};
use gantry_core::workflow::{JobTemplate, MatrixConfig, ParameterSet};

/// Result of expanding one template.
#[derive(Debug, Clone)]
pub struct JobExpansion {
    pub job_id: JobId,
    pub instances: Vec<JobInstance>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

/// Expander for matrix configurations.
///
/// Expansion is deterministic: the cartesian product iterates dimension
/// keys in map order, includes are appended in declaration order, and
/// instance ids are `(template id, index)` over the final sequence. A
/// template without a matrix expands to exactly one parameterless
/// instance.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    pub fn expand(&self, template: &JobTemplate) -> JobExpansion {
        let (combinations, fail_fast) = match &template.matrix {
            Some(matrix) => (self.combinations(matrix), matrix.fail_fast),
            None => (vec![ParameterSet::new()], false),
        };

        let instances = combinations
            .into_iter()
            .enumerate()
            .map(|(index, parameters)| JobInstance {
                id: InstanceId::new(template.id.clone(), index),
                display_name: self.format_display_name(&template.id, &parameters),
                parameters,
                status: InstanceStatus::Pending,
                started_at: None,
                finished_at: None,
            })
            .collect();

        JobExpansion {
            job_id: template.id.clone(),
            instances,
            fail_fast,
            max_parallel: template.effective_max_parallel(),
        }
    }

    fn combinations(&self, matrix: &MatrixConfig) -> Vec<ParameterSet> {
        let mut combinations = if matrix.dimensions.is_empty() {
            Vec::new()
        } else {
            let mut result = vec![ParameterSet::new()];
            for (key, values) in &matrix.dimensions {
                let mut expanded = Vec::with_capacity(result.len() * values.len());
                for combo in &result {
                    for value in values {
                        let mut next = combo.clone();
                        next.insert(key.clone(), value.clone());
                        expanded.push(next);
                    }
                }
                result = expanded;
            }
            result
        };

        for include in &matrix.include {
            if !combinations.contains(include) {
                combinations.push(include.clone());
            }
        }

        let had_candidates = !combinations.is_empty();

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| Self::matches_exclude(combo, exclude))
        });

        // An empty matrix config still runs the job once; a config
        // whose excludes removed every combination runs nothing and
        // the template aggregates as skipped.
        if combinations.is_empty() && !had_candidates {
            combinations.push(ParameterSet::new());
        }

        combinations
    }

    fn matches_exclude(combo: &ParameterSet, exclude: &ParameterSet) -> bool {
        !exclude.is_empty() && exclude.iter().all(|(key, value)| combo.get(key) == Some(value))
    }

    fn format_display_name(&self, job_id: &JobId, parameters: &ParameterSet) -> String {
        if parameters.is_empty() {
            return job_id.to_string();
        }

        let parts: Vec<String> = parameters
            .iter()
            .map(|(k, v)| {
                let v_str = match v {
                    serde_json::Value::String(s) => s.clone(),
                    _ => v.to_string(),
                };
                format!("{}={}", k, v_str)
            })
            .collect();

        format!("{} ({})", job_id, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn set(pairs: &[(&str, serde_json::Value)]) -> ParameterSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_matrix_yields_single_instance() {
        let template = JobTemplate::new("build");
        let expansion = MatrixExpander::new().expand(&template);

        assert_eq!(expansion.instances.len(), 1);
        assert_eq!(expansion.instances[0].id, InstanceId::new("build".into(), 0));
        assert!(expansion.instances[0].parameters.is_empty());
        assert!(!expansion.fail_fast);
    }

    #[test]
    fn test_cartesian_expansion() {
        let mut template = JobTemplate::new("test");
        let mut dimensions = BTreeMap::new();
        dimensions.insert("os".to_string(), vec![json!("linux"), json!("macos")]);
        dimensions.insert("rust".to_string(), vec![json!("stable"), json!("beta"), json!("nightly")]);
        template.matrix = Some(MatrixConfig {
            dimensions,
            ..Default::default()
        });

        let expansion = MatrixExpander::new().expand(&template);
        assert_eq!(expansion.instances.len(), 6);

        // os varies slowest (key order), rust fastest
        assert_eq!(expansion.instances[0].parameters["os"], json!("linux"));
        assert_eq!(expansion.instances[0].parameters["rust"], json!("stable"));
        assert_eq!(expansion.instances[5].parameters["os"], json!("macos"));
        assert_eq!(expansion.instances[5].parameters["rust"], json!("nightly"));
    }

    #[test]
    fn test_parameter_list_expansion_preserves_order() {
        let sets = vec![
            set(&[("suite", json!("unit"))]),
            set(&[("suite", json!("integration"))]),
            set(&[("suite", json!("fuzz"))]),
        ];
        let mut template = JobTemplate::new("test");
        template.matrix = Some(MatrixConfig::from_parameter_sets(sets.clone()));

        let expansion = MatrixExpander::new().expand(&template);
        assert_eq!(expansion.instances.len(), 3);
        for (index, instance) in expansion.instances.iter().enumerate() {
            assert_eq!(instance.id, InstanceId::new("test".into(), index));
            assert_eq!(instance.parameters, sets[index]);
        }
    }

    #[test]
    fn test_exclude_filters_combination() {
        let mut dimensions = BTreeMap::new();
        dimensions.insert("os".to_string(), vec![json!("linux"), json!("macos")]);
        dimensions.insert("arch".to_string(), vec![json!("amd64"), json!("arm64")]);

        let mut template = JobTemplate::new("build");
        template.matrix = Some(MatrixConfig {
            dimensions,
            exclude: vec![set(&[("os", json!("macos")), ("arch", json!("amd64"))])],
            ..Default::default()
        });

        let expansion = MatrixExpander::new().expand(&template);
        // 2x2 = 4, minus 1 excluded = 3
        assert_eq!(expansion.instances.len(), 3);
    }

    #[test]
    fn test_exclude_everything_yields_no_instances() {
        let mut dimensions = BTreeMap::new();
        dimensions.insert("os".to_string(), vec![json!("linux"), json!("macos")]);

        let mut template = JobTemplate::new("build");
        template.matrix = Some(MatrixConfig {
            dimensions,
            exclude: vec![
                set(&[("os", json!("linux"))]),
                set(&[("os", json!("macos"))]),
            ],
            ..Default::default()
        });

        let expansion = MatrixExpander::new().expand(&template);
        assert!(expansion.instances.is_empty());
    }

    #[test]
    fn test_empty_matrix_config_yields_single_instance() {
        let mut template = JobTemplate::new("build");
        template.matrix = Some(MatrixConfig::default());

        let expansion = MatrixExpander::new().expand(&template);
        assert_eq!(expansion.instances.len(), 1);
        assert!(expansion.instances[0].parameters.is_empty());
    }

    #[test]
    fn test_include_appends_after_product() {
        let mut dimensions = BTreeMap::new();
        dimensions.insert("os".to_string(), vec![json!("linux")]);

        let mut template = JobTemplate::new("build");
        template.matrix = Some(MatrixConfig {
            dimensions,
            include: vec![set(&[("os", json!("windows"))])],
            ..Default::default()
        });

        let expansion = MatrixExpander::new().expand(&template);
        assert_eq!(expansion.instances.len(), 2);
        assert_eq!(expansion.instances[1].parameters["os"], json!("windows"));
    }

    #[test]
    fn test_display_name() {
        let mut template = JobTemplate::new("test");
        template.matrix = Some(MatrixConfig::from_parameter_sets(vec![set(&[
            ("os", json!("linux")),
            ("rust", json!("stable")),
        ])]));

        let expansion = MatrixExpander::new().expand(&template);
        assert_eq!(expansion.instances[0].display_name, "test (os=linux, rust=stable)");
    }

    #[test]
    fn test_unique_instance_ids() {
        let mut template = JobTemplate::new("t");
        let mut dimensions = BTreeMap::new();
        dimensions.insert("n".to_string(), (0..8).map(|i| json!(i)).collect());
        template.matrix = Some(MatrixConfig {
            dimensions,
            ..Default::default()
        });

        let expansion = MatrixExpander::new().expand(&template);
        let mut ids: Vec<_> = expansion.instances.iter().map(|i| i.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
