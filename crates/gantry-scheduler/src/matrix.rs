//! Matrix expansion of job templates into job instances.

use gantry_core::JobId;
use gantry_core::interpolation::InterpolationContext;
use gantry_core::run::{JobInstance, value_to_string};
use gantry_core::workflow::{JobTemplate, MatrixAxes, MatrixPoint};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Expands a template's strategy into concrete instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand with no run-level variables.
    pub fn expand(&self, template: &Arc<JobTemplate>) -> Vec<JobInstance> {
        self.expand_with(template, &InterpolationContext::new())
    }

    /// One instance per matrix point, in axis declaration order then value
    /// declaration order. A template without axes yields one instance.
    ///
    /// Matrix values are bound into the template env (plus one
    /// `MATRIX_<AXIS>` variable per axis) and into `runs_on` labels.
    pub fn expand_with(
        &self,
        template: &Arc<JobTemplate>,
        variables: &InterpolationContext,
    ) -> Vec<JobInstance> {
        let strategy = &template.strategy;
        let mut points = generate_combinations(&strategy.axes);

        points.retain(|point| {
            !strategy
                .exclude
                .iter()
                .any(|exclude| matches_partial(point, exclude))
        });
        for include in &strategy.include {
            if !points.contains(include) {
                points.push(include.clone());
            }
        }

        points
            .into_iter()
            .enumerate()
            .map(|(index, point)| self.bind(template, index, point, variables))
            .collect()
    }

    fn bind(
        &self,
        template: &Arc<JobTemplate>,
        index: usize,
        matrix: MatrixPoint,
        variables: &InterpolationContext,
    ) -> JobInstance {
        let matrix_strings: HashMap<String, String> = matrix
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();
        let ctx = variables.clone().with_matrix(matrix_strings.clone());

        let mut env: HashMap<String, String> = template
            .env
            .iter()
            .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
            .collect();
        for (axis, value) in &matrix_strings {
            env.insert(matrix_env_name(axis), value.clone());
        }

        let required_labels: BTreeSet<String> = template
            .required_labels
            .iter()
            .map(|label| ctx.interpolate(label))
            .filter(|label| !label.is_empty())
            .collect();

        JobInstance {
            id: JobId::new(),
            template: Arc::clone(template),
            name: display_name(&template.name, &matrix),
            index,
            matrix,
            env,
            required_labels,
        }
    }
}

/// `node-version` becomes `MATRIX_NODE_VERSION`.
pub fn matrix_env_name(axis: &str) -> String {
    let upper: String = axis
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("MATRIX_{}", upper)
}

fn generate_combinations(axes: &MatrixAxes) -> Vec<MatrixPoint> {
    let mut result = vec![MatrixPoint::new()];

    for (key, values) in axes {
        let values = match values.as_array() {
            Some(values) => values.clone(),
            None => vec![values.clone()],
        };
        let mut next = Vec::with_capacity(result.len() * values.len());
        for combo in &result {
            for value in &values {
                let mut point = combo.clone();
                point.insert(key.clone(), value.clone());
                next.push(point);
            }
        }
        result = next;
    }

    result
}

fn matches_partial(point: &MatrixPoint, pattern: &MatrixPoint) -> bool {
    pattern.iter().all(|(key, value)| point.get(key) == Some(value))
}

fn display_name(template: &str, matrix: &MatrixPoint) -> String {
    if matrix.is_empty() {
        return template.to_string();
    }
    let parts: Vec<String> = matrix
        .iter()
        .map(|(k, v)| format!("{}={}", k, value_to_string(v)))
        .collect();
    format!("{} ({})", template, parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::workflow::{StepSpec, Strategy};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn template(axes: serde_json::Value, labels: &[&str]) -> Arc<JobTemplate> {
        Arc::new(JobTemplate {
            name: "test".to_string(),
            strategy: Strategy {
                axes: axes.as_object().cloned().unwrap_or_default(),
                include: vec![],
                exclude: vec![],
            },
            required_labels: labels.iter().map(|s| s.to_string()).collect(),
            env: HashMap::from([("TARGET".to_string(), "${{ matrix.os }}".to_string())]),
            steps: vec![StepSpec {
                name: "run".to_string(),
                command: "cargo test".to_string(),
                env: HashMap::new(),
                retry_policy: None,
                continue_on_error: false,
                timeout_seconds: None,
                cache: vec![],
            }],
            fail_fast: true,
            max_parallel: None,
            cache: vec![],
        })
    }

    fn point(value: serde_json::Value) -> MatrixPoint {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_cartesian_product_order() {
        let t = template(json!({"p": ["a", "b"], "q": ["x", "y"]}), &[]);
        let instances = MatrixExpander::new().expand(&t);

        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test (p=a, q=x)",
                "test (p=a, q=y)",
                "test (p=b, q=x)",
                "test (p=b, q=y)",
            ]
        );
        let indices: Vec<_> = instances.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_axis_declaration_order_not_alphabetical() {
        let t = template(json!({"z": [1], "a": [2]}), &[]);
        let instances = MatrixExpander::new().expand(&t);
        assert_eq!(instances[0].name, "test (z=1, a=2)");
    }

    #[test]
    fn test_no_axes_yields_single_instance() {
        let t = template(json!({}), &["os=linux"]);
        let instances = MatrixExpander::new().expand(&t);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "test");
        assert!(instances[0].matrix.is_empty());
    }

    #[test]
    fn test_values_bound_into_labels_and_env() {
        let t = template(
            json!({"os": ["ubuntu-large", "macos"]}),
            &["os=${{ matrix.os }}", "docker"],
        );
        let instances = MatrixExpander::new().expand(&t);

        let first = &instances[0];
        assert_eq!(
            first.required_labels,
            BTreeSet::from(["docker".to_string(), "os=ubuntu-large".to_string()])
        );
        assert_eq!(first.env.get("TARGET").unwrap(), "ubuntu-large");
        assert_eq!(first.env.get("MATRIX_OS").unwrap(), "ubuntu-large");
        assert_eq!(instances[1].env.get("MATRIX_OS").unwrap(), "macos");
    }

    #[test]
    fn test_include_and_exclude() {
        let mut t = (*template(json!({"os": ["linux", "macos"], "rust": ["stable", "nightly"]}), &[]))
            .clone();
        t.strategy.exclude = vec![point(json!({"os": "macos", "rust": "nightly"}))];
        t.strategy.include = vec![
            point(json!({"os": "windows", "rust": "stable"})),
            point(json!({"os": "linux", "rust": "stable"})),
        ];
        let instances = MatrixExpander::new().expand(&Arc::new(t));

        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test (os=linux, rust=stable)",
                "test (os=linux, rust=nightly)",
                "test (os=macos, rust=stable)",
                "test (os=windows, rust=stable)",
            ]
        );
    }

    #[test]
    fn test_matrix_env_name() {
        assert_eq!(matrix_env_name("node-version"), "MATRIX_NODE_VERSION");
        assert_eq!(matrix_env_name("os"), "MATRIX_OS");
    }
}
