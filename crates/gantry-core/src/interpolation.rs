//! `${{ ... }}` template substitution.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("expression regex is valid"));

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Plain variables: `workflow`, `ref_name`, `sha`, ...
    pub variables: HashMap<String, String>,
    /// Matrix values for the current job instance.
    pub matrix: HashMap<String, String>,
    /// Environment visible to the step.
    pub env: HashMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matrix(mut self, matrix: HashMap<String, String>) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - environment lookup
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ a || b }}` (or `a | b`) - first non-empty alternative
    ///
    /// Unknown names resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str());
                self.resolve_alternatives(expr)
            })
            .into_owned()
    }

    /// True when the input still contains an expression after one pass.
    pub fn has_expressions(input: &str) -> bool {
        EXPRESSION.is_match(input)
    }

    fn resolve_alternatives(&self, expr: &str) -> String {
        expr.split("||")
            .flat_map(|part| part.split('|'))
            .map(|alt| self.resolve_expression(alt.trim()))
            .find(|value| !value.is_empty())
            .unwrap_or_default()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(literal) = expr
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return literal.to_string();
        }

        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.env.get(var_name).cloned().unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.variables.insert("workflow".into(), "ci".into());
        ctx.variables.insert("ref_name".into(), "main".into());
        ctx.variables.insert("sha".into(), "deadbeef".into());
        ctx.matrix.insert("os".into(), "ubuntu-large".into());
        ctx.env.insert("CARGO_TERM_COLOR".into(), "always".into());
        ctx
    }

    #[test]
    fn test_plain_variables() {
        assert_eq!(
            ctx().interpolate("${{ workflow }}-${{ref_name}}"),
            "ci-main"
        );
    }

    #[test]
    fn test_matrix_and_env() {
        let c = ctx();
        assert_eq!(c.interpolate("os=${{ matrix.os }}"), "os=ubuntu-large");
        assert_eq!(c.interpolate("${{ env.CARGO_TERM_COLOR }}"), "always");
    }

    #[test]
    fn test_fallback_picks_first_non_empty() {
        let c = ctx();
        assert_eq!(c.interpolate("${{ pr_number || sha }}"), "deadbeef");
        assert_eq!(c.interpolate("${{ pr_number | sha }}"), "deadbeef");

        let mut with_pr = ctx();
        with_pr.variables.insert("pr_number".into(), "42".into());
        assert_eq!(with_pr.interpolate("${{ pr_number || sha }}"), "42");
    }

    #[test]
    fn test_unknown_resolves_empty_and_literals() {
        let c = ctx();
        assert_eq!(c.interpolate("[${{ nope }}]"), "[]");
        assert_eq!(c.interpolate("${{ nope || 'fallback' }}"), "fallback");
    }

    #[test]
    fn test_text_without_expressions_is_untouched() {
        assert_eq!(ctx().interpolate("cargo fmt --check"), "cargo fmt --check");
        assert!(!InterpolationContext::has_expressions("cargo test"));
    }
}
