/// Template interpolation over parameter trees
///
/// Strings may embed `{{ expr }}` fragments or be a whole-value `=expr`.
/// Fragment failures render as an empty string; a failing whole-value
/// expression leaves the literal untouched. Interpolation itself never fails.

use crate::runtime::expression::{EvalContext, ExpressionEvaluator};
use serde_json::{Map, Value};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone)]
pub struct TemplateInterpolator {
    evaluator: ExpressionEvaluator,
}

impl TemplateInterpolator {
    pub fn new(evaluator: ExpressionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    /// Recursively interpolate `value`. Object keys are never interpolated.
    pub fn interpolate(&self, value: &Value, context: &EvalContext) -> Value {
        match value {
            Value::String(s) => self.interpolate_str(s, context),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate(item, context))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(self.interpolate_map(map, context)),
            other => other.clone(),
        }
    }

    pub fn interpolate_map(&self, map: &Map<String, Value>, context: &EvalContext) -> Map<String, Value> {
        map.iter()
            .map(|(key, item)| (key.clone(), self.interpolate(item, context)))
            .collect()
    }

    fn interpolate_str(&self, raw: &str, context: &EvalContext) -> Value {
        let trimmed = raw.trim();

        if trimmed.contains(OPEN) {
            // "={{ a }} b" is the expression-mode spelling of "{{ a }} b"
            let template = match trimmed.strip_prefix('=') {
                Some(rest) => rest,
                None => raw,
            };
            return Value::String(self.render_fragments(template, context));
        }

        if trimmed.starts_with('=') {
            return match self.evaluator.evaluate(trimmed, context) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!("⚠️ Whole-value expression '{}' failed, keeping literal: {}", trimmed, e);
                    Value::String(raw.to_string())
                }
            };
        }

        Value::String(raw.to_string())
    }

    fn render_fragments(&self, template: &str, context: &EvalContext) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                break;
            };

            out.push_str(&rest[..start]);
            let expr = &after_open[..end];
            match self.evaluator.evaluate(expr, context) {
                Ok(value) => out.push_str(&stringify(&value)),
                Err(e) => {
                    tracing::debug!("⚠️ Template fragment '{}' failed, rendering empty: {}", expr.trim(), e);
                }
            }
            rest = &after_open[end + CLOSE.len()..];
        }

        out.push_str(rest);
        out
    }
}

/// Upper bound on the expressions interpolating `value` will evaluate
pub fn expression_count(value: &Value) -> usize {
    match value {
        Value::String(s) => {
            let fragments = s.matches(OPEN).count();
            if fragments == 0 && s.trim_start().starts_with('=') {
                1
            } else {
                fragments
            }
        }
        Value::Array(items) => items.iter().map(expression_count).sum(),
        Value::Object(fields) => fields.values().map(expression_count).sum(),
        _ => 0,
    }
}

/// Text form of a fragment result: strings verbatim, null as nothing,
/// objects and arrays as JSON, everything else via its JSON text
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::LuaSandbox;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn interpolator() -> TemplateInterpolator {
        TemplateInterpolator::new(ExpressionEvaluator::new(
            LuaSandbox::new(8 * 1024 * 1024),
            Duration::from_secs(1),
        ))
    }

    fn context() -> EvalContext {
        let p = json!({
            "Fetch": { "user": { "name": "ada", "age": 36 } },
            "user": { "name": "ada", "age": 36 },
            "count": 2
        });
        EvalContext::new(p.as_object().cloned().unwrap(), Map::new())
    }

    #[test]
    fn plain_strings_are_identity() {
        assert_eq!(interpolator().interpolate(&json!("hello"), &context()), json!("hello"));
        assert_eq!(interpolator().interpolate(&json!("  padded "), &context()), json!("  padded "));
    }

    #[test]
    fn inline_fragments_render_as_text() {
        let i = interpolator();
        assert_eq!(i.interpolate(&json!("{{ 1 + 1 }}"), &context()), json!("2"));
        assert_eq!(
            i.interpolate(&json!("Hi {{ $P.user.name }}, you are {{$P.user.age}}"), &context()),
            json!("Hi ada, you are 36")
        );
    }

    #[test]
    fn objects_in_fragments_are_json_stringified() {
        assert_eq!(
            interpolator().interpolate(&json!("u={{ $P.user }}"), &context()),
            json!(r#"u={"age":36,"name":"ada"}"#)
        );
    }

    #[test]
    fn failing_fragment_degrades_to_empty() {
        assert_eq!(
            interpolator().interpolate(&json!("a{{ $P.nope.deeper }}b{{ 1 }}"), &context()),
            json!("ab1")
        );
    }

    #[test]
    fn malformed_expressions_do_not_throw() {
        let i = interpolator();
        assert_eq!(i.interpolate(&json!("={{ }}"), &context()), json!(""));
        assert_eq!(i.interpolate(&json!("={{ 1 + }}"), &context()), json!(""));
        assert_eq!(i.interpolate(&json!("= 1 +"), &context()), json!("= 1 +"));
    }

    #[test]
    fn unterminated_fragment_is_left_literal() {
        assert_eq!(
            interpolator().interpolate(&json!("{{ 1 }} and {{ 2"), &context()),
            json!("1 and {{ 2")
        );
    }

    #[test]
    fn whole_value_expression_preserves_type() {
        let i = interpolator();
        assert_eq!(i.interpolate(&json!("=$P.count * 2"), &context()), json!(4));
        assert_eq!(i.interpolate(&json!("=$P.user"), &context()), json!({ "name": "ada", "age": 36 }));
        assert_eq!(i.interpolate(&json!("={{ $P.count }}"), &context()), json!("2"));
    }

    #[test]
    fn walks_nested_structures_without_touching_keys() {
        let params = json!({
            "{{ key }}": "{{ $P.count }}",
            "list": ["=$P.count + 1", 5, true, null],
            "nested": { "who": "{{ $P.Fetch.user.name }}" }
        });
        assert_eq!(
            interpolator().interpolate(&params, &context()),
            json!({
                "{{ key }}": "2",
                "list": [3, 5, true, null],
                "nested": { "who": "ada" }
            })
        );
    }

    #[test]
    fn counts_expressions_in_parameter_trees() {
        let params = json!({
            "plain": "hello",
            "whole": "=$P.count",
            "inline": "{{ $P.a }} and {{ $P.b }}",
            "nested": { "list": ["={{ $P.c }}", 3, null] }
        });
        assert_eq!(expression_count(&params), 4);
        assert_eq!(expression_count(&json!("no braces")), 0);
    }

    #[test]
    fn expensive_fragments_fail_soft() {
        let mut p = Map::new();
        p.insert("text".into(), json!("a".repeat(700)));
        let ctx = EvalContext::new(p, Map::new());
        let started = std::time::Instant::now();

        let rendered = interpolator().interpolate(&json!("[{{ $P.text:find('.-.-.-b') }}]"), &ctx);
        assert_eq!(rendered, json!("[]"));

        let whole = "=$P.text:match('(.*)(.*)(.*)b')";
        assert_eq!(interpolator().interpolate(&json!(whole), &ctx), json!(whole));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
