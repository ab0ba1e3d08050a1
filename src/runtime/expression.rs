/// Expression evaluator
///
/// Expressions are single Lua expressions evaluated in a fresh sandbox where
/// only `$P`, `$global` and `$inputs` are bound. The familiar `===`, `!==`,
/// `!=`, `&&`, `||` and `!` operators are accepted and rewritten to their Lua
/// spelling before evaluation.

use crate::{error::EvalError, runtime::sandbox::LuaSandbox};
use serde_json::{Map, Value};
use std::time::Duration;

/// Extra time async callers allow on top of the evaluation timeout
const AWAIT_GRACE: Duration = Duration::from_secs(1);

/// Read-only variables visible to an expression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    /// Union of all node outputs so far (`$P`)
    pub p: Value,
    /// Workflow globals merged with caller overrides (`$global`)
    pub global: Value,
    /// Inputs of the node being processed (`$inputs`)
    pub inputs: Value,
}

impl EvalContext {
    /// Context where `$inputs` aliases `$P`
    pub fn new(p: Map<String, Value>, global: Map<String, Value>) -> Self {
        let p = Value::Object(p);
        Self {
            inputs: p.clone(),
            p,
            global: Value::Object(global),
        }
    }
}

/// Time-bounded evaluator for single expressions
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    sandbox: LuaSandbox,
    timeout: Duration,
}

impl ExpressionEvaluator {
    pub fn new(sandbox: LuaSandbox, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    /// How long async code should wait for one evaluation before giving up on it
    pub fn await_limit(&self) -> Duration {
        self.timeout + AWAIT_GRACE
    }

    /// Evaluate `expr` against `context`. A leading `=` is ignored.
    pub fn evaluate(&self, expr: &str, context: &EvalContext) -> Result<Value, EvalError> {
        let trimmed = expr.trim();
        let body = trimmed.strip_prefix('=').unwrap_or(trimmed).trim();
        if body.is_empty() {
            return Err(EvalError::Empty);
        }

        let source = to_lua_source(body);
        tracing::trace!("🧮 Evaluating expression: {} -> {}", body, source);

        self.sandbox.eval_expression(
            &source,
            &[
                ("P", &context.p),
                ("global", &context.global),
                ("inputs", &context.inputs),
            ],
            self.timeout,
        )
    }

    /// Evaluate a routing condition. Accepts a bare expression or one wrapped
    /// in `{{ }}`; the result is judged by [`is_truthy`].
    pub fn evaluate_condition(&self, condition: &str, context: &EvalContext) -> Result<bool, EvalError> {
        let trimmed = condition.trim();
        let trimmed = trimmed.strip_prefix('=').unwrap_or(trimmed).trim();
        let body = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed);
        self.evaluate(body, context).map(|value| is_truthy(&value))
    }
}

/// `null`, `false`, `0`, `NaN` and `""` are falsy; everything else is truthy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Rewrite the expression dialect into plain Lua
///
/// `$name` becomes `name`, and the C-style comparison and logical operators
/// become `==`, `~=`, `and`, `or`, `not`. String literals are left untouched.
pub fn to_lua_source(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len() + 8);
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = next {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match (c, next) {
            ('"', _) | ('\'', _) => {
                quote = Some(c);
                out.push(c);
            }
            ('$', Some(n)) if n.is_alphabetic() || n == '_' => {}
            ('=', Some('=')) if chars.get(i + 2) == Some(&'=') => {
                out.push_str("==");
                i += 2;
            }
            ('!', Some('=')) => {
                out.push_str("~=");
                i += if chars.get(i + 2) == Some(&'=') { 2 } else { 1 };
            }
            ('!', _) => out.push_str(" not "),
            ('&', Some('&')) => {
                out.push_str(" and ");
                i += 1;
            }
            ('|', Some('|')) => {
                out.push_str(" or ");
                i += 1;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new(LuaSandbox::new(8 * 1024 * 1024), Duration::from_secs(1))
    }

    fn context() -> EvalContext {
        let p = json!({ "A": { "x": 3 }, "x": 3, "name": "ada" });
        let global = json!({ "base": 10 });
        EvalContext::new(
            p.as_object().cloned().unwrap(),
            global.as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn rewrites_dialect_outside_strings() {
        assert_eq!(to_lua_source("$P.x === 1 && !$global.off"), "P.x == 1  and   not global.off");
        assert_eq!(to_lua_source("$inputs.a !== 'a && $b'"), "inputs.a ~= 'a && $b'");
        assert_eq!(to_lua_source("a != b || c"), "a ~= b  or  c");
        assert_eq!(to_lua_source("a ~= b"), "a ~= b");
        assert_eq!(to_lua_source("\"it\\\"s $P\""), "\"it\\\"s $P\"");
    }

    #[test]
    fn evaluates_arithmetic() {
        assert_eq!(evaluator().evaluate("1 + 1", &context()).unwrap(), json!(2));
    }

    #[test]
    fn strips_leading_equals() {
        assert_eq!(evaluator().evaluate("=$P.A.x + $global.base", &context()).unwrap(), json!(13));
    }

    #[test]
    fn inputs_alias_p() {
        assert_eq!(evaluator().evaluate("$inputs.name", &context()).unwrap(), json!("ada"));
    }

    #[test]
    fn empty_expression_is_an_error() {
        assert_eq!(evaluator().evaluate(" = ", &context()), Err(EvalError::Empty));
    }

    #[test]
    fn runtime_errors_surface() {
        let err = evaluator().evaluate("$P.missing.field", &context()).unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)));
    }

    #[test]
    fn conditions_use_truthiness() {
        let eval = evaluator();
        assert!(eval.evaluate_condition("$P.x > 2", &context()).unwrap());
        assert!(!eval.evaluate_condition("{{ $P.x === 4 }}", &context()).unwrap());
        assert!(!eval.evaluate_condition("$P.x - 3", &context()).unwrap());
        assert!(eval.evaluate_condition("$P.name", &context()).unwrap());
    }

    #[test]
    fn truthiness_table() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!(-1.5)));
    }

    #[test]
    fn null_fields_are_falsy_in_both_polarities() {
        let p = json!({ "flag": null, "items": [] });
        let ctx = EvalContext::new(p.as_object().cloned().unwrap(), Map::new());
        let eval = evaluator();

        assert!(!eval.evaluate_condition("$P.flag", &ctx).unwrap());
        assert!(eval.evaluate_condition("!$P.flag", &ctx).unwrap());
        assert!(eval.evaluate_condition("$P.flag === nil", &ctx).unwrap());
        assert_eq!(eval.evaluate("$P.items", &ctx).unwrap(), json!([]));
    }

    #[test]
    fn slow_native_calls_are_refused() {
        let started = std::time::Instant::now();
        let err = evaluator()
            .evaluate("('a'):rep(700):find('.-.-.-b')", &context())
            .unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
