/// Isolated Lua sandbox for expressions and script nodes
///
/// Every evaluation gets a brand-new Lua state with a reduced standard library,
/// a memory cap and a wall-clock deadline enforced from an instruction hook.
/// The state lives on its own worker thread so a native call the hook cannot
/// interrupt still returns to the caller on time. Data enters and leaves the
/// state as JSON, so nothing from the host process is reachable from inside.

use crate::error::EvalError;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState};
use serde_json::{Map, Number, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// How often (in VM instructions) the deadline is checked
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Slack on top of the VM deadline before the watchdog abandons a worker
const WATCHDOG_GRACE: Duration = Duration::from_millis(250);

/// `string` functions backed by the backtracking pattern matcher
const PATTERN_FUNCTIONS: &[&str] = &["find", "match", "gmatch", "gsub"];

/// Estimated matcher steps allowed for a single pattern call
const MAX_PATTERN_WORK: f64 = 2.0e8;

/// Deepest table nesting converted back to JSON; also stops self-referencing tables
const MAX_CONVERSION_DEPTH: usize = 64;

/// Base-library functions that could escape the sandbox or tamper with it
const REMOVED_GLOBALS: &[&str] = &[
    "dofile",
    "loadfile",
    "load",
    "require",
    "collectgarbage",
    "rawget",
    "rawset",
    "rawequal",
    "getmetatable",
    "setmetatable",
    "print",
    "_G",
];

/// Result of a script run: the returned value plus captured `print` lines
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub value: Value,
    pub logs: Vec<String>,
}

/// Factory for short-lived, isolated Lua states
#[derive(Debug, Clone)]
pub struct LuaSandbox {
    memory_limit: usize,
}

impl LuaSandbox {
    /// `memory_limit` in bytes; 0 disables the cap
    pub fn new(memory_limit: usize) -> Self {
        Self { memory_limit }
    }

    /// Evaluate `source` as a single Lua expression with `bindings` as the only globals
    pub fn eval_expression(
        &self,
        source: &str,
        bindings: &[(&str, &Value)],
        timeout: Duration,
    ) -> Result<Value, EvalError> {
        let sandbox = self.clone();
        let chunk = format!("return {source}");
        let bindings: Vec<(String, Value)> = bindings
            .iter()
            .map(|(name, value)| (name.to_string(), (*value).clone()))
            .collect();

        run_bounded(timeout, move || {
            let lua = sandbox.create_state()?;
            let globals = lua.globals();
            for (name, value) in &bindings {
                globals
                    .set(name.as_str(), json_to_lua(&lua, value)?)
                    .map_err(sandbox_error)?;
            }

            let deadline = Deadline::arm(&lua, timeout);
            let result: mlua::Value = lua
                .load(chunk.as_str())
                .set_name("expression")
                .eval()
                .map_err(|e| deadline.classify(e))?;

            lua_to_json(&lua, result)
        })
    }

    /// Run `body` as the body of a function whose single parameter is `input`
    pub fn run_function_body(
        &self,
        body: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<ScriptOutput, EvalError> {
        let sandbox = self.clone();
        let source = format!("local input = ...\n{body}");
        let input = input.clone();

        run_bounded(timeout, move || {
            let lua = sandbox.create_state()?;
            let logs = Arc::new(Mutex::new(Vec::new()));
            install_print_capture(&lua, Arc::clone(&logs))?;

            let function = lua
                .load(source.as_str())
                .set_name("script")
                .into_function()
                .map_err(classify_lua_error)?;

            let input = json_to_lua(&lua, &input)?;
            let deadline = Deadline::arm(&lua, timeout);
            let result: mlua::Value = function.call(input).map_err(|e| deadline.classify(e))?;

            let value = lua_to_json(&lua, result)?;
            let logs = logs.lock().map(|lines| lines.clone()).unwrap_or_default();
            Ok(ScriptOutput { value, logs })
        })
    }

    fn create_state(&self) -> Result<Lua, EvalError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(sandbox_error)?;

        if self.memory_limit > 0 {
            lua.set_memory_limit(self.memory_limit).map_err(sandbox_error)?;
        }

        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(*name, mlua::Nil).map_err(sandbox_error)?;
        }
        guard_pattern_functions(&lua).map_err(sandbox_error)?;

        Ok(lua)
    }
}

/// Run `work` on a dedicated thread and stop waiting once `timeout` (plus a
/// short grace) has passed. An abandoned worker keeps its own Lua state and
/// is reaped when its native call returns.
fn run_bounded<T, F>(timeout: Duration, work: F) -> Result<T, EvalError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EvalError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("relayflow-lua".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|e| EvalError::Sandbox(format!("failed to spawn evaluation thread: {e}")))?;

    match rx.recv_timeout(timeout + WATCHDOG_GRACE) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!("⏰ Lua evaluation still busy after {:?}, abandoning worker", timeout);
            Err(EvalError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(EvalError::Sandbox("evaluation thread exited without a result".to_string()))
        }
    }
}

/// Replace the pattern-matching `string` functions with wrappers that refuse
/// calls whose worst-case backtracking cost is out of reach of the deadline.
/// Method calls (`s:find(..)`) resolve through the same `string` table.
fn guard_pattern_functions(lua: &Lua) -> mlua::Result<()> {
    let string: mlua::Table = lua.globals().get("string")?;
    for name in PATTERN_FUNCTIONS {
        let native: mlua::Function = string.get(*name)?;
        let honours_plain = *name == "find";
        let guarded = lua.create_function(move |_, args: mlua::MultiValue| {
            check_pattern_work(&args, honours_plain)?;
            native.call::<mlua::MultiValue>(args)
        })?;
        string.set(*name, guarded)?;
    }
    Ok(())
}

fn check_pattern_work(args: &mlua::MultiValue, honours_plain: bool) -> mlua::Result<()> {
    let (Some(mlua::Value::String(subject)), Some(mlua::Value::String(pattern))) =
        (args.get(0), args.get(1))
    else {
        return Ok(());
    };
    let plain = matches!(args.get(3), Some(flag) if !matches!(flag, mlua::Value::Nil | mlua::Value::Boolean(false)));
    if honours_plain && plain {
        return Ok(());
    }

    let quantifiers = backtracking_quantifiers(&pattern.as_bytes());
    if quantifiers == 0 {
        return Ok(());
    }

    // Each unbounded quantifier can retry every remaining position
    let subject_len = subject.as_bytes().len();
    let work = (subject_len as f64 + 1.0).powi(quantifiers as i32 + 1);
    if work > MAX_PATTERN_WORK {
        return Err(mlua::Error::runtime(format!(
            "pattern too complex for a {subject_len}-byte subject ({quantifiers} repetition operators)"
        )));
    }
    Ok(())
}

/// Count `*`, `+` and `-` repetition operators, skipping escapes and sets
fn backtracking_quantifiers(pattern: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            b'%' => i += 2,
            b'[' => i = skip_set(pattern, i + 1),
            b'*' | b'+' | b'-' => {
                count += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    count
}

/// Index just past the `]` closing a set that opened before `i`
fn skip_set(pattern: &[u8], mut i: usize) -> usize {
    if pattern.get(i) == Some(&b'^') {
        i += 1;
    }
    // leading `]` is a literal member
    if pattern.get(i) == Some(&b']') {
        i += 1;
    }
    while i < pattern.len() {
        match pattern[i] {
            b'%' => i += 2,
            b']' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// Wall-clock deadline checked from a VM hook
struct Deadline {
    timeout: Duration,
    expired: Arc<AtomicBool>,
}

impl Deadline {
    fn arm(lua: &Lua, timeout: Duration) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        let deadline = Instant::now() + timeout;

        let _ = lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_, _| {
                if Instant::now() >= deadline {
                    flag.store(true, Ordering::Relaxed);
                    return Err(mlua::Error::runtime("execution deadline exceeded"));
                }
                Ok(VmState::Continue)
            },
        );

        Self { timeout, expired }
    }

    fn classify(&self, error: mlua::Error) -> EvalError {
        if self.expired.load(Ordering::Relaxed) {
            return EvalError::Timeout(self.timeout);
        }
        classify_lua_error(error)
    }
}

fn install_print_capture(lua: &Lua, sink: Arc<Mutex<Vec<String>>>) -> Result<(), EvalError> {
    let print = lua
        .create_function(move |lua, args: mlua::Variadic<mlua::Value>| {
            let line = args
                .iter()
                .map(|arg| display_lua(lua, arg.clone()))
                .collect::<Vec<_>>()
                .join("\t");
            if let Ok(mut lines) = sink.lock() {
                lines.push(line);
            }
            Ok(())
        })
        .map_err(sandbox_error)?;

    lua.globals().set("print", print).map_err(sandbox_error)
}

fn display_lua(lua: &Lua, value: mlua::Value) -> String {
    match value {
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => match lua_to_json(lua, other) {
            Ok(Value::Null) => "nil".to_string(),
            Ok(json) => json.to_string(),
            Err(_) => "<unprintable>".to_string(),
        },
    }
}

fn classify_lua_error(error: mlua::Error) -> EvalError {
    match error {
        mlua::Error::SyntaxError { message, .. } => EvalError::Syntax(message),
        mlua::Error::MemoryError(message) => {
            EvalError::Runtime(format!("memory limit exceeded: {message}"))
        }
        other => EvalError::Runtime(other.to_string()),
    }
}

fn sandbox_error(error: mlua::Error) -> EvalError {
    EvalError::Sandbox(error.to_string())
}

/// JSON null becomes `nil`, so a null field and a missing one read the same
fn json_to_lua(lua: &Lua, value: &Value) -> Result<mlua::Value, EvalError> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options).map_err(sandbox_error)
}

/// Convert a Lua value to JSON
///
/// Tables that came in as JSON arrays keep their array marker, so they convert
/// back to arrays even when empty or holding nulls. Other tables with contiguous
/// integer keys starting at 1 become arrays, any other table becomes an object.
/// Whole floats become integers. Functions, threads and userdata become null.
fn lua_to_json(lua: &Lua, value: mlua::Value) -> Result<Value, EvalError> {
    convert(value, &lua.array_metatable(), 0)
}

fn convert(value: mlua::Value, array_metatable: &mlua::Table, depth: usize) -> Result<Value, EvalError> {
    if depth > MAX_CONVERSION_DEPTH {
        return Err(EvalError::Runtime(format!(
            "value nested deeper than {MAX_CONVERSION_DEPTH} levels"
        )));
    }

    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(Number::from(i))),
        mlua::Value::Number(f) => Ok(float_to_json(f)),
        mlua::Value::String(s) => Ok(Value::String(s.to_string_lossy().to_string())),
        mlua::Value::Table(table) => {
            let mut integer_keys = true;
            let mut max_index = 0usize;
            let mut count = 0usize;

            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| EvalError::Runtime(e.to_string()))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        integer_keys = false;
                        break;
                    }
                }
            }

            let marked_array = table.metatable().as_ref() == Some(array_metatable);
            if integer_keys && (marked_array || (count > 0 && count == max_index)) {
                let mut items = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let item: mlua::Value = table
                        .raw_get(i)
                        .map_err(|e| EvalError::Runtime(e.to_string()))?;
                    items.push(convert(item, array_metatable, depth + 1)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, item) = pair.map_err(|e| EvalError::Runtime(e.to_string()))?;
                let key = match key {
                    mlua::Value::String(s) => s.to_string_lossy().to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, convert(item, array_metatable, depth + 1)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}

fn float_to_json(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(f as i64));
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sandbox() -> LuaSandbox {
        LuaSandbox::new(8 * 1024 * 1024)
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn evaluates_against_bindings() {
        let data = json!({ "a": { "x": 4 } });
        let value = sandbox()
            .eval_expression("P.a.x * 2", &[("P", &data)], SECOND)
            .unwrap();
        assert_eq!(value, json!(8));
    }

    #[test]
    fn converts_tables_back_to_json() {
        let value = sandbox()
            .eval_expression("{ 1, 2, 3 }", &[], SECOND)
            .unwrap();
        assert_eq!(value, json!([1, 2, 3]));

        let value = sandbox()
            .eval_expression("{ name = 'x', tags = { 'a' } }", &[], SECOND)
            .unwrap();
        assert_eq!(value, json!({ "name": "x", "tags": ["a"] }));
    }

    #[test]
    fn whole_floats_become_integers() {
        let value = sandbox().eval_expression("4 / 2", &[], SECOND).unwrap();
        assert_eq!(value, json!(2));
        let value = sandbox().eval_expression("5 / 2", &[], SECOND).unwrap();
        assert_eq!(value, json!(2.5));
    }

    #[test]
    fn host_libraries_are_not_reachable() {
        for source in ["os.time()", "io.open('/etc/passwd')", "require('os')", "load('return 1')()"] {
            let err = sandbox().eval_expression(source, &[], SECOND).unwrap_err();
            assert!(matches!(err, EvalError::Runtime(_)), "{source}: {err:?}");
        }
    }

    #[test]
    fn syntax_errors_are_classified() {
        let err = sandbox().eval_expression("1 +", &[], SECOND).unwrap_err();
        assert!(matches!(err, EvalError::Syntax(_)), "{err:?}");
    }

    #[test]
    fn runaway_loops_time_out() {
        let started = Instant::now();
        let err = sandbox()
            .run_function_body("while true do end", &Value::Null, Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err, EvalError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn function_body_receives_input_and_captures_print() {
        let output = sandbox()
            .run_function_body(
                "print('seen', input.x)\nreturn { doubled = input.x * 2 }",
                &json!({ "x": 21 }),
                SECOND,
            )
            .unwrap();
        assert_eq!(output.value, json!({ "doubled": 42 }));
        assert_eq!(output.logs, vec!["seen\t21".to_string()]);
    }

    #[test]
    fn self_referencing_tables_are_rejected() {
        let err = sandbox()
            .run_function_body("local t = {}\nt.me = t\nreturn t", &Value::Null, SECOND)
            .unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)));
    }

    #[test]
    fn memory_limit_is_enforced() {
        let small = LuaSandbox::new(256 * 1024);
        let err = small
            .run_function_body(
                "local t = {}\nfor i = 1, 1000000 do t[i] = string.rep('x', 64) .. i end\nreturn #t",
                &Value::Null,
                Duration::from_secs(5),
            )
            .unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)), "{err:?}");
    }

    #[test]
    fn catastrophic_patterns_fail_fast() {
        let started = Instant::now();
        for source in [
            "('a'):rep(700):find('.-.-.-b')",
            "string.match(string.rep('a', 700), '(.*)(.*)(.*)b')",
            "select(2, ('x'):rep(5000):gsub('.-.-y', ''))",
        ] {
            let err = sandbox().eval_expression(source, &[], SECOND).unwrap_err();
            match err {
                EvalError::Runtime(message) => {
                    assert!(message.contains("pattern too complex"), "{source}: {message}")
                }
                other => panic!("{source}: {other:?}"),
            }
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ordinary_patterns_still_work() {
        let value = sandbox()
            .eval_expression("(P.csv:gsub(',%s*', ';'))", &[("P", &json!({ "csv": "a, b,c" }))], SECOND)
            .unwrap();
        assert_eq!(value, json!("a;b;c"));

        let value = sandbox()
            .eval_expression("('a.b'):find('.', 1, true)", &[], SECOND)
            .unwrap();
        assert_eq!(value, json!(2));

        let value = sandbox()
            .eval_expression("('order-42'):match('%d+')", &[], SECOND)
            .unwrap();
        assert_eq!(value, json!("42"));
    }

    #[test]
    fn counts_repetition_operators_outside_escapes_and_sets() {
        assert_eq!(backtracking_quantifiers(b".-.-.-b"), 3);
        assert_eq!(backtracking_quantifiers(b"%d+"), 1);
        assert_eq!(backtracking_quantifiers(b"a%-b%*"), 0);
        assert_eq!(backtracking_quantifiers(b"[a-z]"), 0);
        assert_eq!(backtracking_quantifiers(b"[]-]*x"), 1);
    }

    #[test]
    fn watchdog_returns_while_worker_is_stuck() {
        let started = Instant::now();
        let err = run_bounded(Duration::from_millis(50), || {
            thread::sleep(Duration::from_secs(3));
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err, EvalError::Timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn empty_arrays_stay_arrays() {
        let input = json!({ "items": [], "nested": { "tags": [] } });
        let output = sandbox()
            .run_function_body("return input.items", &input, SECOND)
            .unwrap();
        assert_eq!(output.value, json!([]));

        let value = sandbox()
            .eval_expression("P.nested", &[("P", &input)], SECOND)
            .unwrap();
        assert_eq!(value, json!({ "tags": [] }));

        let output = sandbox()
            .run_function_body("return {}", &Value::Null, SECOND)
            .unwrap();
        assert_eq!(output.value, json!({}));
    }

    #[test]
    fn array_positions_survive_nulls() {
        let data = json!({ "list": [1, null, 3] });
        let value = sandbox()
            .eval_expression("P.list", &[("P", &data)], SECOND)
            .unwrap();
        assert_eq!(value, json!([1, null, 3]));
    }

    #[test]
    fn null_fields_are_nil_inside_lua() {
        let data = json!({ "flag": null });
        let bindings = [("P", &data)];
        let value = sandbox().eval_expression("P.flag == nil", &bindings, SECOND).unwrap();
        assert_eq!(value, json!(true));
        let value = sandbox().eval_expression("not P.flag", &bindings, SECOND).unwrap();
        assert_eq!(value, json!(true));
        let value = sandbox().eval_expression("P.flag", &bindings, SECOND).unwrap();
        assert_eq!(value, Value::Null);
    }
}
