//! QuickJS-backed execution context.
//!
//! One runtime and one context live for the whole process. Snippets run as
//! global scripts, so `var` declarations and assignments to globals persist
//! across requests.

use anyhow::Result;
use rquickjs::context::EvalOptions;
use rquickjs::function::Rest;
use rquickjs::{Coerced, Context, Ctx, FromJs, Function, Object, Runtime, Value};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{inspect, is_identifier, EvalError, Evaluator};

/// Log target for `console.*` output produced by scripts.
pub const SCRIPT_LOG_TARGET: &str = "jsext::script";

const CONSOLE_LEVELS: [&str; 5] = ["log", "info", "warn", "error", "debug"];

/// Engine resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Heap limit for the script runtime, in megabytes.
    pub memory_limit_mb: Option<u64>,

    /// Maximum native stack the interpreter may use, in kilobytes.
    pub max_stack_kb: Option<u64>,
}

/// The process-wide script namespace.
///
/// Created once at startup and never reset. Not `Send`: it is shared
/// between sessions on a single thread.
pub struct JsContext {
    // Dropped before the runtime that owns it.
    context: Context,
    runtime: Runtime,
}

impl JsContext {
    /// Create a runtime with the given limits and a context with a `console`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let runtime =
            Runtime::new().map_err(|e| anyhow::anyhow!("Failed to create script runtime: {e}"))?;

        if let Some(mb) = config.memory_limit_mb {
            runtime.set_memory_limit(usize::try_from(mb.saturating_mul(1024 * 1024))?);
        }
        if let Some(kb) = config.max_stack_kb {
            runtime.set_max_stack_size(usize::try_from(kb.saturating_mul(1024))?);
        }

        let context = Context::full(&runtime)
            .map_err(|e| anyhow::anyhow!("Failed to create script context: {e}"))?;
        context
            .with(|ctx| install_console(&ctx))
            .map_err(|e| anyhow::anyhow!("Failed to install console: {e}"))?;

        debug!(?config, "Created script context");
        Ok(Self { context, runtime })
    }

    /// Run `f` inside the context, then settle any promise jobs it queued.
    fn run<T>(
        &self,
        f: impl for<'js> FnOnce(&Ctx<'js>) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        let result = self.context.with(|ctx| f(&ctx));
        self.drain_jobs();
        result
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => trace!("Ran pending job"),
                Ok(false) => break,
                Err(_) => warn!("Pending job threw an uncaught exception"),
            }
        }
    }
}

impl Evaluator for JsContext {
    #[instrument(skip_all, fields(len = code.len()))]
    fn execute(&mut self, code: &str) -> Result<(), EvalError> {
        self.run(|ctx| eval_value(ctx, code).map(drop))
    }

    #[instrument(skip_all, fields(len = code.len()))]
    fn evaluate(&mut self, code: &str) -> Result<serde_json::Value, EvalError> {
        self.run(|ctx| {
            let value = eval_value(ctx, code)?;
            to_json(ctx, value)
        })
    }

    #[instrument(skip_all, fields(len = code.len()))]
    fn evaluate_rendered(&mut self, code: &str) -> Result<String, EvalError> {
        self.run(|ctx| {
            let value = eval_value(ctx, code)?;
            inspect::render(&value).map_err(|e| caught(ctx, e))
        })
    }

    #[instrument(skip(self, value))]
    fn bind(&mut self, name: &str, value: &serde_json::Value) -> Result<(), EvalError> {
        if !is_identifier(name) {
            return Err(EvalError::new(
                "SyntaxError",
                format!("invalid variable name: {name:?}"),
            ));
        }
        let literal =
            serde_json::to_string(value).map_err(|e| EvalError::internal(e.to_string()))?;
        self.execute(&format!("var {name} = {literal};"))
    }
}

fn eval_value<'js>(ctx: &Ctx<'js>, code: &str) -> Result<Value<'js>, EvalError> {
    eval_global(ctx, code).map_err(|e| caught(ctx, e))
}

/// Evaluate `code` as a non-strict global script, the way an indirect
/// `eval` would: implicit globals, `with` and `var let` are all allowed.
pub(super) fn eval_global<'js, V: FromJs<'js>>(
    ctx: &Ctx<'js>,
    code: &str,
) -> rquickjs::Result<V> {
    let mut options = EvalOptions::default();
    options.strict = false;
    ctx.eval_with_options(code, options)
}

/// Serialize a script value with the engine's own `JSON.stringify`.
fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, EvalError> {
    let Some(text) = ctx.json_stringify(value).map_err(|e| caught(ctx, e))? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string().map_err(|e| caught(ctx, e))?;
    serde_json::from_str(&text).map_err(|e| EvalError::internal(e.to_string()))
}

/// Turn an engine error into an `EvalError`, taking the pending exception
/// if the script threw.
pub(super) fn caught(ctx: &Ctx<'_>, err: rquickjs::Error) -> EvalError {
    if matches!(err, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        return thrown_error(&thrown);
    }
    EvalError::internal(err.to_string())
}

fn thrown_error(thrown: &Value<'_>) -> EvalError {
    if let Some(obj) = thrown.as_object() {
        let name = obj.get::<_, Option<String>>("name").ok().flatten();
        let message = obj.get::<_, Option<String>>("message").ok().flatten();
        if let (Some(name), Some(message)) = (name, message) {
            return EvalError::new(name, message);
        }
    }
    let rendered =
        inspect::render(thrown).unwrap_or_else(|_| "<unrenderable value>".to_string());
    EvalError::new("Uncaught", rendered)
}

fn install_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for level in CONSOLE_LEVELS {
        let log = Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            script_log(level, &args.0);
        })?;
        console.set(level, log)?;
    }
    ctx.globals().set("console", console)
}

fn script_log(level: &str, args: &[Coerced<String>]) {
    let line = args
        .iter()
        .map(|arg| arg.0.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    match level {
        "error" => error!(target: SCRIPT_LOG_TARGET, "{line}"),
        "warn" => warn!(target: SCRIPT_LOG_TARGET, "{line}"),
        "debug" => debug!(target: SCRIPT_LOG_TARGET, "{line}"),
        _ => info!(target: SCRIPT_LOG_TARGET, "{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> JsContext {
        JsContext::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn var_declarations_persist() {
        let mut js = context();
        js.execute("var a = 1;").unwrap();
        assert_eq!(js.evaluate("a + 2").unwrap(), json!(3));
    }

    #[test]
    fn implicit_globals_persist() {
        let mut js = context();
        js.execute("y = 3").unwrap();
        assert_eq!(js.evaluate("y").unwrap(), json!(3));
    }

    #[test]
    fn sloppy_mode_constructs_are_accepted() {
        let mut js = context();
        assert_eq!(js.evaluate("with ({q: 1}) { q + 1 }").unwrap(), json!(2));
        js.bind("let", &json!(1)).unwrap();
        assert_eq!(js.evaluate("this.let").unwrap(), json!(1));
    }

    #[test]
    fn function_declarations_persist() {
        let mut js = context();
        js.execute("function double(n) { return n * 2; }").unwrap();
        assert_eq!(js.evaluate("double(21)").unwrap(), json!(42));
    }

    #[test]
    fn bind_then_use() {
        let mut js = context();
        js.bind("x", &json!(5)).unwrap();
        assert_eq!(js.evaluate("x + 1").unwrap(), json!(6));

        js.bind("cfg", &json!({"name": "demo", "tags": ["a", "b"]}))
            .unwrap();
        assert_eq!(js.evaluate("cfg.tags.length").unwrap(), json!(2));
        assert_eq!(js.evaluate("cfg.name").unwrap(), json!("demo"));
    }

    #[test]
    fn bind_overwrites() {
        let mut js = context();
        js.bind("x", &json!(1)).unwrap();
        js.bind("x", &json!("two")).unwrap();
        assert_eq!(js.evaluate("x").unwrap(), json!("two"));
    }

    #[test]
    fn bind_rejects_non_identifiers() {
        let mut js = context();
        let err = js.bind("a; globalThis.pwned = 1; var b", &json!(1)).unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(js.evaluate("typeof pwned").unwrap(), json!("undefined"));
    }

    #[test]
    fn bind_reserved_word_is_engine_syntax_error() {
        let mut js = context();
        let err = js.bind("if", &json!(1)).unwrap_err();
        assert_eq!(err.name, "SyntaxError");
    }

    #[test]
    fn undefined_name_is_reference_error() {
        let mut js = context();
        let err = js.evaluate("missing + 1").unwrap_err();
        assert_eq!(err.name, "ReferenceError");
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn syntax_error() {
        let mut js = context();
        let err = js.execute("var = ;").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        assert!(!err.message.is_empty());
    }

    #[test]
    fn thrown_error_object() {
        let mut js = context();
        let err = js.execute("throw new TypeError('bad input')").unwrap_err();
        assert_eq!(err, EvalError::new("TypeError", "bad input"));
    }

    #[test]
    fn thrown_primitive() {
        let mut js = context();
        let err = js.execute("throw 'oops'").unwrap_err();
        assert_eq!(err, EvalError::new("Uncaught", "'oops'"));
    }

    #[test]
    fn evaluate_returns_structured_json() {
        let mut js = context();
        assert_eq!(
            js.evaluate("({b: [1, 2], a: 'x', n: null})").unwrap(),
            json!({"b": [1, 2], "a": "x", "n": null})
        );
        assert_eq!(js.evaluate("1.5 * 2").unwrap(), json!(3));
        assert_eq!(js.evaluate("0.5").unwrap(), json!(0.5));
        assert_eq!(js.evaluate("'text'").unwrap(), json!("text"));
        assert_eq!(js.evaluate("true").unwrap(), json!(true));
    }

    #[test]
    fn unrepresentable_values_are_null() {
        let mut js = context();
        assert_eq!(js.evaluate("undefined").unwrap(), json!(null));
        assert_eq!(js.evaluate("(function f() {})").unwrap(), json!(null));
    }

    #[test]
    fn cyclic_value_is_type_error() {
        let mut js = context();
        js.execute("var loop = {}; loop.self = loop;").unwrap();
        let err = js.evaluate("loop").unwrap_err();
        assert_eq!(err.name, "TypeError");
    }

    #[test]
    fn failed_request_keeps_earlier_state() {
        let mut js = context();
        js.execute("var kept = 7;").unwrap();
        js.execute("kept = 8; throw new Error('late')").unwrap_err();
        assert_eq!(js.evaluate("kept").unwrap(), json!(8));
    }

    #[test]
    fn promise_jobs_settle_between_requests() {
        let mut js = context();
        js.execute("var settled = false; Promise.resolve().then(() => { settled = true; });")
            .unwrap();
        assert_eq!(js.evaluate("settled").unwrap(), json!(true));
    }

    #[test]
    fn console_is_available() {
        let mut js = context();
        js.execute("console.log('hello', 1, {}); console.error('bad');")
            .unwrap();
    }

    #[test]
    fn limits_are_accepted() {
        let mut js = JsContext::new(&EngineConfig {
            memory_limit_mb: Some(64),
            max_stack_kb: Some(512),
        })
        .unwrap();
        assert_eq!(js.evaluate("[1, 2, 3].length").unwrap(), json!(3));
    }
}
