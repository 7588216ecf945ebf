//! Human-readable rendering of script values.
//!
//! Produces the same shape of text a Node.js REPL prints: quoted strings,
//! `{ a: 1 }` objects, `[ 1, 2 ]` arrays, `[Function: f]`, and so on.
//! Unlike JSON it never fails on cycles, functions or `undefined`.

use rquickjs::promise::PromiseState;
use rquickjs::{Array, Coerced, Ctx, FromJs, Function, Object, Result, Type, Value};

use super::is_identifier;
use super::quickjs::{caught, eval_global};

/// Nesting level past which objects collapse to `[Object]`.
const MAX_DEPTH: usize = 2;

/// Array elements shown before the remainder is summarised.
const MAX_ARRAY_ITEMS: usize = 100;

/// Width a collection may take before it is split over several lines.
const BREAK_LENGTH: usize = 80;

/// Columns reserved beyond the entries themselves when measuring a line.
const LINE_SLACK: usize = 10;

const SYMBOL_TEXT: &str = "(s) => s.toString()";
const DATE_TEXT: &str = "(d) => isNaN(d) ? 'Invalid Date' : d.toISOString()";

// Own enumerable keys with their descriptors, so accessors are never invoked.
const DESCRIBE_TEXT: &str = "(o) => Object.keys(o).map((k) => {
    const d = Object.getOwnPropertyDescriptor(o, k);
    if (d === undefined || 'value' in d) return [k, d && d.value];
    return [k, undefined, d.get ? (d.set ? 'Getter/Setter' : 'Getter') : 'Setter'];
})";

const COLLECTION_TEXT: &str = "(c) => c instanceof Map
    ? ['Map', Array.from(Map.prototype.entries.call(c))]
    : c instanceof Set
    ? ['Set', Array.from(Set.prototype.values.call(c))]
    : null";

/// Render `value` as display text.
pub fn render(value: &Value<'_>) -> Result<String> {
    Inspector::default().format(value, 0)
}

#[derive(Default)]
struct Inspector<'js> {
    /// Objects on the current path, for cycle detection.
    seen: Vec<Value<'js>>,
}

impl<'js> Inspector<'js> {
    fn format(&mut self, value: &Value<'js>, depth: usize) -> Result<String> {
        match value.type_of() {
            Type::Undefined => Ok("undefined".to_string()),
            Type::Null => Ok("null".to_string()),
            Type::Bool => Ok(value.as_bool().unwrap_or_default().to_string()),
            Type::Int | Type::Float => format_number(value),
            Type::String => Ok(quote(&value.get::<String>()?)),
            Type::BigInt => Ok(format!("{}n", coerce(value)?)),
            Type::Symbol => call_helper(value, SYMBOL_TEXT),
            Type::Function | Type::Constructor => format_function(value),
            Type::Exception => format_error(value),
            Type::Promise => self.format_promise(value, depth),
            _ if value.as_object().is_some() => self.format_object(value, depth),
            _ => coerce(value),
        }
    }

    fn format_object(&mut self, value: &Value<'js>, depth: usize) -> Result<String> {
        let Some(obj) = value.as_object() else {
            return coerce(value);
        };
        let is_array = value.is_array();
        let ctor = constructor_name(obj);

        match ctor.as_deref() {
            Some("Date") => return call_helper(value, DATE_TEXT),
            Some("RegExp") => return coerce(value),
            _ => {}
        }

        if self.seen.iter().any(|seen| seen == value) {
            return Ok("[Circular]".to_string());
        }

        if depth > MAX_DEPTH {
            return Ok(match (is_array, ctor.as_deref()) {
                (true, _) => "[Array]".to_string(),
                (false, Some(name)) => format!("[{name}]"),
                (false, None) => "[Object: null prototype]".to_string(),
            });
        }

        let prefix = match (is_array, ctor.as_deref()) {
            (true, Some("Array")) | (false, Some("Object")) => String::new(),
            (_, Some(name)) => format!("{name} "),
            (true, None) => "[Array: null prototype] ".to_string(),
            (false, None) => "[Object: null prototype] ".to_string(),
        };

        if !is_array {
            if let Some((kind, items)) = collection(value) {
                return self.format_collection(value, ctor.as_deref(), &kind, &items, depth);
            }
        }

        self.seen.push(value.clone());
        let entries = if is_array {
            self.array_entries(value, depth)
        } else {
            self.object_entries(obj, depth)
        };
        self.seen.pop();

        let (open, close) = if is_array { ("[", "]") } else { ("{", "}") };
        Ok(format!(
            "{prefix}{}",
            layout(&entries?, open, close, depth, prefix.len())
        ))
    }

    /// `Map(n) { k => v }` or `Set(n) { v }`; subclasses add `[Map]`/`[Set]`.
    fn format_collection(
        &mut self,
        value: &Value<'js>,
        ctor: Option<&str>,
        kind: &str,
        items: &Array<'js>,
        depth: usize,
    ) -> Result<String> {
        let prefix = match ctor {
            Some(name) if name == kind => format!("{kind}({}) ", items.len()),
            Some(name) => format!("{name}({}) [{kind}] ", items.len()),
            None => format!("[{kind}({}): null prototype] ", items.len()),
        };

        self.seen.push(value.clone());
        let entries = self.collection_entries(kind, items, depth);
        self.seen.pop();

        Ok(format!("{prefix}{}", layout(&entries?, "{", "}", depth, prefix.len())))
    }

    fn collection_entries(
        &mut self,
        kind: &str,
        items: &Array<'js>,
        depth: usize,
    ) -> Result<Vec<String>> {
        let mut entries = Vec::with_capacity(items.len());
        for item in items.iter::<Value<'js>>() {
            let item = item?;
            if kind != "Map" {
                entries.push(self.format(&item, depth + 1)?);
                continue;
            }
            let Some(pair) = item.as_array() else {
                continue;
            };
            let key = self.format(&pair.get(0)?, depth + 1)?;
            let val = self.format(&pair.get(1)?, depth + 1)?;
            entries.push(format!("{key} => {val}"));
        }
        Ok(entries)
    }

    /// `Promise { value }`, `Promise { <pending> }` or
    /// `Promise { <rejected> reason }`.
    fn format_promise(&mut self, value: &Value<'js>, depth: usize) -> Result<String> {
        if depth > MAX_DEPTH {
            return Ok("[Promise]".to_string());
        }
        let Some(promise) = value.as_promise() else {
            return coerce(value);
        };

        let entry = match promise.state() {
            PromiseState::Pending => "<pending>".to_string(),
            PromiseState::Resolved => {
                let settled: Value<'js> = promise
                    .result()
                    .unwrap_or_else(|| Ok(Value::new_undefined(value.ctx().clone())))?;
                self.format(&settled, depth + 1)?
            }
            PromiseState::Rejected => {
                // Reading a rejection rethrows the reason; take it back.
                let reason = match promise.result::<Value<'js>>() {
                    Some(Err(rquickjs::Error::Exception)) => value.ctx().catch(),
                    Some(Ok(reason)) => reason,
                    Some(Err(e)) => return Err(e),
                    None => Value::new_undefined(value.ctx().clone()),
                };
                format!("<rejected> {}", self.format(&reason, depth + 1)?)
            }
        };

        let prefix = "Promise ";
        Ok(format!(
            "{prefix}{}",
            layout(&[entry], "{", "}", depth, prefix.len())
        ))
    }

    fn array_entries(&mut self, value: &Value<'js>, depth: usize) -> Result<Vec<String>> {
        let Some(array) = value.as_array() else {
            return Ok(Vec::new());
        };
        let len = array.len();
        let mut entries = Vec::with_capacity(len.min(MAX_ARRAY_ITEMS) + 1);
        for i in 0..len.min(MAX_ARRAY_ITEMS) {
            match array.get::<Value<'js>>(i) {
                Ok(item) => entries.push(self.format(&item, depth + 1)?),
                Err(e) => entries.push(unreadable(value.ctx(), e)),
            }
        }
        match len.saturating_sub(MAX_ARRAY_ITEMS) {
            0 => {}
            1 => entries.push("... 1 more item".to_string()),
            rest => entries.push(format!("... {rest} more items")),
        }
        Ok(entries)
    }

    /// Render own enumerable properties. Accessors show as `[Getter]`,
    /// `[Setter]` or `[Getter/Setter]` and are not called; an object whose
    /// keys cannot be listed renders a single `<unreadable ...>` entry.
    fn object_entries(&mut self, obj: &Object<'js>, depth: usize) -> Result<Vec<String>> {
        let ctx = obj.ctx();
        let described = match helper(ctx, DESCRIBE_TEXT)
            .and_then(|describe| describe.call::<_, Array<'js>>((obj.clone(),)))
        {
            Ok(described) => described,
            Err(e) => return Ok(vec![unreadable(ctx, e)]),
        };

        let mut entries = Vec::with_capacity(described.len());
        for entry in described.iter::<Array<'js>>() {
            let entry = entry?;
            let key: String = entry.get(0)?;
            let rendered = match entry.get::<Option<String>>(2)? {
                Some(accessor) => format!("[{accessor}]"),
                None => self.format(&entry.get(1)?, depth + 1)?,
            };
            entries.push(format!("{}: {rendered}", format_key(&key)));
        }
        Ok(entries)
    }
}

/// Lay out collection entries on one line if they fit, else one per line.
fn layout(entries: &[String], open: &str, close: &str, depth: usize, prefix: usize) -> String {
    if entries.is_empty() {
        return format!("{open}{close}");
    }

    let width = entries.iter().map(|e| e.len() + 2).sum::<usize>()
        + prefix
        + open.len()
        + depth * 2
        + LINE_SLACK;
    if width <= BREAK_LENGTH && !entries.iter().any(|e| e.contains('\n')) {
        return format!("{open} {} {close}", entries.join(", "));
    }

    let indent = "  ".repeat(depth + 1);
    let outer = "  ".repeat(depth);
    format!(
        "{open}\n{indent}{}\n{outer}{close}",
        entries.join(&format!(",\n{indent}"))
    )
}

fn format_number(value: &Value<'_>) -> Result<String> {
    if let Some(f) = value.as_float() {
        if f == 0.0 && f.is_sign_negative() {
            return Ok("-0".to_string());
        }
    }
    coerce(value)
}

fn format_function(value: &Value<'_>) -> Result<String> {
    let name = value
        .as_object()
        .and_then(|obj| read::<String>(obj, "name"))
        .filter(|name| !name.is_empty());
    let source = coerce(value).unwrap_or_default();

    Ok(match (source.starts_with("class"), name) {
        (true, Some(name)) => format!("[class {name}]"),
        (true, None) => "[class (anonymous)]".to_string(),
        (false, Some(name)) => format!("[Function: {name}]"),
        (false, None) => "[Function (anonymous)]".to_string(),
    })
}

fn format_error(value: &Value<'_>) -> Result<String> {
    let Some(obj) = value.as_object() else {
        return coerce(value);
    };
    let field = |key: &str| read::<String>(obj, key);

    let name = field("name").unwrap_or_else(|| "Error".to_string());
    let head = match field("message").filter(|m| !m.is_empty()) {
        Some(message) => format!("{name}: {message}"),
        None => name,
    };
    Ok(match field("stack").filter(|s| !s.trim().is_empty()) {
        Some(stack) => format!("{head}\n{}", stack.trim_end()),
        None => head,
    })
}

fn constructor_name(obj: &Object<'_>) -> Option<String> {
    let ctor: Object<'_> = read(obj, "constructor")?;
    read(&ctor, "name")
}

/// Read a property, treating a throw (from a getter or proxy trap) as absent.
fn read<'js, V: FromJs<'js>>(obj: &Object<'js>, key: &str) -> Option<V> {
    match obj.get::<_, Option<V>>(key) {
        Ok(value) => value,
        Err(e) => {
            discard(obj.ctx(), &e);
            None
        }
    }
}

/// `['Map' | 'Set', items]` for Map and Set instances.
fn collection<'js>(value: &Value<'js>) -> Option<(String, Array<'js>)> {
    let found = helper(value.ctx(), COLLECTION_TEXT)
        .and_then(|classify| classify.call::<_, Option<Array<'js>>>((value.clone(),)));
    let tagged = match found {
        Ok(tagged) => tagged?,
        Err(e) => {
            discard(value.ctx(), &e);
            return None;
        }
    };
    Some((tagged.get(0).ok()?, tagged.get(1).ok()?))
}

/// Clear the exception a failed engine call left pending.
fn discard(ctx: &Ctx<'_>, err: &rquickjs::Error) {
    if matches!(err, rquickjs::Error::Exception) {
        ctx.catch();
    }
}

/// Placeholder entry for a value whose inspection threw.
fn unreadable(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    format!("<unreadable {}>", caught(ctx, err))
}

fn helper<'js>(ctx: &Ctx<'js>, source: &str) -> Result<Function<'js>> {
    eval_global(ctx, source)
}

/// Run a small script function on `value` and return its string result.
fn call_helper<'js>(value: &Value<'js>, source: &str) -> Result<String> {
    helper(value.ctx(), source)?.call((value.clone(),))
}

fn coerce(value: &Value<'_>) -> Result<String> {
    value.get::<Coerced<String>>().map(|s| s.0)
}

fn format_key(key: &str) -> String {
    if is_identifier(key) {
        key.to_string()
    } else {
        quote(key)
    }
}

/// Quote a string, preferring single quotes and switching when the text
/// itself contains them.
fn quote(s: &str) -> String {
    let q = if !s.contains('\'') {
        '\''
    } else if !s.contains('"') {
        '"'
    } else if !s.contains('`') {
        '`'
    } else {
        '\''
    };

    let mut out = String::with_capacity(s.len() + 2);
    out.push(q);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            '\\' => out.push_str("\\\\"),
            c if c == q => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() && (c as u32) < 0x80 => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(q);
    out
}
