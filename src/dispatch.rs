//! Request dispatch.
//!
//! Turns one framed record into at most one response by decoding it,
//! selecting a handler by command kind and running that handler against the
//! shared evaluator. Protocol and execution failures are both converted to
//! error responses here; nothing escapes to the session.

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::backend::{EvalError, Evaluator};
use crate::transport::protocol::{script_text, Command, UNKNOWN_TYPE_PREFIX};
use crate::transport::{DecodeError, Frame, RequestEnvelope, ResponseEnvelope};

/// Handle one record.
///
/// Returns `None` only for an assignment whose body lacks `varName` or
/// `value`: such requests are dropped without a reply.
#[instrument(skip_all)]
pub fn dispatch<E: Evaluator + ?Sized>(
    evaluator: &mut E,
    frame: Frame,
) -> Option<ResponseEnvelope> {
    let decoded = match frame {
        Frame::Record(record) => RequestEnvelope::decode(&record),
        Frame::Oversized(len) => Err(DecodeError::Oversized(len)),
    };

    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Rejected record");
            return Some(e.into_response());
        }
    };

    let response = match Command::from_envelope(envelope) {
        Command::Statement(code) => {
            debug!(kind = "statement", "Dispatching");
            evaluator
                .execute(code.as_str())
                .map(|()| ResponseEnvelope::empty())
        }
        Command::Expression(code) => {
            debug!(kind = "expression", "Dispatching");
            evaluator.evaluate(code.as_str()).map(ResponseEnvelope::success)
        }
        Command::StringifiedExpression(code) => {
            debug!(kind = "stringified", "Dispatching");
            evaluator
                .evaluate_rendered(code.as_str())
                .map(ResponseEnvelope::success)
        }
        Command::Assignment(body) => {
            debug!(kind = "assignment", "Dispatching");
            let Some((name, value)) = assignment_parts(&body) else {
                warn!("Assignment without varName and value; no response sent");
                return None;
            };
            assign(evaluator, name, value).map(|()| ResponseEnvelope::empty())
        }
        Command::Unknown(kind) => {
            let kind = script_text(&kind);
            warn!(kind = %kind, "Unknown message type");
            Ok(ResponseEnvelope::error(format!("{UNKNOWN_TYPE_PREFIX}{kind}"), ""))
        }
    };

    Some(response.unwrap_or_else(|e| {
        debug!(error = %e, "Execution failed");
        ResponseEnvelope::error(e.name, e.message)
    }))
}

/// Pull `varName` and `value` out of an assignment body.
fn assignment_parts(body: &Value) -> Option<(&Value, &Value)> {
    let map = body.as_object()?;
    Some((map.get("varName")?, map.get("value")?))
}

fn assign<E: Evaluator + ?Sized>(
    evaluator: &mut E,
    name: &Value,
    value: &Value,
) -> Result<(), EvalError> {
    match name {
        Value::String(name) => evaluator.bind(name, value),
        other => Err(EvalError::new(
            "SyntaxError",
            format!("variable name must be a string, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use crate::transport::protocol::{ResponseBody, MISSING_FIELDS_MESSAGE};

    /// Evaluator over a plain variable map. Code is a variable name, or
    /// `fail` to raise an error.
    #[derive(Default)]
    struct MockEvaluator {
        vars: HashMap<String, Value>,
        executed: Vec<String>,
    }

    impl MockEvaluator {
        fn lookup(&self, code: &str) -> Result<Value, EvalError> {
            if code == "fail" {
                return Err(EvalError::new("ReferenceError", "fail is not defined"));
            }
            Ok(self.vars.get(code).cloned().unwrap_or(Value::Null))
        }
    }

    impl Evaluator for MockEvaluator {
        fn execute(&mut self, code: &str) -> Result<(), EvalError> {
            self.lookup(code)?;
            self.executed.push(code.to_string());
            Ok(())
        }

        fn evaluate(&mut self, code: &str) -> Result<Value, EvalError> {
            self.lookup(code)
        }

        fn evaluate_rendered(&mut self, code: &str) -> Result<String, EvalError> {
            self.lookup(code).map(|v| format!("<{v}>"))
        }

        fn bind(&mut self, name: &str, value: &Value) -> Result<(), EvalError> {
            self.vars.insert(name.to_string(), value.clone());
            Ok(())
        }
    }

    fn send(evaluator: &mut MockEvaluator, record: &str) -> Option<ResponseEnvelope> {
        dispatch(evaluator, Frame::Record(record.as_bytes().to_vec()))
    }

    fn error_body(resp: &ResponseEnvelope) -> (&str, &str) {
        match &resp.body {
            ResponseBody::Error(body) => (body.message.as_str(), body.cause.as_str()),
            ResponseBody::Value(v) => panic!("expected error body, got {v}"),
        }
    }

    #[test]
    fn statement_responds_with_empty_body() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":0,"body":"x"}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::empty());
        assert_eq!(ev.executed, vec!["x"]);
    }

    #[test]
    fn expression_returns_value() {
        let mut ev = MockEvaluator::default();
        ev.vars.insert("x".into(), json!({"a": [1, 2]}));
        let resp = send(&mut ev, r#"{"type":1,"body":"x"}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::success(json!({"a": [1, 2]})));
    }

    #[test]
    fn stringified_expression_returns_text() {
        let mut ev = MockEvaluator::default();
        ev.vars.insert("x".into(), json!(5));
        let resp = send(&mut ev, r#"{"type":3,"body":"x"}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::success("<5>"));
    }

    #[test]
    fn assignment_binds_variable() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":2,"body":{"varName":"x","value":5}}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::empty());
        assert_eq!(ev.vars["x"], json!(5));
    }

    #[test]
    fn assignment_null_value_is_present() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":2,"body":{"varName":"x","value":null}}"#);
        assert_eq!(resp, Some(ResponseEnvelope::empty()));
        assert_eq!(ev.vars["x"], Value::Null);
    }

    #[test]
    fn assignment_missing_fields_is_dropped() {
        let mut ev = MockEvaluator::default();
        for record in [
            r#"{"type":2,"body":{"varName":"x"}}"#,
            r#"{"type":2,"body":{"value":1}}"#,
            r#"{"type":2,"body":"x = 1"}"#,
            r#"{"type":2,"body":null}"#,
        ] {
            assert_eq!(send(&mut ev, record), None, "{record}");
        }
        assert!(ev.vars.is_empty());
    }

    #[test]
    fn assignment_non_string_name_is_error() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":2,"body":{"varName":7,"value":1}}"#).unwrap();
        assert_eq!(error_body(&resp).0, "SyntaxError");
    }

    #[test]
    fn unknown_type_echoes_type() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":99,"body":""}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::error("Bad message type:99", ""));

        let resp = send(&mut ev, r#"{"type":"1","body":"x"}"#).unwrap();
        assert_eq!(error_body(&resp).0, "Bad message type:1");
    }

    #[test]
    fn missing_body_is_protocol_error() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, r#"{"type":1}"#).unwrap();
        assert_eq!(resp, ResponseEnvelope::error(MISSING_FIELDS_MESSAGE, ""));
    }

    #[test]
    fn malformed_record_is_protocol_error() {
        let mut ev = MockEvaluator::default();
        let resp = send(&mut ev, "not json").unwrap();
        let (message, cause) = error_body(&resp);
        assert!(message.starts_with("Bad message"));
        assert!(!cause.is_empty());
    }

    #[test]
    fn oversized_frame_is_protocol_error() {
        let mut ev = MockEvaluator::default();
        let resp = dispatch(&mut ev, Frame::Oversized(1 << 30)).unwrap();
        assert_eq!(error_body(&resp).0, "Bad message: record too large");
    }

    #[test]
    fn execution_error_carries_name_and_message() {
        let mut ev = MockEvaluator::default();
        for kind in [0, 1, 3] {
            let record = format!(r#"{{"type":{kind},"body":"fail"}}"#);
            let resp = send(&mut ev, &record).unwrap();
            assert_eq!(
                resp,
                ResponseEnvelope::error("ReferenceError", "fail is not defined")
            );
        }
    }

    #[test]
    fn repeated_expression_is_idempotent() {
        let mut ev = MockEvaluator::default();
        ev.vars.insert("x".into(), json!([1, 2, 3]));
        let first = send(&mut ev, r#"{"type":1,"body":"x"}"#);
        let second = send(&mut ev, r#"{"type":1,"body":"x"}"#);
        assert_eq!(first, second);
    }
}
