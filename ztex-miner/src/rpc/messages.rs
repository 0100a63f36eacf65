//! getwork request envelope and reply parsing.
//!
//! Servers disagree on where they put fields (some nest the work under
//! `result`, some pad the reply with extra members), so the parsers look
//! for a key anywhere in the reply rather than at a fixed path.

use serde::Serialize;
use serde_json::Value;

use super::RpcError;
use crate::codec::WorkItem;

pub const GETWORK: &str = "getwork";

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [String],
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a [String]) -> Self {
        Self {
            jsonrpc: "1.0",
            id,
            method,
            params,
        }
    }
}

fn parse(body: &str) -> Result<Value, RpcError> {
    serde_json::from_str(body).map_err(|e| RpcError::Protocol(format!("Invalid JSON reply: {}", e)))
}

/// Depth-first search for the first member named `key`.
fn find<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map
            .get(key)
            .or_else(|| map.values().find_map(|v| find(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find(v, key)),
        _ => None,
    }
}

fn find_str<'v>(value: &'v Value, key: &str) -> Result<&'v str, RpcError> {
    match find(value, key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(RpcError::Protocol(format!("Invalid `{}' in reply", key))),
        None => Err(RpcError::Protocol(format!("No `{}' in reply", key))),
    }
}

/// Render a non-null `error` member as text.
fn error_text(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Extract a work item from a getwork reply.
pub fn parse_work(body: &str) -> Result<WorkItem, RpcError> {
    let value = parse(body)?;
    if let Some(err) = error_text(&value) {
        return Err(RpcError::Protocol(format!("Server error: {}", err)));
    }
    let data = find_str(&value, "data")?;
    let midstate = find_str(&value, "midstate")?;
    WorkItem::from_hex(data, midstate).map_err(|e| RpcError::Protocol(e.to_string()))
}

/// Outcome of a submission as reported in the reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// `error` member, if present and not null.
    pub error: Option<String>,
}

/// Interpret a submission reply. Unparseable replies are treated as having
/// no error; the server validates the share on its side regardless.
pub fn parse_submit(body: &str) -> SubmitOutcome {
    SubmitOutcome {
        error: parse(body).ok().as_ref().and_then(error_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data::block_2011;

    fn work_reply() -> String {
        format!(
            r#"{{"result":{{"midstate":"{}","data":"{}","hash1":"00","target":"ff"}},"error":null,"id":1}}"#,
            block_2011::MIDSTATE,
            block_2011::DATA
        )
    }

    #[test]
    fn test_request_envelope() {
        let params = vec!["abcd".to_string()];
        let json = serde_json::to_string(&Request::new(7, GETWORK, &params)).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"1.0","id":7,"method":"getwork","params":["abcd"]}"#
        );
        let json = serde_json::to_string(&Request::new(8, GETWORK, &[])).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"1.0","id":8,"method":"getwork","params":[]}"#
        );
    }

    #[test]
    fn test_parse_work_finds_nested_fields() {
        let work = parse_work(&work_reply()).unwrap();
        assert_eq!(hex::encode(work.midstate()), block_2011::MIDSTATE);
        assert_eq!(hex::encode(work.data()), block_2011::DATA);
    }

    #[test]
    fn test_parse_work_missing_midstate() {
        let body = format!(r#"{{"result":{{"data":"{}"}},"error":null}}"#, block_2011::DATA);
        assert_eq!(
            parse_work(&body),
            Err(RpcError::Protocol("No `midstate' in reply".into()))
        );
    }

    #[test]
    fn test_parse_work_rejects_garbage() {
        assert!(matches!(
            parse_work("<html>502</html>"),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            parse_work(r#"{"result":{"data":"00","midstate":"00"}}"#),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_work_server_error() {
        let body = r#"{"result":null,"error":{"code":-10,"message":"Bitcoin is downloading blocks..."}}"#;
        assert_eq!(
            parse_work(body),
            Err(RpcError::Protocol(
                "Server error: Bitcoin is downloading blocks...".into()
            ))
        );
    }

    #[test]
    fn test_parse_submit() {
        assert_eq!(
            parse_submit(r#"{"result":true,"error":null,"id":2}"#).error,
            None
        );
        assert_eq!(
            parse_submit(r#"{"result":false,"error":"stale work","id":2}"#).error,
            Some("stale work".into())
        );
        assert_eq!(parse_submit("not json").error, None);
    }
}
