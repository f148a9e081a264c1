use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct JmapRequest {
    #[serde(default)]
    pub using: Vec<String>,
    #[serde(rename = "methodCalls")]
    pub method_calls: Vec<MethodCall>,
}

/// `[name, arguments, callId]` triple of RFC 8620 §3.3.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MethodCall(pub String, pub Value, pub String);

#[derive(Debug, Serialize)]
pub struct JmapResponse {
    #[serde(rename = "methodResponses")]
    pub method_responses: Vec<Value>,
    #[serde(rename = "sessionState")]
    pub session_state: String,
}

/// A per-call error, rendered as `["error", {type, description}, callId]`.
#[derive(Debug)]
pub struct MethodError {
    pub typ: &'static str,
    pub description: Option<String>,
}

impl MethodError {
    pub fn unknown_method() -> Self {
        Self {
            typ: "unknownMethod",
            description: None,
        }
    }

    pub fn invalid_arguments(description: impl Into<String>) -> Self {
        Self {
            typ: "invalidArguments",
            description: Some(description.into()),
        }
    }

    pub fn invalid_result_reference(description: impl Into<String>) -> Self {
        Self {
            typ: "invalidResultReference",
            description: Some(description.into()),
        }
    }

    pub fn cannot_calculate_changes() -> Self {
        Self {
            typ: "cannotCalculateChanges",
            description: None,
        }
    }

    pub fn state_mismatch() -> Self {
        Self {
            typ: "stateMismatch",
            description: None,
        }
    }

    pub fn server_fail(err: impl std::fmt::Display) -> Self {
        Self {
            typ: "serverFail",
            description: Some(err.to_string()),
        }
    }
}

pub type MethodResult = Result<Value, MethodError>;

/// Replace every `{resultOf, name, path}` object in `args` with the value
/// the path extracts from the referenced earlier response (RFC 8620 §3.7).
pub fn resolve_backrefs(args: &mut Value, responses: &[Value]) -> Result<(), MethodError> {
    match args {
        Value::Object(map) => {
            if let Some(reference) = as_result_reference(map) {
                let resolved = lookup_reference(&reference, responses)?;
                *args = resolved;
                return Ok(());
            }
            for (_, value) in map.iter_mut() {
                resolve_backrefs(value, responses)?;
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_backrefs(item, responses)?;
            }
        }
        _ => (),
    }
    Ok(())
}

struct ResultReference {
    result_of: String,
    name: String,
    path: String,
}

fn as_result_reference(map: &serde_json::Map<String, Value>) -> Option<ResultReference> {
    if map.len() != 3 {
        return None;
    }
    Some(ResultReference {
        result_of: map.get("resultOf")?.as_str()?.to_string(),
        name: map.get("name")?.as_str()?.to_string(),
        path: map.get("path")?.as_str()?.to_string(),
    })
}

fn lookup_reference(
    reference: &ResultReference,
    responses: &[Value],
) -> Result<Value, MethodError> {
    let matching = responses.iter().find(|r| {
        r.get(2).and_then(Value::as_str) == Some(reference.result_of.as_str())
            && r.get(0).and_then(Value::as_str) == Some(reference.name.as_str())
    });
    let response = matching.ok_or_else(|| {
        MethodError::invalid_result_reference(format!(
            "no response for call {:?} of method {:?}",
            reference.result_of, reference.name
        ))
    })?;
    let root = response.get(1).unwrap_or(&Value::Null);
    let segments: Vec<&str> = reference
        .path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    eval_path(root, &segments).ok_or_else(|| {
        MethodError::invalid_result_reference(format!("path {:?} not found", reference.path))
    })
}

/// JSON-pointer-like traversal with `*` mapping over arrays.
fn eval_path(value: &Value, segments: &[&str]) -> Option<Value> {
    let (head, rest) = match segments.split_first() {
        None => return Some(value.clone()),
        Some(split) => split,
    };
    match (value, *head) {
        (Value::Array(items), "*") => {
            let mut out = Vec::new();
            for item in items {
                match eval_path(item, rest)? {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Some(Value::Array(out))
        }
        (Value::Array(items), index) => eval_path(items.get(index.parse::<usize>().ok()?)?, rest),
        (Value::Object(map), key) => eval_path(map.get(key)?, rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_ids_from_a_prior_response() {
        let responses = vec![json!([
            "Email/query",
            {"ids": ["m1", "m2"], "total": 2},
            "a"
        ])];
        let mut args = json!({
            "ids": {"resultOf": "a", "name": "Email/query", "path": "/ids"}
        });
        resolve_backrefs(&mut args, &responses).unwrap();
        assert_eq!(args, json!({"ids": ["m1", "m2"]}));
    }

    #[test]
    fn star_maps_over_arrays() {
        let responses = vec![json!([
            "Mailbox/get",
            {"list": [{"id": "x"}, {"id": "y"}]},
            "c1"
        ])];
        let mut args = json!({
            "ids": {"resultOf": "c1", "name": "Mailbox/get", "path": "/list/*/id"}
        });
        resolve_backrefs(&mut args, &responses).unwrap();
        assert_eq!(args, json!({"ids": ["x", "y"]}));
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let mut args = json!({
            "ids": {"resultOf": "nope", "name": "Email/query", "path": "/ids"}
        });
        let err = resolve_backrefs(&mut args, &[]).unwrap_err();
        assert_eq!(err.typ, "invalidResultReference");
    }

    #[test]
    fn ordinary_objects_are_left_alone() {
        let mut args = json!({"filter": {"inMailbox": "M", "text": "x"}, "limit": 10});
        let before = args.clone();
        resolve_backrefs(&mut args, &[]).unwrap();
        assert_eq!(args, before);
    }
}
