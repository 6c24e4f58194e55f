//! JSON parsing/serialization helpers with consistent warning logs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum JsonContext<'a> {
    JobField {
        job_id: &'a str,
        field: &'static str,
    },
    Setting {
        key: &'a str,
    },
    Artifact {
        job_id: &'a str,
        path: &'a str,
    },
}

fn warn_parse_error(
    raw_len: usize,
    error: serde_json::Error,
    ctx: JsonContext<'_>,
    msg: &'static str,
) {
    match ctx {
        JsonContext::JobField { job_id, field } => {
            warn!(job_id = %job_id, field, raw_len, error = %error, "{msg}");
        }
        JsonContext::Setting { key } => {
            warn!(key = %key, raw_len, error = %error, "{msg}");
        }
        JsonContext::Artifact { job_id, path } => {
            warn!(job_id = %job_id, path = %path, raw_len, error = %error, "{msg}");
        }
    }
}

fn warn_serialize_error(error: serde_json::Error, ctx: JsonContext<'_>, msg: &'static str) {
    match ctx {
        JsonContext::JobField { job_id, field } => {
            warn!(job_id = %job_id, field, error = %error, "{msg}");
        }
        JsonContext::Setting { key } => {
            warn!(key = %key, error = %error, "{msg}");
        }
        JsonContext::Artifact { job_id, path } => {
            warn!(job_id = %job_id, path = %path, error = %error, "{msg}");
        }
    }
}

pub fn parse_optional<T: DeserializeOwned>(
    raw: Option<&str>,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            None
        }
    }
}

pub fn parse_or_default<T: DeserializeOwned + Default>(
    raw: &str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> T {
    // Empty string means "no value".
    if raw.is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            T::default()
        }
    }
}

/// Parse a JSON object, falling back to `{}` for empty, invalid or non-object input.
pub fn parse_object_or_empty(raw: &str, ctx: JsonContext<'_>, msg: &'static str) -> Value {
    match parse_or_default::<Value>(raw, ctx, msg) {
        value @ Value::Object(_) => value,
        _ => Value::Object(Default::default()),
    }
}

pub fn to_string_or_fallback<T: Serialize + ?Sized>(
    value: &T,
    fallback: &'static str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(error) => {
            warn_serialize_error(error, ctx, msg);
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: JsonContext<'static> = JsonContext::JobField {
        job_id: "job-1",
        field: "payload",
    };

    #[test]
    fn invalid_payload_becomes_empty_object() {
        let value = parse_object_or_empty("{not json", CTX, "bad payload");
        assert_eq!(value, serde_json::json!({}));
        let value = parse_object_or_empty("[1,2]", CTX, "bad payload");
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn valid_payload_is_kept() {
        let value = parse_object_or_empty(r#"{"items":["a"]}"#, CTX, "bad payload");
        assert_eq!(value["items"][0], "a");
    }

    #[test]
    fn parse_optional_none_passthrough() {
        let parsed: Option<u32> = parse_optional(None, CTX, "x");
        assert!(parsed.is_none());
        let parsed: Option<u32> = parse_optional(Some("12"), CTX, "x");
        assert_eq!(parsed, Some(12));
    }
}
