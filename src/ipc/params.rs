use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::calc::parse_decimal;
use crate::ipc::error::HandlerErr;
use crate::model::{Actor, SubmissionContent};

pub fn actor(params: &Value) -> Result<Actor, HandlerErr> {
    let raw = params
        .get("actor")
        .ok_or_else(|| HandlerErr::bad_params("missing actor"))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid actor: {e}")))
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn req_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    opt_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

pub fn opt_decimal(params: &Value, key: &str) -> Result<Option<Decimal>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_decimal(v)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a number"))),
    }
}

pub fn req_decimal(params: &Value, key: &str) -> Result<Decimal, HandlerErr> {
    opt_decimal(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

pub fn opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a boolean"))),
    }
}

/// RFC 3339 timestamps, normalized to UTC.
pub fn opt_datetime(params: &Value, key: &str) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    let Some(raw) = opt_str(params, key) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| Some(d.with_timezone(&Utc)))
        .map_err(|e| HandlerErr::bad_params(format!("{key} is not an RFC 3339 timestamp: {e}")))
}

pub fn content(params: &Value) -> Result<SubmissionContent, HandlerErr> {
    match params.get("content") {
        None | Some(Value::Null) => Ok(SubmissionContent::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid content: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use serde_json::json;

    #[test]
    fn actor_requires_known_role() {
        let a = actor(&json!({"actor": {"id": "t1", "role": "instructor"}})).expect("actor");
        assert_eq!(a.role, Role::Instructor);
        let e = actor(&json!({"actor": {"id": "t1", "role": "dean"}})).unwrap_err();
        assert_eq!(e.code, "bad_params");
        assert!(actor(&json!({})).is_err());
    }

    #[test]
    fn decimals_accept_numbers_and_strings() {
        let p = json!({"a": 12.5, "b": "7.25", "c": "x"});
        assert_eq!(opt_decimal(&p, "a").expect("a"), Some(Decimal::new(125, 1)));
        assert_eq!(req_decimal(&p, "b").expect("b"), Decimal::new(725, 2));
        assert!(opt_decimal(&p, "c").is_err());
        assert_eq!(opt_decimal(&p, "missing").expect("none"), None);
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        let p = json!({"due": "2026-03-01T10:00:00+02:00"});
        let got = opt_datetime(&p, "due").expect("parse").expect("some");
        assert_eq!(got.to_rfc3339(), "2026-03-01T08:00:00+00:00");
        assert!(opt_datetime(&json!({"due": "tomorrow"}), "due").is_err());
    }
}
