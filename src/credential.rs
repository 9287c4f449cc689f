use serde_json::Value;
use thiserror::Error;

use crate::error::BatchInputError;
use crate::models::{CredentialRecord, RawRecord};

/// Why a single batch item was rejected before any network call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    #[error("Missing 'uid'")]
    MissingUid,
    #[error("Missing 'password'")]
    MissingPassword,
}

/// Checks that a raw item carries both required fields, `uid` first.
pub fn validate(raw: &RawRecord) -> Result<CredentialRecord, RecordError> {
    let uid = raw
        .get("uid")
        .filter(|v| !is_blank(v))
        .ok_or(RecordError::MissingUid)?;
    let password = raw
        .get("password")
        .filter(|v| !is_blank(v))
        .ok_or(RecordError::MissingPassword)?;

    Ok(CredentialRecord {
        uid: coerce_to_string(uid),
        password: coerce_to_string(password),
        fields: raw.clone(),
    })
}

// null, "", 0, false and empty containers all count as absent
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses an uploaded batch file into raw items.
///
/// The payload must be at most `max_size` bytes and contain a JSON array whose
/// every element is an object. An empty array is accepted.
pub fn parse_batch(bytes: &[u8], max_size: usize) -> Result<Vec<RawRecord>, BatchInputError> {
    if bytes.len() > max_size {
        return Err(BatchInputError::TooLarge {
            size: bytesize::to_string(bytes.len() as u64, true),
            limit: bytesize::to_string(max_size as u64, true),
        });
    }

    let value: Value = serde_json::from_slice(bytes).map_err(|e| BatchInputError::Syntax {
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;

    let Value::Array(items) = value else {
        return Err(BatchInputError::NotAList);
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(BatchInputError::NotAnObject {
                index,
                preview: other.to_string().chars().take(50).collect(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn uid_is_checked_before_password() {
        let err = validate(&raw(json!({}))).unwrap_err();
        assert_eq!(err, RecordError::MissingUid);
        assert_eq!(err.to_string(), "Missing 'uid'");

        let err = validate(&raw(json!({"uid": "a"}))).unwrap_err();
        assert_eq!(err.to_string(), "Missing 'password'");
    }

    #[test]
    fn blank_values_count_as_missing() {
        assert_eq!(
            validate(&raw(json!({"uid": "", "password": "p"}))),
            Err(RecordError::MissingUid)
        );
        assert_eq!(
            validate(&raw(json!({"uid": "a", "password": null}))),
            Err(RecordError::MissingPassword)
        );
    }

    #[test]
    fn numeric_uid_is_coerced_and_fields_pass_through() {
        let record = validate(&raw(json!({"uid": 123456, "password": "p", "note": "x"}))).unwrap();
        assert_eq!(record.uid, "123456");
        assert_eq!(record.password, "p");
        assert_eq!(record.fields.get("note"), Some(&json!("x")));
    }

    #[test]
    fn batch_must_be_a_list_of_objects() {
        assert_eq!(parse_batch(br#"{"uid": "a"}"#, 1024), Err(BatchInputError::NotAList));
        assert!(matches!(
            parse_batch(br#"[{"uid": "a"}, 5]"#, 1024),
            Err(BatchInputError::NotAnObject { index: 1, .. })
        ));
        assert_eq!(parse_batch(b"[]", 1024).unwrap().len(), 0);
    }

    #[test]
    fn syntax_errors_report_position() {
        match parse_batch(b"[\n  {\"uid\": }\n]", 1024) {
            Err(BatchInputError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn oversized_payload_is_rejected_before_parsing() {
        assert!(matches!(
            parse_batch(b"[{}, {}, {}]", 4),
            Err(BatchInputError::TooLarge { .. })
        ));
    }
}
