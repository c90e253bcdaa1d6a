use serde_json::Value;
use tracing::warn;

use tasknet::TaskError;

use crate::proc::ProcError;

/// Typed access to task input fields; a missing or mistyped field is a
/// validation error carrying the field name.
pub(crate) fn input_i64(input: &Value, field: &str) -> Result<i64, TaskError> {
	input.get(field).and_then(Value::as_i64).ok_or_else(|| TaskError::validation(field))
}

pub(crate) fn input_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, TaskError> {
	input.get(field).and_then(Value::as_str).ok_or_else(|| TaskError::validation(field))
}

pub(crate) fn input_array<'a>(input: &'a Value, field: &str) -> Result<&'a Vec<Value>, TaskError> {
	input.get(field).and_then(Value::as_array).ok_or_else(|| TaskError::validation(field))
}

pub(crate) fn input_string_list(input: &Value, field: &str) -> Result<Vec<String>, TaskError> {
	input_array(input, field)?
		.iter()
		.map(|item| item.as_str().map(str::to_string))
		.collect::<Option<Vec<_>>>()
		.ok_or_else(|| TaskError::validation(field))
}

/// Session and election ids end up in paths and in mixnet arguments; only
/// allow filesystem- and shell-inert characters.
pub(crate) fn is_safe_id(id: &str) -> bool {
	!id.is_empty()
		&& id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Pretty JSON with object keys in sorted order; the same value must
/// serialize to the same bytes on every authority.
pub(crate) fn canonical_pretty(value: &Value) -> String {
	// serde_json object maps are BTreeMaps, so key order is already
	// deterministic.
	serde_json::to_string_pretty(value).expect("json value always serializes")
}

pub(crate) fn subprocess_error(error: ProcError) -> TaskError {
	warn!("mixnet invocation failed: {error}");
	TaskError::Subprocess(error.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn safe_ids() {
		assert!(is_safe_id("0-0e9a7352-9c5c-4b4a-a8d6-2a4857f0f4b0"));
		assert!(is_safe_id("under_score"));
		assert!(!is_safe_id(""));
		assert!(!is_safe_id("../escape"));
		assert!(!is_safe_id("has space"));
	}

	#[test]
	fn canonical_json_sorts_keys() {
		let a: Value = serde_json::from_str(r#"{"p": "1", "g": "2"}"#).unwrap();
		let b: Value = serde_json::from_str(r#"{"g": "2", "p": "1"}"#).unwrap();
		assert_eq!(canonical_pretty(&a), canonical_pretty(&b));
	}

	#[test]
	fn field_access_reports_the_field_name() {
		let input = json!({ "election_id": 7 });
		assert_eq!(input_i64(&input, "election_id").unwrap(), 7);
		assert!(matches!(
			input_str(&input, "callback_url"),
			Err(TaskError::Validation(field)) if field == "callback_url"
		));
	}
}
