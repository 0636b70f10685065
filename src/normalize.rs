use serde_json::Value;

/// Literal strings producers write in place of a reading. Compared case-insensitively.
const NA_SENTINELS: [&str; 6] = ["n/a", "na", "null", "none", "undefined", ""];

/// A sensor field after normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Present(&'a Value),
    NotAvailable,
}

impl<'a> FieldValue<'a> {
    pub fn is_present(&self) -> bool {
        matches!(self, FieldValue::Present(_))
    }

    pub fn present(self) -> Option<&'a Value> {
        match self {
            FieldValue::Present(value) => Some(value),
            FieldValue::NotAvailable => None,
        }
    }
}

/// Unwraps one level of `{value: x, ...}` (falling back to `data`) and classifies the result.
/// An absent key is `NotAvailable`.
pub fn extract(raw: Option<&Value>) -> FieldValue<'_> {
    let Some(raw) = raw else {
        return FieldValue::NotAvailable;
    };
    let scalar = match raw {
        Value::Object(map) => match map.get("value").or_else(|| map.get("data")) {
            Some(inner) => inner,
            None => return FieldValue::NotAvailable,
        },
        other => other,
    };
    if is_na_scalar(scalar) {
        FieldValue::NotAvailable
    } else {
        FieldValue::Present(scalar)
    }
}

pub fn is_na(raw: Option<&Value>) -> bool {
    !extract(raw).is_present()
}

fn is_na_scalar(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => NA_SENTINELS
            .iter()
            .any(|sentinel| text.eq_ignore_ascii_case(sentinel)),
        _ => false,
    }
}

/// Builds the value to write for `scalar`, keeping the wrapper shape of `existing` when the
/// stored field is a `{value, ...}` structure so unit/metadata keys survive the update.
pub fn rewrap(existing: Option<&Value>, scalar: &Value) -> Value {
    match existing {
        Some(Value::Object(wrapper)) => {
            let mut wrapper = wrapper.clone();
            wrapper.insert("value".to_string(), scalar.clone());
            Value::Object(wrapper)
        }
        _ => scalar.clone(),
    }
}
