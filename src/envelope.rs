//! Command envelope read from stdin: `{"args": {...}, "data": {...}}`.

use crate::error::{BookingError, Result};
use crate::sqlite::{Value, ID_FIELD};
use serde::Deserialize;
use serde_json::{Map, Value as Json};

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    /// Lookup parameters. Keys other than `id` are accepted and ignored.
    #[serde(default)]
    pub args: Option<Map<String, Json>>,
    /// Field values for writes.
    #[serde(default)]
    pub data: Option<Map<String, Json>>,
}

impl Envelope {
    /// Parse an envelope, tolerating trailing commas before `}` or `]`.
    ///
    /// The strict parse runs first; the comma cleanup is only a fallback, and
    /// when it fails too the strict parse error is reported.
    pub fn parse(input: &str) -> Result<Self> {
        let strict = match serde_json::from_str::<Json>(input) {
            Ok(json) => return Self::from_json(json),
            Err(e) => e,
        };
        let relaxed = strip_trailing_commas(input);
        match serde_json::from_str::<Json>(&relaxed) {
            Ok(json) => {
                tracing::debug!("envelope accepted after removing trailing commas");
                Self::from_json(json)
            }
            Err(_) => Err(BookingError::malformed(format!("invalid JSON: {strict}"))),
        }
    }

    fn from_json(json: Json) -> Result<Self> {
        if !json.is_object() {
            return Err(BookingError::malformed("envelope must be a JSON object"));
        }
        serde_json::from_value(json)
            .map_err(|e| BookingError::malformed(format!("invalid envelope: {e}")))
    }

    /// `args.id`, if supplied.
    pub fn arg_id(&self) -> Result<Option<Value>> {
        let id = self.args.as_ref().and_then(|args| args.get(ID_FIELD));
        id.map(|id| lookup_id("args.id", id)).transpose()
    }

    /// `args.id`, required.
    pub fn require_arg_id(&self) -> Result<Value> {
        self.arg_id()?
            .ok_or_else(|| BookingError::malformed("missing `args.id`"))
    }

    /// `data`, required. Values are converted in key order.
    pub fn require_data(&self) -> Result<Vec<(String, Value)>> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| BookingError::malformed("missing `data`"))?;
        data.iter()
            .map(|(field, json)| Ok((field.clone(), Value::from_json(field, json)?)))
            .collect()
    }
}

fn lookup_id(label: &str, json: &Json) -> Result<Value> {
    match Value::from_json(label, json)? {
        Value::Null => Err(BookingError::malformed(format!("`{label}` must not be null"))),
        id => Ok(id),
    }
}

/// Pull `id` out of write data and check it against the lookup id.
///
/// Returns the effective id: the lookup id when given, else the one in
/// `data`. Identifiers are never rewritten, so a mismatch is rejected.
pub fn reconcile_id(lookup: Option<Value>, data: &mut Vec<(String, Value)>) -> Result<Option<Value>> {
    let position = data.iter().position(|(field, _)| field == ID_FIELD);
    let from_data = match position {
        Some(index) => Some(data.remove(index).1),
        None => None,
    };
    match (lookup, from_data) {
        (Some(lookup), Some(from_data)) if lookup != from_data => Err(BookingError::malformed(
            format!("`data.id` ({from_data}) does not match `args.id` ({lookup})"),
        )),
        (Some(lookup), _) => Ok(Some(lookup)),
        (None, Some(Value::Null)) => Err(BookingError::malformed("`data.id` must not be null")),
        (None, from_data) => Ok(from_data),
    }
}

/// Drop commas that directly precede `}` or `]`, ignoring string contents.
fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for (index, c) in input.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            let rest = input[index + 1..].trim_start();
            if rest.starts_with('}') || rest.starts_with(']') {
                continue;
            }
        }
        out.push(c);
    }
    out
}
