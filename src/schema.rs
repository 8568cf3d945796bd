//! Extraction record types: fields, declared types and the provenance trail.
//!
//! The on-disk shape is `{ "values": [Field...], "_provenance": [ProvenanceEntry...] }`.
//! Keys this crate does not know about are carried through untouched so an
//! exported record can be re-imported without loss.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, ReviewError};
use crate::rules::Rule;

/// Current time as an RFC 3339 UTC timestamp with microseconds.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Root extraction payload under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    values: Vec<Field>,
    #[serde(rename = "_provenance", default)]
    provenance: Vec<ProvenanceEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Reference written into new provenance entries. Not serialized.
    #[serde(skip)]
    pub source_document: String,
}

impl ExtractionRecord {
    /// Build a record from fields. Fails if two fields share a name.
    pub fn new(values: Vec<Field>) -> Result<Self> {
        let record = Self {
            values,
            provenance: Vec::new(),
            extra: Map::new(),
            source_document: String::new(),
        };
        record.check_unique_names()?;
        Ok(record)
    }

    /// Parse an uploaded extraction payload.
    ///
    /// Unparseable JSON is a [`ReviewError::FileFormat`]; valid JSON with the
    /// wrong shape (no `values`, duplicate names, bad provenance) is a
    /// [`ReviewError::Schema`].
    pub fn from_slice(filename: &str, data: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| ReviewError::file_format(filename, e))?;

        let obj = value
            .as_object()
            .ok_or_else(|| ReviewError::Schema("top level must be a JSON object".into()))?;
        match obj.get("values") {
            None => return Err(ReviewError::Schema("missing required key 'values'".into())),
            Some(v) if !v.is_array() => {
                return Err(ReviewError::Schema("'values' must be an array".into()))
            }
            _ => {}
        }

        let mut record: Self =
            serde_json::from_value(value).map_err(|e| ReviewError::Schema(e.to_string()))?;
        record.check_unique_names()?;
        record.source_document = filename.to_string();
        Ok(record)
    }

    pub fn fields(&self) -> &[Field] {
        &self.values
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.values.iter().find(|f| f.name == name)
    }

    pub(crate) fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.values.iter_mut().find(|f| f.name == name)
    }

    pub(crate) fn push_field(&mut self, field: Field) {
        self.values.push(field);
    }

    pub(crate) fn remove_field(&mut self, name: &str) -> Option<Field> {
        let idx = self.values.iter().position(|f| f.name == name)?;
        Some(self.values.remove(idx))
    }

    /// The audit trail, oldest first.
    pub fn provenance(&self) -> &[ProvenanceEntry] {
        &self.provenance
    }

    /// Entries are only ever appended; there is no API to edit or drop one.
    pub(crate) fn append_provenance(&mut self, entry: ProvenanceEntry) {
        self.provenance.push(entry);
    }

    fn check_unique_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.values {
            if !seen.insert(field.name.as_str()) {
                return Err(ReviewError::Schema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

/// One extracted value with its declared type and validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default)]
    pub declared_type: FieldType,
    #[serde(default, deserialize_with = "deserialize_rules")]
    pub rules: Vec<Rule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Field {
    pub fn new(name: impl Into<String>, value: Value, declared_type: FieldType) -> Self {
        Self {
            name: name.into(),
            value,
            declared_type,
            rules: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules = rules.into_iter().map(|r| Rule::parse(r.as_ref())).collect();
        self
    }

    /// Numeric reading of the value, accepting numeric strings.
    pub fn as_f64(&self) -> Option<f64> {
        value_as_f64(&self.value)
    }
}

/// Rules arrive either as a list or as one comma-separated string.
fn deserialize_rules<'de, D>(deserializer: D) -> std::result::Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Rule>),
        Joined(String),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        Some(Repr::List(rules)) => rules,
        Some(Repr::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Rule::parse)
            .collect(),
        None => Vec::new(),
    })
}

/// Read a JSON value as a number, accepting numeric strings with `,` separators.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Plain string rendering used for comparisons, patterns and display.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Declared type of a field. Unrecognized names are preserved as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    Other(String),
}

impl From<String> for FieldType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "string" | "" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => Self::Other(s),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Array => "array",
            Self::Object => "object",
            Self::Other(name) => name,
        };
        f.write_str(s)
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

impl FieldType {
    /// Coerce a raw incoming value to this type. `null` is always accepted.
    pub fn coerce(&self, field: &str, raw: Value) -> Result<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let reject = |raw: &Value| ReviewError::Validation {
            field: field.to_string(),
            expected: self.to_string(),
            value: raw.to_string(),
        };

        match self {
            Self::String => Ok(match raw {
                Value::String(_) => raw,
                Value::Number(_) | Value::Bool(_) => Value::String(raw.to_string()),
                _ => return Err(reject(&raw)),
            }),
            Self::Number => match &raw {
                Value::Number(n) if n.as_f64().is_some_and(f64::is_finite) => Ok(raw),
                Value::String(s) => number_from_str(s).ok_or_else(|| reject(&raw)),
                _ => Err(reject(&raw)),
            },
            Self::Boolean => match &raw {
                Value::Bool(_) => Ok(raw),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(reject(&raw)),
                },
                Value::Number(n) => match n.as_f64() {
                    Some(x) if x == 1.0 => Ok(Value::Bool(true)),
                    Some(x) if x == 0.0 => Ok(Value::Bool(false)),
                    _ => Err(reject(&raw)),
                },
                _ => Err(reject(&raw)),
            },
            Self::Date => match &raw {
                Value::String(s) => parse_date(s)
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .ok_or_else(|| reject(&raw)),
                _ => Err(reject(&raw)),
            },
            Self::Array => match &raw {
                Value::Array(_) => Ok(raw),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(v @ Value::Array(_)) => Ok(v),
                    _ => Err(reject(&raw)),
                },
                _ => Err(reject(&raw)),
            },
            Self::Object => match &raw {
                Value::Object(_) => Ok(raw),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(v @ Value::Object(_)) => Ok(v),
                    _ => Err(reject(&raw)),
                },
                _ => Err(reject(&raw)),
            },
            Self::Other(_) => Ok(raw),
        }
    }

    /// Canonical string form used to decide whether an edit changes anything.
    ///
    /// Numbers compare numerically, dates by calendar day, booleans by truth
    /// value. Anything that does not read as the declared type falls back to
    /// its plain string rendering.
    pub fn normalize(&self, value: &Value) -> String {
        match self {
            Self::Number => number_key(value),
            Self::Date => match value {
                Value::String(s) => parse_date(s).map(|d| d.format("%Y-%m-%d").to_string()),
                _ => None,
            },
            Self::Boolean => match value {
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            },
            _ => None,
        }
        .unwrap_or_else(|| value_to_plain_string(value))
    }
}

/// Largest magnitude below which every integer is exactly representable as f64.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// Parse a numeric string. Integral results are stored as JSON integers.
fn number_from_str(raw: &str) -> Option<Value> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if !cleaned.contains(&['.', 'e', 'E'][..]) {
        if let Ok(i) = cleaned.parse::<i64>() {
            return Some(Value::from(i));
        }
        if let Ok(u) = cleaned.parse::<u64>() {
            return Some(Value::from(u));
        }
    }
    let n = parse_number(&cleaned)?;
    if n.fract() == 0.0 && n.abs() <= MAX_EXACT_F64_INT {
        return Some(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(Value::Number)
}

/// Comparison key for numbers. Integers keep every digit; floats use their
/// shortest round-trip rendering, which matches the integer form when integral.
fn number_key(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(u)) => Some(u.to_string()),
            _ => n.as_f64().map(|f| f.to_string()),
        },
        Value::String(s) => number_from_str(s).and_then(|n| number_key(&n)),
        _ => None,
    }
}

/// Parse a date in one of the accepted layouts, or an RFC 3339 timestamp.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

/// Reviewer identity attached to provenance entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            role: None,
            extra: Map::new(),
        }
    }
}

/// One audit record covering a batch of field changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub timestamp: String,
    pub user: UserInfo,
    #[serde(default)]
    pub document: String,
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
    pub action: ChangeAction,
    /// Set when the change is to the field's definition rather than its value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<FieldAttribute>,
}

/// Part of a field definition touched by a `modified` change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldAttribute {
    Name,
    Type,
    Rules,
}

impl fmt::Display for FieldAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Name => "name",
            Self::Type => "type",
            Self::Rules => "rules",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_sample_payload() {
        let data = json!({
            "values": [
                {"name": "test_field", "value": "test_value", "type": "string", "rules": ["required"]}
            ],
            "_provenance": []
        });
        let record = ExtractionRecord::from_slice("sample.json", data.to_string().as_bytes()).unwrap();
        assert_eq!(record.fields().len(), 1);
        assert_eq!(record.fields()[0].name, "test_field");
        assert_eq!(record.fields()[0].rules[0].source(), "required");
        assert!(record.provenance().is_empty());
        assert_eq!(record.source_document, "sample.json");
    }

    #[test]
    fn test_missing_values_is_schema_error() {
        let err = ExtractionRecord::from_slice("x.json", br#"{"_provenance": []}"#).unwrap_err();
        assert!(matches!(err, ReviewError::Schema(_)));
    }

    #[test]
    fn test_invalid_json_is_file_format_error() {
        let err = ExtractionRecord::from_slice("x.json", b"{not json").unwrap_err();
        assert!(matches!(err, ReviewError::FileFormat { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let data = br#"{"values": [{"name": "a", "value": 1}, {"name": "a", "value": 2}]}"#;
        let err = ExtractionRecord::from_slice("x.json", data).unwrap_err();
        assert!(matches!(err, ReviewError::Schema(msg) if msg.contains("'a'")));
    }

    #[test]
    fn test_joined_rules_and_unknown_keys_survive() {
        let data = json!({
            "document_id": "INV-7",
            "values": [
                {"name": "total", "value": 10, "type": "number", "rules": "required, range:0..100", "page": 2}
            ]
        });
        let record = ExtractionRecord::from_slice("x.json", data.to_string().as_bytes()).unwrap();
        let field = record.field("total").unwrap();
        assert_eq!(field.rules.len(), 2);
        assert_eq!(field.extra.get("page"), Some(&json!(2)));

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["document_id"], json!("INV-7"));
        assert_eq!(out["values"][0]["rules"], json!(["required", "range:0..100"]));
        assert_eq!(out["values"][0]["page"], json!(2));
    }

    #[test]
    fn test_number_coercion() {
        let t = FieldType::Number;
        assert_eq!(t.coerce("n", json!("1,250.00")).unwrap(), json!(1250));
        assert_eq!(t.coerce("n", json!("1e3")).unwrap(), json!(1000));
        assert_eq!(t.coerce("n", json!("10.50")).unwrap(), json!(10.5));
        assert_eq!(t.coerce("n", json!(" 42 ")).unwrap(), json!(42));
        assert_eq!(t.coerce("n", json!(3.5)).unwrap(), json!(3.5));
        assert!(matches!(
            t.coerce("n", json!("abc")),
            Err(ReviewError::Validation { .. })
        ));
        assert!(t.coerce("n", json!(true)).is_err());
    }

    #[test]
    fn test_date_and_boolean_coercion() {
        assert_eq!(
            FieldType::Date.coerce("d", json!("03/15/2024")).unwrap(),
            json!("2024-03-15")
        );
        assert!(FieldType::Date.coerce("d", json!("not a date")).is_err());
        assert_eq!(FieldType::Boolean.coerce("b", json!("Yes")).unwrap(), json!(true));
        assert_eq!(FieldType::Boolean.coerce("b", json!(0)).unwrap(), json!(false));
        assert!(FieldType::Boolean.coerce("b", json!("maybe")).is_err());
    }

    #[test]
    fn test_null_accepted_for_every_type() {
        for t in [FieldType::Number, FieldType::Date, FieldType::Object] {
            assert_eq!(t.coerce("f", Value::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_normalize_compares_numbers_numerically() {
        let t = FieldType::Number;
        assert_eq!(t.normalize(&json!("1250.00")), t.normalize(&json!(1250)));
        assert_ne!(t.normalize(&json!(106.25)), t.normalize(&json!(106.5)));
        assert_eq!(
            FieldType::Date.normalize(&json!("2024/03/15")),
            FieldType::Date.normalize(&json!("2024-03-15"))
        );
    }

    #[test]
    fn test_normalize_keeps_large_integers_distinct() {
        let t = FieldType::Number;
        assert_ne!(
            t.normalize(&json!(9007199254740992_i64)),
            t.normalize(&json!(9007199254740993_i64))
        );
        assert_ne!(
            t.normalize(&json!("9007199254740993")),
            t.normalize(&json!(9007199254740992_i64))
        );
        assert_eq!(t.normalize(&json!(18446744073709551615_u64)), "18446744073709551615");
        assert_eq!(t.normalize(&json!(1250.0)), t.normalize(&json!(1250)));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let t: FieldType = serde_json::from_value(json!("currency")).unwrap();
        assert_eq!(t, FieldType::Other("currency".into()));
        assert_eq!(serde_json::to_value(&t).unwrap(), json!("currency"));
    }
}
