//! Provenance-aware editing of extraction records.
//!
//! Every mutation goes through this module so the `_provenance` trail stays
//! complete: one [`ProvenanceEntry`] per effective batch of changes, nothing
//! written for a no-op, and rule violations returned as warnings instead of
//! errors.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, ReviewError};
use crate::rules::{validate_after_edit, Rule, ValidationWarning};
use crate::schema::{
    now_rfc3339, value_to_plain_string, ChangeAction, ExtractionRecord, Field, FieldAttribute,
    FieldChange, FieldType, ProvenanceEntry, UserInfo,
};

/// One requested change to an existing field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldEdit {
    pub field: String,
    pub value: Value,
}

/// What an edit did. `entry` is `None` when nothing changed.
#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub entry: Option<ProvenanceEntry>,
    pub warnings: Vec<ValidationWarning>,
}

impl EditOutcome {
    pub fn changed(&self) -> bool {
        self.entry.is_some()
    }
}

/// Options shared by every mutating call.
#[derive(Debug, Clone, Copy)]
pub struct EditOptions {
    pub formula_tolerance: f64,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            formula_tolerance: crate::rules::DEFAULT_FORMULA_TOLERANCE,
        }
    }
}

/// Set a single field's value.
///
/// Fails with [`ReviewError::UnknownField`] if the field does not exist and
/// [`ReviewError::Validation`] if `new_value` does not coerce to the field's
/// declared type. An edit to an equal value writes nothing.
pub fn apply_edit(
    record: &mut ExtractionRecord,
    field_name: &str,
    new_value: Value,
    user: &UserInfo,
    note: &str,
    opts: EditOptions,
) -> Result<EditOutcome> {
    apply_edits(
        record,
        vec![FieldEdit {
            field: field_name.to_string(),
            value: new_value,
        }],
        user,
        note,
        opts,
    )
}

/// Apply several edits as one batch recorded under a single provenance entry.
///
/// All values are coerced before anything is written, so a single bad value
/// leaves the record untouched.
pub fn apply_edits(
    record: &mut ExtractionRecord,
    edits: Vec<FieldEdit>,
    user: &UserInfo,
    note: &str,
    opts: EditOptions,
) -> Result<EditOutcome> {
    let mut planned: Vec<(String, Value)> = Vec::with_capacity(edits.len());
    for edit in edits {
        let field = record
            .field(&edit.field)
            .ok_or_else(|| ReviewError::UnknownField(edit.field.clone()))?;
        let coerced = field.declared_type.coerce(&field.name, edit.value)?;
        planned.push((edit.field, coerced));
    }

    let mut changes = Vec::new();
    for (name, coerced) in planned {
        let Some(field) = record.field_mut(&name) else {
            continue;
        };
        let t = &field.declared_type;
        if t.normalize(&field.value) == t.normalize(&coerced) {
            debug!("Edit to '{}' leaves value unchanged, skipping", name);
            continue;
        }
        let old_value = std::mem::replace(&mut field.value, coerced.clone());
        changes.push(FieldChange {
            field: name,
            old_value,
            new_value: coerced,
            action: ChangeAction::Modified,
            attribute: None,
        });
    }

    if changes.is_empty() {
        return Ok(EditOutcome {
            entry: None,
            warnings: Vec::new(),
        });
    }

    let mut warnings: Vec<ValidationWarning> = Vec::new();
    for change in &changes {
        for w in validate_after_edit(record, &change.field, opts.formula_tolerance) {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }
    }

    let entry = append_entry(record, changes, user, note);
    Ok(EditOutcome {
        entry: Some(entry),
        warnings,
    })
}

/// Append a new field. Its value is coerced to its declared type first.
pub fn add_field(
    record: &mut ExtractionRecord,
    mut field: Field,
    user: &UserInfo,
    note: &str,
    opts: EditOptions,
) -> Result<EditOutcome> {
    if field.name.trim().is_empty() {
        return Err(ReviewError::BadRequest("field name must not be empty".into()));
    }
    if record.field(&field.name).is_some() {
        return Err(ReviewError::DuplicateField(field.name));
    }
    field.value = field
        .declared_type
        .coerce(&field.name, std::mem::take(&mut field.value))?;

    let change = FieldChange {
        field: field.name.clone(),
        old_value: Value::Null,
        new_value: field.value.clone(),
        action: ChangeAction::Added,
        attribute: None,
    };
    let name = field.name.clone();
    record.push_field(field);

    let warnings = validate_after_edit(record, &name, opts.formula_tolerance);
    let entry = append_entry(record, vec![change], user, note);
    Ok(EditOutcome {
        entry: Some(entry),
        warnings,
    })
}

/// Remove a field. Formulas on other fields that read it will now warn.
pub fn delete_field(
    record: &mut ExtractionRecord,
    name: &str,
    user: &UserInfo,
    note: &str,
    opts: EditOptions,
) -> Result<EditOutcome> {
    let removed = record
        .remove_field(name)
        .ok_or_else(|| ReviewError::UnknownField(name.to_string()))?;

    let change = FieldChange {
        field: removed.name,
        old_value: removed.value,
        new_value: Value::Null,
        action: ChangeAction::Deleted,
        attribute: None,
    };

    let warnings = validate_after_edit(record, name, opts.formula_tolerance);
    let entry = append_entry(record, vec![change], user, note);
    Ok(EditOutcome {
        entry: Some(entry),
        warnings,
    })
}

/// Requested changes to a field's definition. Absent parts are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldDefinitionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub declared_type: Option<FieldType>,
    #[serde(default)]
    pub rules: Option<Vec<Rule>>,
}

/// Rename a field, change its declared type or replace its rules.
///
/// Each changed attribute is recorded as its own `modified` change under the
/// field's final name; a rename keeps the old name in `old_value`. A type
/// change re-coerces the current value and fails with
/// [`ReviewError::Validation`] if it does not fit, leaving the record as it
/// was. An update that changes nothing writes nothing.
pub fn update_field_definition(
    record: &mut ExtractionRecord,
    field_name: &str,
    update: FieldDefinitionUpdate,
    user: &UserInfo,
    note: &str,
    opts: EditOptions,
) -> Result<EditOutcome> {
    let field = record
        .field(field_name)
        .ok_or_else(|| ReviewError::UnknownField(field_name.to_string()))?;

    let new_name = match update.name.as_deref().map(str::trim) {
        Some("") => return Err(ReviewError::BadRequest("field name must not be empty".into())),
        Some(name) if name != field.name => {
            if record.field(name).is_some() {
                return Err(ReviewError::DuplicateField(name.to_string()));
            }
            Some(name.to_string())
        }
        _ => None,
    };
    let new_type = update
        .declared_type
        .filter(|t| *t != field.declared_type);
    let new_value = match &new_type {
        Some(t) => {
            let coerced = t.coerce(&field.name, field.value.clone())?;
            (coerced != field.value).then_some(coerced)
        }
        None => None,
    };
    let new_rules = update.rules.filter(|rules| *rules != field.rules);

    let final_name = new_name.clone().unwrap_or_else(|| field.name.clone());
    let Some(field) = record.field_mut(field_name) else {
        return Err(ReviewError::UnknownField(field_name.to_string()));
    };
    let modified = |attribute, old_value, new_value| FieldChange {
        field: final_name.clone(),
        old_value,
        new_value,
        action: ChangeAction::Modified,
        attribute,
    };

    let mut changes = Vec::new();
    if let Some(name) = new_name {
        let old = std::mem::replace(&mut field.name, name.clone());
        changes.push(modified(Some(FieldAttribute::Name), Value::from(old), Value::from(name)));
    }
    if let Some(t) = new_type {
        let old = std::mem::replace(&mut field.declared_type, t.clone());
        changes.push(modified(
            Some(FieldAttribute::Type),
            Value::from(old.to_string()),
            Value::from(t.to_string()),
        ));
    }
    if let Some(value) = new_value {
        let old = std::mem::replace(&mut field.value, value.clone());
        changes.push(modified(None, old, value));
    }
    if let Some(rules) = new_rules {
        let sources = |rules: &[Rule]| {
            Value::from(rules.iter().map(|r| r.source().to_string()).collect::<Vec<_>>())
        };
        let old = sources(&field.rules);
        let new = sources(&rules);
        field.rules = rules;
        changes.push(modified(Some(FieldAttribute::Rules), old, new));
    }

    if changes.is_empty() {
        debug!("Definition update to '{}' changes nothing, skipping", field_name);
        return Ok(EditOutcome {
            entry: None,
            warnings: Vec::new(),
        });
    }

    let mut warnings = validate_after_edit(record, &final_name, opts.formula_tolerance);
    if final_name != field_name {
        for w in validate_after_edit(record, field_name, opts.formula_tolerance) {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }
    }

    let entry = append_entry(record, changes, user, note);
    Ok(EditOutcome {
        entry: Some(entry),
        warnings,
    })
}

fn append_entry(
    record: &mut ExtractionRecord,
    changes: Vec<FieldChange>,
    user: &UserInfo,
    note: &str,
) -> ProvenanceEntry {
    let entry = ProvenanceEntry {
        timestamp: now_rfc3339(),
        user: user.clone(),
        document: record.source_document.clone(),
        changes,
        notes: note.to_string(),
        extra: Map::new(),
    };
    info!(
        "Provenance: {} change(s) by '{}' on {}",
        entry.changes.len(),
        entry.user.name,
        entry.document
    );
    record.append_provenance(entry.clone());
    entry
}

/// One change to a field, flattened with its entry's metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldHistoryEntry {
    pub timestamp: String,
    pub user: UserInfo,
    pub old_value: Value,
    pub new_value: Value,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<FieldAttribute>,
    pub notes: String,
}

/// All recorded changes to `field_name`, oldest first. Includes the rename
/// that moved the field away from this name.
pub fn field_history(record: &ExtractionRecord, field_name: &str) -> Vec<FieldHistoryEntry> {
    let renamed_from = |c: &FieldChange| {
        c.attribute == Some(FieldAttribute::Name) && c.old_value.as_str() == Some(field_name)
    };
    record
        .provenance()
        .iter()
        .flat_map(|entry| {
            entry
                .changes
                .iter()
                .filter(move |c| c.field == field_name || renamed_from(c))
                .map(move |c| FieldHistoryEntry {
                    timestamp: entry.timestamp.clone(),
                    user: entry.user.clone(),
                    old_value: c.old_value.clone(),
                    new_value: c.new_value.clone(),
                    action: c.action,
                    attribute: c.attribute,
                    notes: entry.notes.clone(),
                })
        })
        .collect()
}

/// Provenance trail as pretty JSON, in append order.
pub fn provenance_report(record: &ExtractionRecord) -> Result<String> {
    serde_json::to_string_pretty(record.provenance())
        .map_err(|e| ReviewError::Schema(format!("cannot serialize provenance: {}", e)))
}

/// Provenance trail flattened to CSV, one row per field change.
pub fn provenance_csv(record: &ExtractionRecord) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| ReviewError::Schema(format!("cannot write CSV: {}", e));

    writer
        .write_record([
            "timestamp",
            "user_name",
            "user_email",
            "document",
            "field",
            "action",
            "old_value",
            "new_value",
            "notes",
            "attribute",
        ])
        .map_err(csv_err)?;

    for entry in record.provenance() {
        for change in &entry.changes {
            let action = change.action.to_string();
            let old_value = value_to_plain_string(&change.old_value);
            let new_value = value_to_plain_string(&change.new_value);
            let attribute = change
                .attribute
                .map(|a| a.to_string())
                .unwrap_or_default();
            writer
                .write_record([
                    entry.timestamp.as_str(),
                    entry.user.name.as_str(),
                    entry.user.email.as_str(),
                    entry.document.as_str(),
                    change.field.as_str(),
                    action.as_str(),
                    old_value.as_str(),
                    new_value.as_str(),
                    entry.notes.as_str(),
                    attribute.as_str(),
                ])
                .map_err(csv_err)?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ReviewError::Schema(format!("cannot write CSV: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| ReviewError::Schema(e.to_string()))
}

/// Serialize the record, provenance included, in the upload schema.
pub fn export(record: &ExtractionRecord) -> Result<String> {
    serde_json::to_string_pretty(record)
        .map_err(|e| ReviewError::Schema(format!("cannot serialize record: {}", e)))
}

/// Download name for an exported record: `<stem>_edited_<YYYYMMDD_HHMMSS>.json`.
pub fn export_filename(original: &str) -> String {
    let base = original.rsplit(&['/', '\\'][..]).next().unwrap_or(original);
    let stem = base
        .strip_suffix(".json")
        .or_else(|| base.strip_suffix(".JSON"))
        .unwrap_or(base);
    let stem = if stem.is_empty() { "extraction" } else { stem };
    format!("{}_edited_{}.json", stem, Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn reviewer() -> UserInfo {
        UserInfo::new("Test User", "test@example.com")
    }

    fn invoice() -> ExtractionRecord {
        let mut record = ExtractionRecord::new(vec![
            Field::new("invoice_number", json!("INV-0042"), FieldType::String)
                .with_rules(["required"]),
            Field::new("subtotal", json!(1250.00), FieldType::Number),
            Field::new("tax_rate", json!(8.5), FieldType::Number),
            Field::new("tax_amount", json!(106.25), FieldType::Number)
                .with_rules(["formula:subtotal*(tax_rate/100)"]),
            Field::new("due_date", json!("2024-03-15"), FieldType::Date),
        ])
        .unwrap();
        record.source_document = "invoice.pdf".to_string();
        record
    }

    #[test]
    fn test_equal_value_writes_nothing() {
        let mut record = invoice();
        let before = record.clone();

        let outcome = apply_edit(
            &mut record,
            "subtotal",
            json!("1,250.00"),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert!(!outcome.changed());

        let outcome = apply_edit(
            &mut record,
            "due_date",
            json!("03/15/2024"),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert!(!outcome.changed());
        assert_eq!(record, before);
        assert!(record.provenance().is_empty());
    }

    #[test]
    fn test_edit_appends_one_entry() {
        let mut record = invoice();
        let outcome = apply_edit(
            &mut record,
            "tax_amount",
            json!("106.50"),
            &reviewer(),
            "matched to receipt",
            EditOptions::default(),
        )
        .unwrap();

        assert_eq!(record.provenance().len(), 1);
        let entry = &record.provenance()[0];
        assert_eq!(entry.changes.len(), 1);
        assert_eq!(entry.changes[0].old_value, json!(106.25));
        assert_eq!(entry.changes[0].new_value, json!(106.5));
        assert_eq!(entry.changes[0].action, ChangeAction::Modified);
        assert_eq!(entry.notes, "matched to receipt");
        assert_eq!(entry.document, "invoice.pdf");
        assert_eq!(entry.user.name, "Test User");
        assert_eq!(record.field("tax_amount").unwrap().value, json!(106.5));

        // The formula mismatch is reported but did not block the save.
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].field, "tax_amount");
    }

    #[test]
    fn test_editing_an_input_rechecks_formula() {
        let mut record = invoice();
        let outcome = apply_edit(
            &mut record,
            "subtotal",
            json!(1300),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].field, "tax_amount");
        // Display only: the dependent value is not recomputed.
        assert_eq!(record.field("tax_amount").unwrap().value, json!(106.25));
    }

    #[test]
    fn test_unknown_field_and_bad_value() {
        let mut record = invoice();
        let err = apply_edit(
            &mut record,
            "nope",
            json!(1),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::UnknownField(_)));

        let err = apply_edit(
            &mut record,
            "subtotal",
            json!("twelve"),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::Validation { .. }));
        assert!(record.provenance().is_empty());
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut record = invoice();
        let before = record.clone();
        let edits = vec![
            FieldEdit {
                field: "subtotal".into(),
                value: json!(1300),
            },
            FieldEdit {
                field: "due_date".into(),
                value: json!("someday"),
            },
        ];
        assert!(apply_edits(&mut record, edits, &reviewer(), "", EditOptions::default()).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn test_batch_records_one_entry() {
        let mut record = invoice();
        let edits = vec![
            FieldEdit {
                field: "subtotal".into(),
                value: json!(1300),
            },
            FieldEdit {
                field: "tax_amount".into(),
                value: json!(110.5),
            },
            FieldEdit {
                field: "tax_rate".into(),
                value: json!("8.5"),
            },
        ];
        let outcome =
            apply_edits(&mut record, edits, &reviewer(), "batch", EditOptions::default()).unwrap();
        assert_eq!(record.provenance().len(), 1);
        let fields: Vec<&str> = record.provenance()[0]
            .changes
            .iter()
            .map(|c| c.field.as_str())
            .collect();
        assert_eq!(fields, vec!["subtotal", "tax_amount"]);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_add_and_delete_field() {
        let mut record = invoice();
        let added = Field::new("po_number", json!("PO-1"), FieldType::String);
        add_field(&mut record, added, &reviewer(), "", EditOptions::default()).unwrap();

        let dup = Field::new("po_number", json!("PO-2"), FieldType::String);
        assert!(matches!(
            add_field(&mut record, dup, &reviewer(), "", EditOptions::default()),
            Err(ReviewError::DuplicateField(_))
        ));

        delete_field(&mut record, "po_number", &reviewer(), "", EditOptions::default()).unwrap();
        assert!(record.field("po_number").is_none());

        let history = field_history(&record, "po_number");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, ChangeAction::Added);
        assert_eq!(history[0].old_value, Value::Null);
        assert_eq!(history[1].action, ChangeAction::Deleted);
        assert_eq!(history[1].old_value, json!("PO-1"));
    }

    #[test]
    fn test_deleting_formula_input_warns() {
        let mut record = invoice();
        let outcome =
            delete_field(&mut record, "tax_rate", &reviewer(), "", EditOptions::default()).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].message.contains("tax_rate"));
    }

    #[test]
    fn test_export_reimport_round_trip() {
        let mut record = invoice();
        apply_edit(
            &mut record,
            "tax_amount",
            json!(106.5),
            &reviewer(),
            "first",
            EditOptions::default(),
        )
        .unwrap();
        apply_edit(
            &mut record,
            "invoice_number",
            json!("INV-0043"),
            &reviewer(),
            "second",
            EditOptions::default(),
        )
        .unwrap();

        let exported = export(&record).unwrap();
        let reimported = ExtractionRecord::from_slice("invoice.json", exported.as_bytes()).unwrap();
        assert_eq!(reimported.fields(), record.fields());
        assert_eq!(reimported.provenance(), record.provenance());
    }

    #[test]
    fn test_entries_keep_append_order() {
        let mut record = invoice();
        for (i, note) in ["a", "b", "c"].iter().enumerate() {
            apply_edit(
                &mut record,
                "subtotal",
                json!(2000 + i),
                &reviewer(),
                note,
                EditOptions::default(),
            )
            .unwrap();
        }
        let notes: Vec<&str> = record.provenance().iter().map(|e| e.notes.as_str()).collect();
        assert_eq!(notes, vec!["a", "b", "c"]);
        let history = field_history(&record, "subtotal");
        assert_eq!(history[2].old_value, json!(2001));
    }

    #[test]
    fn test_provenance_csv_rows() {
        let mut record = invoice();
        apply_edit(
            &mut record,
            "invoice_number",
            json!("INV-0043"),
            &reviewer(),
            "typo, fixed",
            EditOptions::default(),
        )
        .unwrap();
        let csv = provenance_csv(&record).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("timestamp,user_name"));
        assert!(lines[1].contains("invoice_number,modified,INV-0042,INV-0043,\"typo, fixed\""));
    }

    #[test]
    fn test_large_integer_edit_is_recorded() {
        let mut record = ExtractionRecord::new(vec![Field::new(
            "account",
            json!(9007199254740992_i64),
            FieldType::Number,
        )])
        .unwrap();
        let outcome = apply_edit(
            &mut record,
            "account",
            json!(9007199254740993_i64),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert!(outcome.changed());
        assert_eq!(record.field("account").unwrap().value, json!(9007199254740993_i64));
        assert_eq!(record.provenance().len(), 1);
    }

    #[test]
    fn test_formatted_integral_string_is_stored_as_integer() {
        let mut record = ExtractionRecord::new(vec![Field::new("count", json!(10), FieldType::Number)
            .with_rules(["precision:0"])])
        .unwrap();
        let outcome = apply_edit(
            &mut record,
            "count",
            json!("1,250.00"),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(record.field("count").unwrap().value, json!(1250));
    }

    #[test]
    fn test_definition_update_records_each_attribute() {
        let mut record = invoice();
        let update = FieldDefinitionUpdate {
            name: Some("invoice_id".into()),
            rules: Some(vec![Rule::parse("required"), Rule::parse(r"format:INV-\d{4}")]),
            ..Default::default()
        };
        let outcome = update_field_definition(
            &mut record,
            "invoice_number",
            update,
            &reviewer(),
            "schema fix",
            EditOptions::default(),
        )
        .unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(record.field("invoice_number").is_none());
        let field = record.field("invoice_id").unwrap();
        assert_eq!(field.value, json!("INV-0042"));
        assert_eq!(field.rules.len(), 2);

        let entry = &record.provenance()[0];
        assert_eq!(entry.changes.len(), 2);
        assert_eq!(entry.changes[0].attribute, Some(FieldAttribute::Name));
        assert_eq!(entry.changes[0].old_value, json!("invoice_number"));
        assert_eq!(entry.changes[0].new_value, json!("invoice_id"));
        assert_eq!(entry.changes[1].attribute, Some(FieldAttribute::Rules));
        assert_eq!(entry.changes[1].old_value, json!(["required"]));
        assert_eq!(entry.changes[1].new_value, json!(["required", r"format:INV-\d{4}"]));

        assert_eq!(field_history(&record, "invoice_id").len(), 2);
        assert_eq!(field_history(&record, "invoice_number").len(), 1);
    }

    #[test]
    fn test_type_change_recoerces_value() {
        let mut record = ExtractionRecord::new(vec![
            Field::new("qty", json!("12"), FieldType::String),
            Field::new("code", json!("A-1"), FieldType::String),
        ])
        .unwrap();
        let to_number = || FieldDefinitionUpdate {
            declared_type: Some(FieldType::Number),
            ..Default::default()
        };

        let opts = EditOptions::default();
        update_field_definition(&mut record, "qty", to_number(), &reviewer(), "", opts).unwrap();
        let field = record.field("qty").unwrap();
        assert_eq!(field.declared_type, FieldType::Number);
        assert_eq!(field.value, json!(12));
        let changes = &record.provenance()[0].changes;
        assert_eq!(changes[0].attribute, Some(FieldAttribute::Type));
        assert_eq!(changes[0].new_value, json!("number"));
        assert_eq!(changes[1].attribute, None);
        assert_eq!(changes[1].old_value, json!("12"));

        let before = record.clone();
        let err = update_field_definition(
            &mut record,
            "code",
            to_number(),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::Validation { .. }));
        assert_eq!(record, before);
    }

    #[test]
    fn test_definition_update_conflicts_and_no_ops() {
        let mut record = invoice();
        let rename = |name: &str| FieldDefinitionUpdate {
            name: Some(name.into()),
            ..Default::default()
        };
        let opts = EditOptions::default();
        let user = reviewer();
        assert!(matches!(
            update_field_definition(&mut record, "subtotal", rename("tax_rate"), &user, "", opts),
            Err(ReviewError::DuplicateField(_))
        ));
        assert!(matches!(
            update_field_definition(&mut record, "subtotal", rename("  "), &user, "", opts),
            Err(ReviewError::BadRequest(_))
        ));
        assert!(matches!(
            update_field_definition(&mut record, "nope", rename("x"), &user, "", opts),
            Err(ReviewError::UnknownField(_))
        ));

        let same = FieldDefinitionUpdate {
            name: Some("subtotal".into()),
            declared_type: Some(FieldType::Number),
            rules: Some(Vec::new()),
        };
        let outcome =
            update_field_definition(&mut record, "subtotal", same, &user, "", opts).unwrap();
        assert!(!outcome.changed());
        assert!(record.provenance().is_empty());

        // Renaming a formula input leaves the formula pointing at the old name.
        let outcome = update_field_definition(
            &mut record,
            "subtotal",
            rename("net"),
            &reviewer(),
            "",
            EditOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].field, "tax_amount");
        assert!(outcome.warnings[0].message.contains("subtotal"));
    }

    #[test]
    fn test_export_filename() {
        let name = export_filename("uploads/invoice.json");
        assert!(name.starts_with("invoice_edited_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "invoice_edited_20240101_120000.json".len());
    }
}
