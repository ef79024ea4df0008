//! JSON-schema validation for inbound messages.
//!
//! The schema set (aviation data model v1.0) is embedded at compile time and
//! compiled once at boot; validation afterwards is a pure in-memory check.
//! Validation failures attach to the message rather than dropping it.

use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::errors::AppError;
use crate::messages::{Category, Message, SourceType, Validation};

const SCHEMA_SOURCES: &[(&str, &str)] = &[
    ("acars", include_str!("../schemas/acars.json")),
    ("acars-oooi", include_str!("../schemas/acars-oooi.json")),
    ("acars-position", include_str!("../schemas/acars-position.json")),
    ("hfgcs", include_str!("../schemas/hfgcs.json")),
    ("eam", include_str!("../schemas/eam.json")),
];

pub struct SchemaValidator {
    schemas: HashMap<&'static str, Validator>,
}

impl SchemaValidator {
    /// Compile the embedded schema set. A schema that fails to compile is a
    /// boot-time error.
    pub fn new() -> Result<Self, AppError> {
        let mut schemas = HashMap::new();
        for (name, raw) in SCHEMA_SOURCES {
            let doc: Value = serde_json::from_str(raw)
                .map_err(|e| AppError::Fatal(format!("schema {name} is not valid JSON: {e}")))?;
            let compiled = jsonschema::validator_for(&doc)
                .map_err(|e| AppError::Fatal(format!("schema {name} failed to compile: {e}")))?;
            schemas.insert(*name, compiled);
        }
        debug!(count = schemas.len(), "compiled message schemas");
        Ok(Self { schemas })
    }

    pub fn schema_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.schemas.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate a document against a named schema. Errors carry JSON-pointer
    /// instance paths.
    pub fn validate(&self, schema_name: &str, doc: &Value) -> Result<Validation, AppError> {
        let schema = self
            .schemas
            .get(schema_name)
            .ok_or_else(|| AppError::NotFound(format!("schema '{schema_name}'")))?;

        let errors: Vec<String> = schema
            .iter_errors(doc)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();

        Ok(Validation {
            valid: errors.is_empty(),
            errors,
        })
    }

    /// Pick the schema for a message from its source type and category, then
    /// validate the serialized message against it.
    pub fn validate_acars_message(&self, msg: &Message) -> Result<Validation, AppError> {
        let schema_name = Self::schema_for(msg.source_type, msg.category);
        let doc = serde_json::to_value(msg)
            .map_err(|e| AppError::Validation(format!("message not serializable: {e}")))?;
        self.validate(schema_name, &doc)
    }

    fn schema_for(source_type: SourceType, category: Option<Category>) -> &'static str {
        match source_type {
            SourceType::Hfgcs => "hfgcs",
            SourceType::Eam => "eam",
            SourceType::Acars | SourceType::Vdlm2 | SourceType::Hfdl | SourceType::Adsb => {
                match category {
                    Some(Category::Oooi) => "acars-oooi",
                    Some(Category::Position) => "acars-position",
                    _ => "acars",
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{OooiEvent, SourceInfo};
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::new().expect("embedded schemas must compile")
    }

    #[test]
    fn test_all_schemas_compile() {
        let v = validator();
        assert_eq!(
            v.schema_names(),
            vec!["acars", "acars-oooi", "acars-position", "eam", "hfgcs"]
        );
    }

    #[test]
    fn test_unknown_schema_name_is_not_found() {
        let v = validator();
        let err = v.validate("bogus", &json!({})).unwrap_err();
        assert_eq!(err.id(), "not_found");
    }

    #[test]
    fn test_missing_required_field_reports_pointer_path() {
        let v = validator();
        let result = v
            .validate("acars", &json!({"id": "m1", "timestamp": "2026-01-01T00:00:00Z"}))
            .unwrap();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("source_type")));
    }

    #[test]
    fn test_valid_oooi_message_passes() {
        let v = validator();
        let mut msg = Message::new(SourceType::Acars, SourceInfo::default());
        msg.category = Some(Category::Oooi);
        msg.oooi = Some(OooiEvent {
            event: "OUT".into(),
            time: "1420".into(),
        });
        let result = v.validate_acars_message(&msg).unwrap();
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn test_bad_oooi_event_fails() {
        let v = validator();
        let mut msg = Message::new(SourceType::Acars, SourceInfo::default());
        msg.category = Some(Category::Oooi);
        msg.oooi = Some(OooiEvent {
            event: "LAUNCH".into(),
            time: "1420".into(),
        });
        let result = v.validate_acars_message(&msg).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_hfgcs_requires_text() {
        let v = validator();
        let msg = Message::new(SourceType::Hfgcs, SourceInfo::default());
        let result = v.validate_acars_message(&msg).unwrap();
        assert!(!result.valid);
    }
}
