//! Composite parameter validation.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::InvalidValue;
use crate::field::Field;
use crate::JsonMap;

/// Ordered field-name → rule map validating a whole params object.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    fields: BTreeMap<String, Field>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field registration.
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        self.fields.insert(name.into(), field);
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter()
    }

    /// Clone of this validator with every field made optional; used to relax
    /// a create-schema into an update-schema.
    pub fn relaxed(&self) -> Validator {
        Validator {
            fields: self
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), field.clone().optional()))
                .collect(),
        }
    }

    /// Validate a params object field by field.
    ///
    /// In `strict` mode the output contains only declared fields (unknown
    /// keys are stripped); otherwise undeclared input keys pass through
    /// untouched. `prefix` dots sub-field names for nested validation.
    pub fn validate(
        &self,
        params: &JsonMap,
        strict: bool,
        prefix: Option<&str>,
    ) -> Result<JsonMap, InvalidValue> {
        let mut out = if strict {
            JsonMap::new()
        } else {
            params.clone()
        };
        for (name, field) in &self.fields {
            let full_name = match prefix {
                Some(p) => format!("{p}.{name}"),
                None => name.clone(),
            };
            let value = field.validate(&full_name, params.get(name), strict)?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// Partial validation: only keys present in the input are validated
    /// (required is not enforced for absent fields) and unknown keys are
    /// stripped. Used by record `update`, where unspecified fields must
    /// stay unspecified rather than be nulled.
    pub fn validate_partial(&self, params: &JsonMap) -> Result<JsonMap, InvalidValue> {
        let mut out = JsonMap::new();
        for (name, field) in &self.fields {
            let Some(value) = params.get(name) else {
                continue;
            };
            out.insert(name.clone(), field.validate(name, Some(value), true)?);
        }
        Ok(out)
    }

    /// Map of field name → rule description.
    pub fn describe(&self) -> Value {
        let mut out = JsonMap::new();
        for (name, field) in &self.fields {
            out.insert(name.clone(), field.describe());
        }
        Value::Object(out)
    }
}
