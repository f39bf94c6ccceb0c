//! Single-field rules.

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::error::{InvalidKind, InvalidValue};
use crate::validator::Validator;
use crate::JsonMap;

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9.\-_]+@[a-zA-Z0-9.\-_]+$").expect("static email pattern")
    })
}

/// The rule applied to a field's value once presence has been checked.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Presence check only.
    Any,
    Text {
        allow_empty: bool,
        min_length: Option<usize>,
        max_length: Option<usize>,
        pattern: Option<Regex>,
    },
    Email,
    Number {
        min: Option<f64>,
        max: Option<f64>,
        float: bool,
    },
    Boolean,
    /// ISO 8601 calendar date (`YYYY-MM-DD`), normalized back to that form.
    Date,
    Array,
    Object {
        properties: Option<Box<Validator>>,
    },
    OneOf {
        options: Vec<Value>,
    },
    ManyOf {
        options: Vec<Value>,
        allow_empty: bool,
    },
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::Text { .. } => "text",
            FieldKind::Email => "email",
            FieldKind::Number { .. } => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Array => "array",
            FieldKind::Object { .. } => "object",
            FieldKind::OneOf { .. } => "option",
            FieldKind::ManyOf { .. } => "multioption",
        }
    }
}

/// A single-field validator: presence rule plus a [`FieldKind`] and
/// descriptive metadata surfaced by endpoint schema introspection.
#[derive(Debug, Clone)]
pub struct Field {
    pub label: Option<String>,
    pub description: Option<String>,
    pub required: bool,
    pub kind: FieldKind,
}

pub fn any() -> Field {
    Field::new(FieldKind::Any)
}

pub fn text() -> Field {
    Field::new(FieldKind::Text {
        allow_empty: false,
        min_length: None,
        max_length: None,
        pattern: None,
    })
}

pub fn email() -> Field {
    Field::new(FieldKind::Email)
}

pub fn number() -> Field {
    Field::new(FieldKind::Number {
        min: None,
        max: None,
        float: false,
    })
}

pub fn boolean() -> Field {
    Field::new(FieldKind::Boolean)
}

pub fn date() -> Field {
    Field::new(FieldKind::Date)
}

pub fn array() -> Field {
    Field::new(FieldKind::Array)
}

pub fn object() -> Field {
    Field::new(FieldKind::Object { properties: None })
}

pub fn one_of(options: Vec<Value>) -> Field {
    Field::new(FieldKind::OneOf { options })
}

pub fn many_of(options: Vec<Value>) -> Field {
    Field::new(FieldKind::ManyOf {
        options,
        allow_empty: true,
    })
}

impl Field {
    fn new(kind: FieldKind) -> Self {
        Self {
            label: None,
            description: None,
            required: false,
            kind,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Drops the required flag; used to relax create-schemas into
    /// partial-update schemas.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        match &mut self.kind {
            FieldKind::Text { allow_empty, .. } | FieldKind::ManyOf { allow_empty, .. } => {
                *allow_empty = true
            }
            _ => {}
        }
        self
    }

    pub fn deny_empty(mut self) -> Self {
        match &mut self.kind {
            FieldKind::Text { allow_empty, .. } | FieldKind::ManyOf { allow_empty, .. } => {
                *allow_empty = false
            }
            _ => {}
        }
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        if let FieldKind::Text { min_length, .. } = &mut self.kind {
            *min_length = Some(n);
        }
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        if let FieldKind::Text { max_length, .. } = &mut self.kind {
            *max_length = Some(n);
        }
        self
    }

    pub fn pattern(mut self, re: Regex) -> Self {
        if let FieldKind::Text { pattern, .. } = &mut self.kind {
            *pattern = Some(re);
        }
        self
    }

    pub fn min(mut self, v: f64) -> Self {
        if let FieldKind::Number { min, .. } = &mut self.kind {
            *min = Some(v);
        }
        self
    }

    pub fn max(mut self, v: f64) -> Self {
        if let FieldKind::Number { max, .. } = &mut self.kind {
            *max = Some(v);
        }
        self
    }

    pub fn float(mut self) -> Self {
        if let FieldKind::Number { float, .. } = &mut self.kind {
            *float = true;
        }
        self
    }

    pub fn properties(mut self, validator: Validator) -> Self {
        if let FieldKind::Object { properties } = &mut self.kind {
            *properties = Some(Box::new(validator));
        }
        self
    }

    /// Validate one value. Absent and `null` are equivalent; non-required
    /// absent values normalize to `null` (arrays to `[]`, objects to `{}`).
    pub fn validate(
        &self,
        name: &str,
        value: Option<&Value>,
        strict: bool,
    ) -> Result<Value, InvalidValue> {
        let present = matches!(value, Some(v) if !v.is_null());

        if !present {
            if self.required {
                return Err(InvalidValue::new(
                    InvalidKind::Mandatory,
                    name,
                    "value must be specified",
                ));
            }
            return Ok(match &self.kind {
                FieldKind::Array | FieldKind::ManyOf { .. } => json!([]),
                FieldKind::Object { .. } => Value::Object(JsonMap::new()),
                _ => Value::Null,
            });
        }

        let value = value.unwrap_or(&Value::Null);

        match &self.kind {
            FieldKind::Any => Ok(value.clone()),
            FieldKind::Text {
                allow_empty,
                min_length,
                max_length,
                pattern,
            } => {
                let s = value.as_str().ok_or_else(|| {
                    InvalidValue::new(InvalidKind::NotText, name, "value must be a text")
                })?;
                if self.required && !allow_empty && s.is_empty() {
                    return Err(InvalidValue::new(
                        InvalidKind::Empty,
                        name,
                        "value must not be empty",
                    ));
                }
                if let Some(min) = min_length {
                    if s.chars().count() < *min {
                        return Err(InvalidValue::new(
                            InvalidKind::MinLength,
                            name,
                            format!("value length must be greater or equal to {min}"),
                        ));
                    }
                }
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        return Err(InvalidValue::new(
                            InvalidKind::MaxLength,
                            name,
                            format!("value length must be lesser or equal to {max}"),
                        ));
                    }
                }
                if let Some(re) = pattern {
                    if !re.is_match(s) {
                        return Err(InvalidValue::new(
                            InvalidKind::Pattern,
                            name,
                            format!("value must match pattern '{}'", re.as_str()),
                        ));
                    }
                }
                Ok(value.clone())
            }
            FieldKind::Email => {
                let s = value.as_str().ok_or_else(|| {
                    InvalidValue::new(InvalidKind::NotText, name, "value must be a text")
                })?;
                if !email_pattern().is_match(s) {
                    return Err(InvalidValue::new(
                        InvalidKind::NotEmail,
                        name,
                        "value must be a valid e-mail address",
                    ));
                }
                Ok(value.clone())
            }
            FieldKind::Number { min, max, float } => {
                // Numeric strings are coerced; anything else is rejected.
                let parsed = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                let Some(n) = parsed.filter(|n| n.is_finite()) else {
                    return Err(InvalidValue::new(
                        InvalidKind::NotNumeric,
                        name,
                        if *float {
                            "value must be a floating point number"
                        } else {
                            "value must be a number"
                        },
                    ));
                };
                let n = if *float { n } else { n.trunc() };
                if let Some(min) = min {
                    if n < *min {
                        return Err(InvalidValue::new(
                            InvalidKind::MinValue,
                            name,
                            format!("value must be greater or equal to {min}"),
                        ));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(InvalidValue::new(
                            InvalidKind::MaxValue,
                            name,
                            format!("value must be lesser or equal to {max}"),
                        ));
                    }
                }
                if *float {
                    Ok(json!(n))
                } else {
                    Ok(json!(n as i64))
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    return Err(InvalidValue::new(
                        InvalidKind::NotBoolean,
                        name,
                        "value must be a boolean",
                    ));
                }
                Ok(value.clone())
            }
            FieldKind::Date => {
                let parsed = value
                    .as_str()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
                match parsed {
                    Some(d) => Ok(Value::String(d.format("%Y-%m-%d").to_string())),
                    None => Err(InvalidValue::new(
                        InvalidKind::NotDate,
                        name,
                        "value must be a valid ISO 8601 date",
                    )),
                }
            }
            FieldKind::Array => {
                if !value.is_array() {
                    return Err(InvalidValue::new(
                        InvalidKind::NotArray,
                        name,
                        "value must be an array",
                    ));
                }
                Ok(value.clone())
            }
            FieldKind::Object { properties } => {
                let Some(map) = value.as_object() else {
                    return Err(InvalidValue::new(
                        InvalidKind::NotObject,
                        name,
                        "value must be an object",
                    ));
                };
                match properties {
                    Some(validator) => Ok(Value::Object(validator.validate(
                        map,
                        strict,
                        Some(name),
                    )?)),
                    None => Ok(value.clone()),
                }
            }
            FieldKind::OneOf { options } => {
                if !options.contains(value) {
                    return Err(InvalidValue::new(
                        InvalidKind::InvalidOption,
                        name,
                        format!("value must be one of the options: {}", render_options(options)),
                    ));
                }
                Ok(value.clone())
            }
            FieldKind::ManyOf {
                options,
                allow_empty,
            } => {
                let Some(items) = value.as_array() else {
                    return Err(InvalidValue::new(
                        InvalidKind::NotArray,
                        name,
                        "value must be an array",
                    ));
                };
                if !allow_empty && items.is_empty() {
                    return Err(InvalidValue::new(
                        InvalidKind::Empty,
                        name,
                        "value must be an array with at least one element",
                    ));
                }
                for item in items {
                    if !options.contains(item) {
                        return Err(InvalidValue::new(
                            InvalidKind::InvalidOption,
                            name,
                            format!(
                                "values must be one of the options: {}",
                                render_options(options)
                            ),
                        ));
                    }
                }
                Ok(value.clone())
            }
        }
    }

    /// Static description of this rule, surfaced by the `schema` method.
    pub fn describe(&self) -> Value {
        let mut out = JsonMap::new();
        out.insert("type".into(), json!(self.kind.type_name()));
        out.insert("required".into(), json!(self.required));
        if let Some(label) = &self.label {
            out.insert("label".into(), json!(label));
        }
        if let Some(description) = &self.description {
            out.insert("description".into(), json!(description));
        }
        match &self.kind {
            FieldKind::Text {
                min_length,
                max_length,
                pattern,
                ..
            } => {
                if let Some(n) = min_length {
                    out.insert("minLength".into(), json!(n));
                }
                if let Some(n) = max_length {
                    out.insert("maxLength".into(), json!(n));
                }
                if let Some(re) = pattern {
                    out.insert("pattern".into(), json!(re.as_str()));
                }
            }
            FieldKind::Number { min, max, float } => {
                if let Some(v) = min {
                    out.insert("min".into(), json!(v));
                }
                if let Some(v) = max {
                    out.insert("max".into(), json!(v));
                }
                out.insert("float".into(), json!(float));
            }
            FieldKind::Object {
                properties: Some(validator),
            } => {
                out.insert("properties".into(), validator.describe());
            }
            FieldKind::OneOf { options } | FieldKind::ManyOf { options, .. } => {
                out.insert("options".into(), json!(options));
            }
            _ => {}
        }
        Value::Object(out)
    }
}

fn render_options(options: &[Value]) -> String {
    options
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_missing_and_null() {
        let f = text().required();
        let err = f.validate("name", None, true).unwrap_err();
        assert_eq!(err.kind, InvalidKind::Mandatory);
        let err = f.validate("name", Some(&Value::Null), true).unwrap_err();
        assert_eq!(err.kind, InvalidKind::Mandatory);
    }

    #[test]
    fn optional_missing_normalizes_by_kind() {
        assert_eq!(text().validate("t", None, true).unwrap(), Value::Null);
        assert_eq!(array().validate("a", None, true).unwrap(), json!([]));
        assert_eq!(object().validate("o", None, true).unwrap(), json!({}));
    }

    #[test]
    fn text_rules() {
        let f = text().required().min_length(2).max_length(4);
        assert_eq!(f.validate("t", Some(&json!("abc")), true).unwrap(), json!("abc"));
        assert_eq!(
            f.validate("t", Some(&json!("a")), true).unwrap_err().kind,
            InvalidKind::MinLength
        );
        assert_eq!(
            f.validate("t", Some(&json!("abcde")), true).unwrap_err().kind,
            InvalidKind::MaxLength
        );
        assert_eq!(
            f.validate("t", Some(&json!("")), true).unwrap_err().kind,
            InvalidKind::Empty
        );
        assert_eq!(
            f.validate("t", Some(&json!(12)), true).unwrap_err().kind,
            InvalidKind::NotText
        );
    }

    #[test]
    fn text_pattern() {
        let f = text().pattern(Regex::new("^[a-z]+$").unwrap());
        assert!(f.validate("t", Some(&json!("abc")), true).is_ok());
        assert_eq!(
            f.validate("t", Some(&json!("ABC")), true).unwrap_err().kind,
            InvalidKind::Pattern
        );
    }

    #[test]
    fn email_rules() {
        let f = email();
        assert!(f.validate("e", Some(&json!("a.b@c.d")), true).is_ok());
        assert_eq!(
            f.validate("e", Some(&json!("nope")), true).unwrap_err().kind,
            InvalidKind::NotEmail
        );
    }

    #[test]
    fn number_rules_and_coercion() {
        let f = number().min(0.0).max(10.0);
        assert_eq!(f.validate("n", Some(&json!(3)), true).unwrap(), json!(3));
        assert_eq!(f.validate("n", Some(&json!("7")), true).unwrap(), json!(7));
        assert_eq!(f.validate("n", Some(&json!(3.9)), true).unwrap(), json!(3));
        assert_eq!(
            f.validate("n", Some(&json!(-1)), true).unwrap_err().kind,
            InvalidKind::MinValue
        );
        assert_eq!(
            f.validate("n", Some(&json!(11)), true).unwrap_err().kind,
            InvalidKind::MaxValue
        );
        assert_eq!(
            f.validate("n", Some(&json!("abc")), true).unwrap_err().kind,
            InvalidKind::NotNumeric
        );

        let f = number().float();
        assert_eq!(f.validate("n", Some(&json!(3.5)), true).unwrap(), json!(3.5));
    }

    #[test]
    fn boolean_rules() {
        assert!(boolean().validate("b", Some(&json!(true)), true).is_ok());
        assert_eq!(
            boolean().validate("b", Some(&json!(1)), true).unwrap_err().kind,
            InvalidKind::NotBoolean
        );
    }

    #[test]
    fn date_rules() {
        assert_eq!(
            date().validate("d", Some(&json!("2024-02-29")), true).unwrap(),
            json!("2024-02-29")
        );
        assert_eq!(
            date().validate("d", Some(&json!("2023-02-29")), true).unwrap_err().kind,
            InvalidKind::NotDate
        );
    }

    #[test]
    fn option_rules() {
        let f = one_of(vec![json!("a"), json!("b")]);
        assert!(f.validate("o", Some(&json!("a")), true).is_ok());
        assert_eq!(
            f.validate("o", Some(&json!("c")), true).unwrap_err().kind,
            InvalidKind::InvalidOption
        );

        let f = many_of(vec![json!(1), json!(2)]).required().deny_empty();
        assert!(f.validate("m", Some(&json!([1, 2])), true).is_ok());
        assert_eq!(
            f.validate("m", Some(&json!([])), true).unwrap_err().kind,
            InvalidKind::Empty
        );
        assert_eq!(
            f.validate("m", Some(&json!([3])), true).unwrap_err().kind,
            InvalidKind::InvalidOption
        );
    }

    #[test]
    fn describe_carries_constraints() {
        let d = number().min(1.0).label("Limit").describe();
        assert_eq!(d["type"], json!("number"));
        assert_eq!(d["min"], json!(1.0));
        assert_eq!(d["label"], json!("Limit"));
    }
}
