//! Typed validation failure.

use thiserror::Error;

/// Closed set of rule kinds a field can fail on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidKind {
    /// Required value is missing.
    Mandatory,
    /// Value is present but empty where emptiness is not allowed.
    Empty,
    MinLength,
    MaxLength,
    Pattern,
    NotText,
    NotEmail,
    NotNumeric,
    MinValue,
    MaxValue,
    NotBoolean,
    NotDate,
    NotArray,
    NotObject,
    InvalidOption,
}

impl InvalidKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidKind::Mandatory => "Mandatory",
            InvalidKind::Empty => "Empty",
            InvalidKind::MinLength => "MinLength",
            InvalidKind::MaxLength => "MaxLength",
            InvalidKind::Pattern => "Pattern",
            InvalidKind::NotText => "NotText",
            InvalidKind::NotEmail => "NotEmail",
            InvalidKind::NotNumeric => "NotNumeric",
            InvalidKind::MinValue => "MinValue",
            InvalidKind::MaxValue => "MaxValue",
            InvalidKind::NotBoolean => "NotBoolean",
            InvalidKind::NotDate => "NotDate",
            InvalidKind::NotArray => "NotArray",
            InvalidKind::NotObject => "NotObject",
            InvalidKind::InvalidOption => "InvalidOption",
        }
    }
}

/// A single invalid-value failure: which rule, which field, and why.
///
/// The field name is dotted for nested object validation
/// (e.g. `where.limit`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("value of parameter {{{field}}} is not valid: {message}")]
pub struct InvalidValue {
    pub kind: InvalidKind,
    pub field: String,
    pub message: String,
}

impl InvalidValue {
    pub fn new(kind: InvalidKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            message: message.into(),
        }
    }
}
