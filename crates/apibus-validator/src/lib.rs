//! Parameter validation for apibus endpoints.
//!
//! Every remote-callable method declares its parameters as a set of typed
//! field rules. The dispatch layer validates incoming params against those
//! rules *before* the method handler runs, so handlers never see raw
//! untrusted input.
//!
//! Two levels:
//!
//! - [`Field`] — a single-field rule (`validate(name, value, strict)`),
//!   built with the constructor helpers ([`text`], [`number`], [`object`], ...).
//! - [`Validator`] — a composite, ordered field-name → rule map
//!   (`validate(params, strict, prefix)`); in strict mode unknown keys are
//!   stripped from the output.
//!
//! Failures carry a typed [`InvalidValue`] with the rule kind, the (dotted)
//! field name and a human-readable message.
//!
//! ```
//! use apibus_validator::{text, number, Validator};
//! use serde_json::json;
//!
//! let rules = Validator::new()
//!     .field("name", text().required())
//!     .field("age", number().min(0.0));
//!
//! let params = json!({"name": "Bob", "age": 42, "junk": true});
//! let clean = rules.validate(params.as_object().unwrap(), true, None).unwrap();
//! assert!(clean.get("junk").is_none());
//! ```

mod error;
mod field;
mod validator;

pub use error::{InvalidKind, InvalidValue};
pub use field::{
    any, array, boolean, date, email, many_of, number, object, one_of, text, Field, FieldKind,
};
pub use validator::Validator;

/// Shorthand for `serde_json`'s object map.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
