//! Addressing scheme for endpoints and channels.
//!
//! Two immutable value types cover all cross-service addressing:
//!
//! - [`ApiReference`] — `"<service>:/<path>[!<method>]"`, pointing at an
//!   endpoint (optionally a specific method on it). Endpoint paths carry
//!   their leading slash, so the rendered form reads `svc://users/1`.
//! - [`ChannelReference`] — `"<service>:/<path>#<channelId>"`, naming a
//!   pub/sub channel scoped to an endpoint.
//!
//! `from_str` and `Display` are exact inverses for every well-formed input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SCHEME_SEPARATOR: &str = ":/";

/// Reference parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefParseError {
    #[error("reference '{0}' is missing the ':/' scheme separator")]
    MissingSeparator(String),
    #[error("reference '{0}' has an empty service name")]
    EmptyService(String),
    #[error("channel reference '{0}' is missing the '#' channel marker")]
    MissingChannelMarker(String),
}

/// Splits an endpoint path into its segments, dropping empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Address of an endpoint (and optionally one of its methods) in some
/// service's tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiReference {
    pub service: String,
    pub path: String,
    pub method: Option<String>,
}

impl ApiReference {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Path segments with empty segments removed.
    pub fn split(&self) -> Vec<&str> {
        split_path(&self.path)
    }
}

impl fmt::Display for ApiReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.service, SCHEME_SEPARATOR, self.path)?;
        if let Some(method) = &self.method {
            write!(f, "!{method}")?;
        }
        Ok(())
    }
}

impl FromStr for ApiReference {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, rest) = split_scheme(s)?;
        let (path, method) = match rest.split_once('!') {
            Some((path, method)) => (path, Some(method.to_string())),
            None => (rest, None),
        };
        Ok(Self {
            service: service.to_string(),
            path: path.to_string(),
            method,
        })
    }
}

impl TryFrom<String> for ApiReference {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ApiReference> for String {
    fn from(r: ApiReference) -> Self {
        r.to_string()
    }
}

/// Address of a pub/sub channel scoped to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelReference {
    pub service: String,
    pub path: String,
    pub channel_id: String,
}

impl ChannelReference {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}#{}",
            self.service, SCHEME_SEPARATOR, self.path, self.channel_id
        )
    }
}

impl FromStr for ChannelReference {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, rest) = split_scheme(s)?;
        let (path, channel_id) = rest
            .rsplit_once('#')
            .ok_or_else(|| RefParseError::MissingChannelMarker(s.to_string()))?;
        Ok(Self {
            service: service.to_string(),
            path: path.to_string(),
            channel_id: channel_id.to_string(),
        })
    }
}

impl TryFrom<String> for ChannelReference {
    type Error = RefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChannelReference> for String {
    fn from(r: ChannelReference) -> Self {
        r.to_string()
    }
}

fn split_scheme(s: &str) -> Result<(&str, &str), RefParseError> {
    let (service, rest) = s
        .split_once(SCHEME_SEPARATOR)
        .ok_or_else(|| RefParseError::MissingSeparator(s.to_string()))?;
    if service.is_empty() {
        return Err(RefParseError::EmptyService(s.to_string()));
    }
    Ok((service, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_reference_round_trip() {
        for s in ["auth://users/42", "auth://users/42!get", "svc:/x", "a://"] {
            let r: ApiReference = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
        }
    }

    #[test]
    fn api_reference_fields() {
        let r: ApiReference = "auth://users/42!get".parse().unwrap();
        assert_eq!(r.service, "auth");
        assert_eq!(r.path, "/users/42");
        assert_eq!(r.method.as_deref(), Some("get"));
        assert_eq!(r.split(), vec!["users", "42"]);
    }

    #[test]
    fn api_reference_malformed() {
        assert_eq!(
            "no-separator".parse::<ApiReference>(),
            Err(RefParseError::MissingSeparator("no-separator".into()))
        );
        assert_eq!(
            ":/users".parse::<ApiReference>(),
            Err(RefParseError::EmptyService(":/users".into()))
        );
    }

    #[test]
    fn channel_reference_round_trip() {
        let s = "auth://users#live_abc123";
        let r: ChannelReference = s.parse().unwrap();
        assert_eq!(r.service, "auth");
        assert_eq!(r.path, "/users");
        assert_eq!(r.channel_id, "live_abc123");
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn channel_reference_requires_marker() {
        assert_eq!(
            "auth://users".parse::<ChannelReference>(),
            Err(RefParseError::MissingChannelMarker("auth://users".into()))
        );
    }

    #[test]
    fn split_path_drops_empty_segments() {
        assert_eq!(split_path("/users//42/"), vec!["users", "42"]);
        assert!(split_path("").is_empty());
        assert!(split_path("///").is_empty());
    }
}
