//! Error taxonomy for endpoint resolution, method invocation and the
//! broker-facing client.

use apibus_validator::InvalidValue;
use thiserror::Error;

use crate::types::RefParseError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Closed set of core failures.
///
/// Path-resolution and method-invocation failures reject the entire call;
/// resolver sub-lookup failures never surface here (they degrade to
/// null/default values at the resolver layer).
#[derive(Debug, Error)]
pub enum ApiError {
    /// A path segment did not resolve. Carries the full path the caller
    /// asked for when raised by the dispatch engine.
    #[error("endpoint '{path}' not found")]
    EndpointNotFound { path: String },

    #[error("endpoint '{path}' has no method '{method}'")]
    UndefinedMethod { path: String, method: String },

    /// Authoring defect: a declared property handler resolved to no node.
    #[error("endpoint '{path}' has an invalid property constructor for '{name}'")]
    InvalidPropertyConstructor { path: String, name: String },

    /// Authoring defect: a pre-invoke hook produced a non-object params
    /// value.
    #[error("endpoint '{path}' has an invalid method constructor for '{method}'")]
    InvalidMethodConstructor { path: String, method: String },

    #[error(transparent)]
    InvalidValue(#[from] InvalidValue),

    #[error(transparent)]
    Reference(#[from] RefParseError),

    #[error("api client is not connected")]
    NotConnected,

    #[error("already subscribed to queue '{0}'")]
    QueueBusy(String),

    /// Backend-callback escape hatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Numeric code used by wire transports when mapping errors onto the
    /// protocol's error command.
    pub fn code(&self) -> u16 {
        match self {
            ApiError::EndpointNotFound { .. } => 404,
            ApiError::UndefinedMethod { .. } => 400,
            ApiError::InvalidPropertyConstructor { .. } => 501,
            ApiError::InvalidMethodConstructor { .. } => 502,
            ApiError::InvalidValue(_) => 422,
            ApiError::Reference(_) => 400,
            ApiError::NotConnected => 503,
            ApiError::QueueBusy(_) => 409,
            ApiError::Other(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ApiError::EndpointNotFound { path: "/x".into() }.code(),
            404
        );
        assert_eq!(
            ApiError::UndefinedMethod {
                path: "/x".into(),
                method: "m".into()
            }
            .code(),
            400
        );
        assert_eq!(ApiError::NotConnected.code(), 503);
    }
}
