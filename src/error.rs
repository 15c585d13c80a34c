//! Error types for destination configuration and request forwarding.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Errors detected while loading or validating the destination table.
/// Every variant is startup-fatal: the router exits non-zero instead of
/// serving with a broken table.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No destination configuration was supplied at all.
    #[error("no destinations configured: set the `destinations` environment variable or pass --destinations / --destinations-file")]
    Missing,

    /// The destinations file could not be read.
    #[error("cannot read destinations file {}: {source}", path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination JSON did not parse.
    #[error("malformed destinations JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The table parsed but holds no destinations.
    #[error("destination table is empty")]
    EmptyTable,

    /// A destination name appears more than once.
    #[error("duplicate destination name {0:?}")]
    DuplicateName(String),

    /// A destination name is empty or blank.
    #[error("destination at index {0} has an empty name")]
    EmptyName(usize),

    /// A destination's URL prefix is not usable as a route.
    #[error("destination {name:?} has invalid url prefix {prefix:?}: must start with '/'")]
    BadPrefix { name: String, prefix: String },

    /// A destination's target base URL is not usable.
    #[error("destination {name:?} has invalid target URL: {reason}")]
    BadTarget { name: String, reason: String },
}

/// Errors raised while forwarding a single request. Each one maps to a
/// gateway response for the caller; none of them take the router down.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No destination prefix matched the request path.
    #[error("no destination matches path {0:?}")]
    NoDestination(String),

    /// The destination could not be reached or failed mid-exchange.
    #[error("destination {name:?} unreachable: {source}")]
    Upstream {
        name: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// The destination produced no response headers within the bound.
    #[error("destination {name:?} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The outbound request could not be constructed.
    #[error("invalid upstream request for destination {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ForwardError {
    /// Status code of the gateway response reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::NoDestination(_) => StatusCode::NOT_FOUND,
            ForwardError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Invalid { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
