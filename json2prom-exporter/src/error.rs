//! Error types for the exporter.
//!
//! Configuration errors live in [`crate::config::ConfigError`]; everything
//! raised after the configuration is loaded is defined here.

use std::net::SocketAddr;

use json2prom_common::QueryParseError;
use reqwest::StatusCode;
use thiserror::Error;

/// A target could not be turned into a running poller.
///
/// Scoped to one target: depending on the startup policy the target is
/// skipped or the process exits.
#[derive(Debug, Error)]
pub enum TargetInitError {
    #[error("target '{target}': unsupported HTTP method '{method}'")]
    InvalidMethod { target: String, method: String },

    #[error("target '{target}': invalid URI '{uri}': {reason}")]
    InvalidUri {
        target: String,
        uri: String,
        reason: String,
    },

    #[error("target '{target}': invalid header '{name}': {reason}")]
    InvalidHeader {
        target: String,
        name: String,
        reason: String,
    },

    #[error("target '{target}': includeAuthHeader is set but no authorization value was supplied")]
    MissingAuthHeader { target: String },

    #[error("target '{target}': bearer token environment variable '{var}' is not set")]
    MissingBearerToken { target: String, var: String },

    #[error("target '{target}', metric '{metric}': {source}")]
    Query {
        target: String,
        metric: String,
        #[source]
        source: QueryParseError,
    },
}

impl TargetInitError {
    /// Name of the target that failed.
    pub fn target(&self) -> &str {
        match self {
            Self::InvalidMethod { target, .. }
            | Self::InvalidUri { target, .. }
            | Self::InvalidHeader { target, .. }
            | Self::MissingAuthHeader { target }
            | Self::MissingBearerToken { target, .. }
            | Self::Query { target, .. } => target,
        }
    }
}

/// A request to a target failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("target '{target}': request failed: {source}")]
    Transport {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("target '{target}': unexpected HTTP status {status}")]
    Status { target: String, status: StatusCode },

    #[error("target '{target}': failed to read response body: {source}")]
    Body {
        target: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A poll cycle was abandoned before anything was published.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("target '{target}': response is not valid JSON: {source}")]
    Parse {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CycleError {
    /// Which stage of the cycle failed.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Fetch(_) => FailureReason::Fetch,
            Self::Parse { .. } => FailureReason::Parse,
        }
    }
}

/// Stage at which a poll cycle was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureReason {
    Fetch,
    Parse,
}

impl FailureReason {
    /// Label value used on failure counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
        }
    }
}

/// One item could not produce an observation. Only that item is dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ItemError {
    #[error("value query found {found}, expected a number")]
    ValueNotNumeric { found: &'static str },

    #[error("value query found non-numeric string '{text}'")]
    ValueNotParsable { text: String },

    #[error("label '{label}' query found {found}, expected a scalar")]
    LabelNotScalar { label: String, found: &'static str },
}

/// The metrics endpoint could not be served.
#[derive(Debug, Error)]
pub enum ExpositionError {
    #[error("failed to bind metrics endpoint to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// The supervisor could not start polling.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Target(#[from] TargetInitError),

    #[error("no target could be started ({failed} failed)")]
    NoTargets { failed: usize },
}
