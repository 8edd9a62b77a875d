//! Error types shared by the protocol layer and the external collaborators.
//!
//! Store and IO plumbing uses `anyhow::Result`; anything that has to reach a
//! client is turned into an [`RpcError`], which knows its JSON-RPC code.

use thiserror::Error;

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const NOT_FOUND: i64 = -32001;
pub const NO_DATA: i64 = -32002;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no data yet: {0}")]
    NoData(String),

    /// A store capability the request needs is switched off.
    #[error("{0} not available")]
    Unavailable(String),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::NotFound(_) => NOT_FOUND,
            Self::NoData(_) | Self::Unavailable(_) => NO_DATA,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    pub fn unknown_resource(uri: &str) -> Self {
        Self::InvalidParams(format!("unknown resource: {uri}"))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Coarse classification of a failed call into an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    NetworkUnavailable,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NetworkUnavailable => write!(f, "network unavailable"),
            Self::Other => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ExternalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

// sysexits.h codes that collaborators are expected to use
const EX_UNAVAILABLE: i32 = 69;
const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;

/// The single place where a failed external call is mapped to an [`ErrorKind`].
///
/// `status` is the exit or HTTP-like status reported by the collaborator, if
/// any; `detail` is whatever diagnostic text it produced.
pub fn classify(status: Option<i32>, detail: &str) -> ExternalError {
    let lowered = detail.to_ascii_lowercase();
    let kind = match status {
        Some(401) | Some(403) | Some(EX_NOPERM) => ErrorKind::Unauthorized,
        Some(EX_UNAVAILABLE) | Some(EX_TEMPFAIL) | Some(502..=504) => {
            ErrorKind::NetworkUnavailable
        }
        _ if lowered.contains("unauthorized")
            || lowered.contains("forbidden")
            || lowered.contains("invalid api key") =>
        {
            ErrorKind::Unauthorized
        }
        _ if lowered.contains("connection refused")
            || lowered.contains("timed out")
            || lowered.contains("network")
            || lowered.contains("dns") =>
        {
            ErrorKind::NetworkUnavailable
        }
        _ => ErrorKind::Other,
    };
    let message = match status {
        Some(code) if detail.trim().is_empty() => format!("exited with status {code}"),
        _ => detail.trim().to_string(),
    };
    ExternalError::new(kind, message)
}
