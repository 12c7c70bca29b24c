//! Error types for node lifecycle operations and their HTTP renderings

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure of a reachability probe
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The HTTP probe got no response, or a status other than 200
    #[error("{url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    /// Something already accepts connections on the address
    #[error("{address} is already in use")]
    PortInUse { address: String },
}

/// Errors raised by registry and node operations.
///
/// None of these are fatal: the operation that raised one is aborted
/// without a state change and every other node keeps serving.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} does not exist")]
    NotFound(String),

    /// Duplicate name, host already active elsewhere, or mutation of an active node
    #[error("{0}")]
    Conflict(String),

    /// Malformed or non-local `host:port`
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// A cross-host switch was not confirmed
    #[error("switch from {from} to {to} aborted")]
    Aborted { from: String, to: String },

    #[error("failed to bind {host}: {source}")]
    Bind {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

impl NodeError {
    /// HTTP status used when the error is reported through the admin API
    pub fn status_code(&self) -> StatusCode {
        match self {
            NodeError::NotFound(_) => StatusCode::NOT_FOUND,
            NodeError::Conflict(_) => StatusCode::CONFLICT,
            NodeError::Validation(_) => StatusCode::BAD_REQUEST,
            NodeError::Probe(_) => StatusCode::UNPROCESSABLE_ENTITY,
            NodeError::Aborted { .. } => StatusCode::PRECONDITION_FAILED,
            NodeError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn as_code(&self) -> &'static str {
        match self {
            NodeError::NotFound(_) => "NODE_NOT_FOUND",
            NodeError::Conflict(_) => "CONFLICT",
            NodeError::Validation(_) => "INVALID_HOST",
            NodeError::Probe(ProbeError::Unreachable { .. }) => "PROBE_UNREACHABLE",
            NodeError::Probe(ProbeError::PortInUse { .. }) => "PORT_IN_USE",
            NodeError::Aborted { .. } => "SWITCH_ABORTED",
            NodeError::Bind { .. } => "BIND_FAILED",
        }
    }
}

/// JSON error body returned by the admin API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: status.as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Render a [`NodeError`] as an admin API response
pub fn json_error_response(err: &NodeError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let body = ErrorResponse::new(err.as_code(), status, err.to_string()).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text response carrying only the status' canonical reason, the way
/// a failed forward is reported to the client.
pub fn status_text_response(status: StatusCode) -> Response<Full<Bytes>> {
    let text = format!("{}\n", status.canonical_reason().unwrap_or(""));

    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Full::new(Bytes::from(text)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            NodeError::NotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            NodeError::Conflict("busy".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            NodeError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        let probe = NodeError::from(ProbeError::PortInUse {
            address: "127.0.0.1:1".into(),
        });
        assert_eq!(probe.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(probe.as_code(), "PORT_IN_USE");
    }

    #[test]
    fn test_error_response_json() {
        let err = NodeError::NotFound("blue".into());
        let json = ErrorResponse::new(err.as_code(), err.status_code(), err.to_string()).to_json();

        assert!(json.contains("\"code\":\"NODE_NOT_FOUND\""));
        assert!(json.contains("\"message\":\"node blue does not exist\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(&NodeError::Aborted {
            from: "a".into(),
            to: "b".into(),
        });

        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_status_text_response() {
        let response = status_text_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
