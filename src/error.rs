use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the runtime core.
///
/// Validation and locking failures are returned synchronously to the caller
/// of a mutation; failures inside the background loops (probes, fetches,
/// process races) are logged and swallowed there and never reach this enum.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown service: {0}")]
    NotFound(String),

    /// Mutation refused while the multiplexer is ON AIR.
    #[error("cannot {0} while ON AIR")]
    OnAirLocked(&'static str),

    #[error("bitrate not allowed: {0}")]
    InvalidBitrate(u32),

    #[error("service id already exists: {0}")]
    DuplicateId(String),

    #[error("capacity exceeded: {total_cu} CU (max {max_cu}). Reduce bitrates/protection or disable services.")]
    CapacityExceeded { total_cu: u32, max_cu: u32 },

    #[error("process already running: {0}")]
    AlreadyRunning(String),

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    fn status(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::OnAirLocked(_)
            | EngineError::DuplicateId(_)
            | EngineError::CapacityExceeded { .. }
            | EngineError::AlreadyRunning(_) => StatusCode::CONFLICT,
            EngineError::InvalidBitrate(_) | EngineError::InvalidField(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::Io(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("api error: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            EngineError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::OnAirLocked("add service").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::InvalidBitrate(97).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::CapacityExceeded { total_cu: 900, max_cu: 864 }.status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn messages_are_operator_friendly() {
        let e = EngineError::CapacityExceeded { total_cu: 900, max_cu: 864 };
        assert!(e.to_string().contains("900 CU"));
        assert!(e.to_string().contains("864"));
    }
}
