/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use derive_more::{Display, Error};

/// Closed set of error kinds the orchestrator distinguishes between, per the
/// policy table in §7: some are repaired locally, some retried, some fail the
/// job, none ever abort the tick.
#[derive(Debug, Display, Error)]
pub enum ControlError {
    #[display("timed out after {0:?}")]
    Timeout(#[error(not(source))] std::time::Duration),

    #[display("upstream unavailable: {msg}")]
    UpstreamUnavailable { msg: String },

    #[display("bad input for '{field}': {msg}")]
    BadInput { field: String, msg: String },

    #[display("unknown equipment kind: {kind}")]
    UnknownEquipmentKind { kind: String },

    #[display("algorithm fault: {msg}")]
    AlgorithmFault { msg: String },

    #[display("state conflict on group {group_id}")]
    StateConflict { group_id: String },

    #[display("not found: {msg}")]
    NotFound { msg: String },

    #[display("invalid request: {msg}")]
    UserError { msg: String },

    #[display("internal error: {msg}")]
    InternalError { msg: String },
}

impl ControlError {
    /// Whether this error class should be retried by the gateway's backoff
    /// loop (§4.1, §7). 4xx-shaped errors surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout(_) | ControlError::UpstreamUnavailable { .. }
        )
    }
}

impl axum::response::IntoResponse for ControlError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::response::IntoResponse;

        let status = match &self {
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::UserError { .. }
            | ControlError::BadInput { .. }
            | ControlError::UnknownEquipmentKind { .. } => StatusCode::BAD_REQUEST,
            ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControlError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ControlError::StateConflict { .. } => StatusCode::CONFLICT,
            ControlError::AlgorithmFault { .. } | ControlError::InternalError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
