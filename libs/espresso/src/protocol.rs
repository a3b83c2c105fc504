//! Wire envelope for error replies of the message transport.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchError;

pub const CODE_OK: i32 = 0;
pub const CODE_INTERNAL_ERROR: i32 = 10001;
pub const CODE_INVALID_REQUEST: i32 = 10002;
pub const CODE_INVALID_JSON_PARAM: i32 = 10003;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseResponse {
    pub code: i32,
    pub msg: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

impl BaseResponse {
    pub fn new(code: i32, msg: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            request_id: request_id.into(),
        }
    }

    pub fn invalid_json(request_id: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_JSON_PARAM, "invalid json param", request_id)
    }

    pub fn internal_error(request_id: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL_ERROR, "internal error", request_id)
    }
}

/// HTTP status and body for a failed dispatch.
///
/// Decoding and handler errors answer 200 with a non-zero code; only an
/// unknown route (404) and a panic (500) change the status.
pub fn from_dispatch_error(err: &DispatchError, request_id: &str) -> (StatusCode, BaseResponse) {
    match err {
        DispatchError::NotFound(route) => (
            StatusCode::NOT_FOUND,
            BaseResponse::new(
                CODE_INVALID_REQUEST,
                format!("route {route} not found"),
                request_id,
            ),
        ),
        DispatchError::InvalidJson(_) => (StatusCode::OK, BaseResponse::invalid_json(request_id)),
        DispatchError::InvalidRequest(msg) => (
            StatusCode::OK,
            BaseResponse::new(CODE_INVALID_REQUEST, msg.clone(), request_id),
        ),
        DispatchError::Handler(e) => (
            StatusCode::OK,
            BaseResponse::new(CODE_INVALID_REQUEST, e.to_string(), request_id),
        ),
        DispatchError::Panicked(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            BaseResponse::internal_error(request_id),
        ),
    }
}
