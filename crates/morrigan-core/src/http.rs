use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::Error;

/// Maps a tagged [`Error`] to the status codes in spec §6. Every HTTP
/// handler boundary funnels its errors through this, so a raw panic or an
/// un-mapped error type never reaches a client.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Request(_) => StatusCode::BAD_REQUEST,
            Error::AuthenticationFailed(_) => StatusCode::FORBIDDEN,
            Error::Failed(_) => StatusCode::FORBIDDEN,
            Error::ServerConfiguration(_)
            | Error::ServerAuthCommitFailed(_)
            | Error::ServerMissingAuthRecord(_)
            | Error::NoRecord(_)
            | Error::InvalidRecord(_)
            | Error::InvalidToken(_)
            | Error::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `204` for a well-formed request whose lookup found nothing to act on.
pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// `404` for "no such resource" — a path-addressed resource that does not
/// exist. Distinct from [`ApiError`]'s generic kind mapping since the
/// request shape itself was fine; only a handler that already did the
/// lookup knows this case applies.
pub fn not_found(message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: "requestError",
        message: message.into(),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_error_maps_to_400() {
        let err = ApiError(Error::request("bad input"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn authentication_failed_maps_to_403() {
        let err = ApiError(Error::authentication_failed("nope"));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn server_error_maps_to_500() {
        let err = ApiError(Error::server_error("boom"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
