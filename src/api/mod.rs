//! HTTP surface for the asynchronous human decisions and job lifecycle.

mod routes;

pub use routes::{ApiState, engine_routes};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::error::{DatabaseError, Error, ValidationError};

/// Engine error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, body) = match &self.0 {
            Error::Validation(ValidationError::MissingRequirements(missing)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": message, "missing": missing }),
            ),
            Error::Validation(ValidationError::NotPermitted(_)) => {
                (StatusCode::FORBIDDEN, json!({ "error": message }))
            }
            Error::Validation(ValidationError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, json!({ "error": message }))
            }
            Error::Validation(ValidationError::InvalidInput { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": message }))
            }
            Error::Database(DatabaseError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, json!({ "error": message }))
            }
            _ => {
                error!(error = %message, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn status(e: Error) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(
            status(DatabaseError::not_found("job", Uuid::nil()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ValidationError::NotPermitted("no".into()).into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(ValidationError::MissingRequirements(Vec::new()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(DatabaseError::Query("boom".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
