use axum::http::header::{CONNECTION, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use billing_api::ApiError;
use billing_core::{ClientSide, ConflictDetails, ServerSide, ValidationErrors};
use serde::Serialize;

use crate::SERVICE_CONTRACT_VERSION;

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<ValidationErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ConflictDetails>,
}

/// Error response body. `server` and `client` are only present on 409.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    #[serde(skip)]
    bearer_challenge: bool,
    #[serde(skip)]
    retry_after: bool,
    #[serde(skip)]
    close_connection: bool,
    service_contract_version: &'static str,
    error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<ServerSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<ClientSide>,
}

fn status_and_message(err: &ApiError) -> (StatusCode, &'static str) {
    match err {
        ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "request failed validation"),
        ApiError::NotFound { .. } => {
            (StatusCode::NOT_FOUND, "the requested resource could not be found")
        }
        ApiError::Conflict(_) => (
            StatusCode::CONFLICT,
            "Record was modified by another user. Please review changes and retry.",
        ),
        ApiError::InvalidCredentials => {
            (StatusCode::UNAUTHORIZED, "invalid authentication credentials")
        }
        ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid or missing authentication token"),
        ApiError::Forbidden(_) => (
            StatusCode::FORBIDDEN,
            "your operator account doesn't have the necessary permissions to access this resource",
        ),
        ApiError::Transient(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "the server is temporarily unable to process the request, retry later",
        ),
        ApiError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "the server encountered a problem and could not process your request",
        ),
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            bearer_challenge: false,
            retry_after: false,
            close_connection: false,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ErrorBody { code, message: message.into(), fields: None, details: None },
            server: None,
            client: None,
        }
    }

    /// Status, code and message of `err`, without its payload.
    fn describe(err: &ApiError) -> Self {
        let (status, message) = status_and_message(err);
        Self {
            bearer_challenge: matches!(err, ApiError::Unauthorized),
            retry_after: err.is_retryable(),
            ..Self::new(status, err.code(), message)
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub(crate) fn not_found() -> Self {
        Self::describe(&ApiError::NotFound { entity: "resource" })
    }

    pub(crate) fn authentication_required() -> Self {
        Self {
            bearer_challenge: true,
            ..Self::new(
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "you must be authenticated to access this resource",
            )
        }
    }

    pub(crate) fn invalid_token() -> Self {
        Self::describe(&ApiError::Unauthorized)
    }

    pub(crate) fn internal() -> Self {
        Self::describe(&ApiError::Internal(anyhow::anyhow!("request could not be completed")))
    }

    /// Response for a recovered handler panic; the connection is not reused.
    pub(crate) fn panicked() -> Self {
        Self { close_connection: true, ..Self::internal() }
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let mut error = Self::describe(&err);
        match err {
            ApiError::Validation(fields) => error.error.fields = Some(fields),
            ApiError::Conflict(report) => {
                let report = *report;
                error.error.details = Some(report.details);
                error.server = Some(report.server);
                error.client = Some(report.client);
            }
            ApiError::Transient(detail) => {
                tracing::warn!(error = %detail, "request failed on a transient store error");
            }
            ApiError::Internal(err) => {
                tracing::error!(error = format!("{err:#}"), "request failed on an internal error");
            }
            ApiError::NotFound { .. }
            | ApiError::InvalidCredentials
            | ApiError::Unauthorized
            | ApiError::Forbidden(_) => {}
        }
        error
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        let bearer_challenge = self.bearer_challenge;
        let retry_after = self.retry_after;
        let close_connection = self.close_connection;
        let mut response = (status, Json(self)).into_response();

        let headers = response.headers_mut();
        if bearer_challenge {
            headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        if close_connection {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_statuses_and_codes() {
        let cases = [
            (ApiError::NotFound { entity: "tariff_link" }, StatusCode::NOT_FOUND, "not_found"),
            (ApiError::InvalidCredentials, StatusCode::UNAUTHORIZED, "invalid_credentials"),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED, "invalid_token"),
            (
                ApiError::Forbidden(billing_core::Capability::TariffsUpdate),
                StatusCode::FORBIDDEN,
                "not_permitted",
            ),
            (
                ApiError::Transient("database is locked".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
            ),
            (
                ApiError::Internal(anyhow::anyhow!("disk on fire")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];

        for (api_error, status, code) in cases {
            let api_code = api_error.code();
            let retryable = api_error.is_retryable();
            let error = ServiceError::from(api_error);
            assert_eq!(error.status(), status);
            assert_eq!(error.error.code, code);
            assert_eq!(error.error.code, api_code);
            assert_eq!(error.retry_after, retryable);
            assert!(error.server.is_none());
        }
    }

    #[test]
    fn only_token_failures_carry_a_bearer_challenge() {
        let challenged = [
            ServiceError::authentication_required(),
            ServiceError::invalid_token(),
            ServiceError::from(ApiError::Unauthorized),
        ];
        for error in challenged {
            let response = error.into_response();
            assert_eq!(
                response.headers().get(WWW_AUTHENTICATE).and_then(|value| value.to_str().ok()),
                Some("Bearer")
            );
        }

        let response = ServiceError::from(ApiError::InvalidCredentials).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn internal_details_stay_out_of_the_body() {
        let error = ServiceError::from(ApiError::Internal(anyhow::anyhow!("secret path /var/db")));
        let body = match serde_json::to_string(&error) {
            Ok(body) => body,
            Err(err) => panic!("failed to serialize error: {err}"),
        };
        assert!(!body.contains("/var/db"));
    }

    #[test]
    fn validation_error_carries_field_messages() {
        let mut fields = ValidationErrors::new();
        fields.check(false, "tariff_id", "must be a positive integer");
        let error = ServiceError::from(ApiError::Validation(fields));

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error.message, "request failed validation");
        assert_eq!(
            error.error.fields.as_ref().and_then(|fields| fields.get("tariff_id")),
            Some("must be a positive integer")
        );
    }
}
