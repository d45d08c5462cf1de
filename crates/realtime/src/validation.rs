// Input validation helpers.
//
// - `ValidatedJson<T>` extractor: content-type check + serde with
//   structured VALIDATION_FAILED responses.
// - Attachment URL scheme allowlist.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, ErrorCode};

/// URL schemes accepted for message attachments.
const ALLOWED_ATTACHMENT_SCHEMES: &[&str] = &["http", "https"];

/// A JSON body extractor that returns a structured `ApiError` on
/// failure instead of axum's plain-text rejection.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (message, details) = classify_json_rejection(&rejection);
                Err(ApiError::new(ErrorCode::ValidationFailed, message)
                    .with_details(details)
                    .into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => (
            format!("invalid JSON payload: {e}"),
            serde_json::json!({ "kind": "data_error" }),
        ),
        JsonRejection::JsonSyntaxError(e) => (
            format!("malformed JSON: {e}"),
            serde_json::json!({ "kind": "syntax_error" }),
        ),
        JsonRejection::MissingJsonContentType(_) => (
            "expected Content-Type: application/json".to_string(),
            serde_json::json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) => (
            format!("request body error: {e}"),
            serde_json::json!({ "kind": "body_error" }),
        ),
        other => (
            format!("request body error: {other}"),
            serde_json::json!({ "kind": "unknown" }),
        ),
    }
}

/// Attachments must be absolute http(s) URLs; anything else (relative
/// paths, `javascript:`, `data:`) is rejected at the door.
pub fn attachment_url_is_safe(url: &str) -> bool {
    let Some(colon_pos) = url.trim().find(':') else {
        return false;
    };
    let scheme = url.trim()[..colon_pos].to_ascii_lowercase();
    ALLOWED_ATTACHMENT_SCHEMES.contains(&scheme.as_str())
}
