use crate::{
    auth::jwt::{SessionTokenVerifier, VerifiedIdentity},
    error::{ApiError, ErrorCode},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Verified caller identity attached to authenticated requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub display_name: String,
}

impl From<VerifiedIdentity> for AuthenticatedUser {
    fn from(identity: VerifiedIdentity) -> Self {
        Self { user_id: identity.user_id, display_name: identity.display_name }
    }
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<SessionTokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let identity = match verifier.verify(token) {
        Ok(identity) => identity,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser::from(identity));

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    ApiError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
