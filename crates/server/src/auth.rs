use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    Json,
};
use tracing::warn;
use uuid::Uuid;

use crate::renewal::{ApiError, ApiState, ErrorBody};

/// The employee a request acts for, resolved from `Authorization: Bearer <token>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaffIdentity {
    pub staff_id: String,
}

impl StaffIdentity {
    pub fn new(staff_id: impl Into<String>) -> Self {
        Self { staff_id: staff_id.into() }
    }
}

impl FromRequestParts<ApiState> for StaffIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token);

        let Some(token) = presented else {
            return Err(unauthorized("missing bearer token"));
        };
        state
            .auth
            .staff_for_token(token)
            .map(StaffIdentity::new)
            .ok_or_else(|| unauthorized("unrecognised bearer token"))
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn unauthorized(reason: &str) -> ApiError {
    let correlation_id = Uuid::new_v4().to_string();
    warn!(
        event_name = "api.auth.rejected",
        correlation_id = %correlation_id,
        reason,
        "request rejected before reaching a workflow handler"
    );
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            success: false,
            error: "unauthorized",
            message: "請先登入".to_string(),
            correlation_id,
        }),
    )
}
