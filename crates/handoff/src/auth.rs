use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};

use crate::app::AppState;
use handoff_models::{Identity, UserRole};

pub const ORG_HEADER: &str = "x-organization-id";
pub const USER_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn unauthorized(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": msg })),
    )
}

// Axum extractor for Identity. The upstream gateway authenticates the caller
// and forwards who they are; requests without an organization are rejected.
// A request with an organization but no user acts as the system.
#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(organization_id) = header(parts, ORG_HEADER).map(|s| s.to_string()) else {
            return Err(unauthorized("missing x-organization-id header"));
        };

        let Some(user_id) = header(parts, USER_HEADER).map(|s| s.to_string()) else {
            return Ok(Identity::System { organization_id });
        };

        let role = match header(parts, ROLE_HEADER) {
            Some(r) => UserRole::from_str(r).ok_or_else(|| unauthorized("unknown x-user-role"))?,
            None => UserRole::Agent,
        };

        Ok(Identity::User {
            id: user_id,
            organization_id,
            role,
        })
    }
}
