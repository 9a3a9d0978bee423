use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::error::ApiError;
use crate::storage::UserId;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity, taken from the `X-User-Id` header set by the
/// authenticating front proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .map(AuthUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<AuthUser, ApiError> {
        let mut builder = Request::builder().uri("/submissions");
        if let Some(value) = header {
            builder = builder.header("X-User-Id", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_valid_header() {
        let user = tokio_test::assert_ok!(extract(Some("42")).await);
        assert_eq!(user, AuthUser(42));
    }

    #[tokio::test]
    async fn test_missing_or_malformed_header() {
        assert!(matches!(extract(None).await, Err(ApiError::Unauthenticated)));
        assert!(matches!(extract(Some("alice")).await, Err(ApiError::Unauthenticated)));
    }
}
