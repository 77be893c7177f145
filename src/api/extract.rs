//! Request extractors
//!
//! Wrap axum's `Json`, `Query` and `Path` so malformed input is rejected
//! as an [`AuditError::Validation`] and rendered with the same JSON error
//! body as every other failure.

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request,
    },
    http::request::Parts,
    Json,
};

use crate::error::AuditError;

impl From<JsonRejection> for AuditError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(format!("request body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for AuditError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(format!("query string: {}", rejection.body_text()))
    }
}

impl From<PathRejection> for AuditError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(format!("path: {}", rejection.body_text()))
    }
}

/// JSON body extractor
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AuditError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string extractor
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AuditError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// Path parameter extractor
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = AuditError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}
