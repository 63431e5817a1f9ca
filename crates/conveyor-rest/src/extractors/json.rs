//! JSON body extractor with the API's error envelope.

use crate::responses::AppError;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use conveyor_core::ConveyorError;
use serde::de::DeserializeOwned;

/// Like [`axum::Json`], but a malformed body is rejected with
/// `400 {success:false, error:{code:"VALIDATION_ERROR", ..}}` instead of
/// axum's plain-text rejection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<T> std::ops::Deref for ApiJson<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(rejection_to_error)?;
        Ok(ApiJson(value))
    }
}

fn rejection_to_error(rejection: JsonRejection) -> AppError {
    AppError(ConveyorError::validation(format!(
        "Invalid JSON body: {}",
        rejection.body_text()
    )))
}
