//! `X-Wallet-Address` extractor (§4.8, §6) — required on every mutating
//! endpoint. Any non-empty value is accepted; authorization itself is
//! delegated to the supervisor that owns this instance.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct WalletHeader(pub String);

pub struct MissingWallet;

impl IntoResponse for MissingWallet {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing X-Wallet-Address header" })),
        )
            .into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for WalletHeader
where
    S: Send + Sync,
{
    type Rejection = MissingWallet;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("X-Wallet-Address")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| WalletHeader(s.to_string()))
            .ok_or(MissingWallet)
    }
}
