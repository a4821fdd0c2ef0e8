use autodev_utils::response::ApiResponse;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json as ResponseJson,
    routing::post,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{error::ApiError, state::AppState};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct PullRequestWebhook {
    pub repository: String,
    pub number: i64,
    #[serde(default)]
    pub action: Option<String>,
}

/// Provider-signed webhook: validate the HMAC-SHA256 signature over the raw
/// body, then refresh the named PR immediately instead of waiting for the
/// next poll.
pub async fn pull_request_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ResponseJson<ApiResponse<bool>>, ApiError> {
    if let Some(secret) = &state.config.webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing webhook signature".to_string()))?;
        verify_signature(secret, &body, signature)?;
    }

    let payload: PullRequestWebhook = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("malformed webhook payload: {e}")))?;

    tracing::debug!(
        "pull request webhook for {}#{} (action {:?})",
        payload.repository,
        payload.number,
        payload.action
    );

    let known = state
        .pr_monitor
        .refresh(&payload.repository, payload.number)
        .await
        .map_err(ApiError::Database)?;
    Ok(ResponseJson(ApiResponse::success(known)))
}

fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), ApiError> {
    let expected_hex = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| ApiError::Unauthorized("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Unauthorized("bad webhook secret".to_string()))?;
    mac.update(body);
    let expected = hex_decode(expected_hex)
        .ok_or_else(|| ApiError::Unauthorized("malformed webhook signature".to_string()))?;
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::Unauthorized("webhook signature mismatch".to_string()))
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if !input.is_ascii() || input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/pullrequest", post(pull_request_webhook))
}
