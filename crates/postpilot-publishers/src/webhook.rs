//! HTTP relay adapter. POSTs the publish envelope to a per-platform endpoint.
//!
//! The endpoint owns the platform's wire protocol; this adapter only signs
//! or authorises the request and translates the HTTP outcome into a
//! [`PublishReceipt`] or a [`PublishError`].

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use postpilot_core::config::{WebhookAuthMode, WebhookPublisherConfig};
use postpilot_core::Platform;

use crate::{
    credentials::CredentialSource,
    error::PublishError,
    publisher::{PublishReceipt, PublishRequest, Publisher},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-postpilot-signature";

pub struct WebhookPublisher {
    client: reqwest::Client,
    platform: Platform,
    url: String,
    auth_mode: WebhookAuthMode,
    signing_secret: Option<String>,
    credentials: Arc<dyn CredentialSource>,
}

impl WebhookPublisher {
    pub fn new(
        platform: Platform,
        url: impl Into<String>,
        auth_mode: WebhookAuthMode,
        signing_secret: Option<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, PublishError> {
        if auth_mode == WebhookAuthMode::HmacSha256 && signing_secret.is_none() {
            return Err(PublishError::Config(format!(
                "webhook for '{platform}' uses hmac-sha256 but has no signing_secret"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            platform,
            url: url.into(),
            auth_mode,
            signing_secret,
            credentials,
        })
    }

    /// Build an adapter from a `[[publishers.webhooks]]` entry.
    pub fn from_config(
        cfg: &WebhookPublisherConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, PublishError> {
        let platform =
            Platform::new(&cfg.platform).map_err(|e| PublishError::Config(e.to_string()))?;
        Self::new(
            platform,
            cfg.url.clone(),
            cfg.auth_mode.clone(),
            cfg.signing_secret.clone(),
            credentials,
        )
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        // Serialise once so the signature covers exactly the bytes sent.
        let body = serde_json::to_vec(req).map_err(|e| PublishError::Parse(e.to_string()))?;

        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");

        match self.auth_mode {
            WebhookAuthMode::BearerToken => {
                let token = self.credentials.credential(&self.platform)?;
                builder = builder.bearer_auth(token);
            }
            WebhookAuthMode::HmacSha256 => {
                let secret = self.signing_secret.as_deref().unwrap_or_default();
                builder = builder.header(SIGNATURE_HEADER, sign(secret, &body)?);
            }
            WebhookAuthMode::None => {}
        }

        debug!(platform = %self.platform, post_id = %req.post_id, url = %self.url, "relaying publish request");

        let resp = builder.body(body).send().await?;
        let status = resp.status().as_u16();

        match status {
            200..=299 => resp
                .json::<PublishReceipt>()
                .await
                .map_err(|e| PublishError::Parse(e.to_string())),
            401 | 403 => Err(PublishError::Auth(resp.text().await.unwrap_or_default())),
            422 => Err(PublishError::Rejected(resp.text().await.unwrap_or_default())),
            429 => {
                let retry_after_secs = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Err(PublishError::RateLimited { retry_after_secs })
            }
            _ => {
                let text = resp.text().await.unwrap_or_default();
                warn!(platform = %self.platform, status, body = %text, "relay returned an error");
                Err(PublishError::Api {
                    status,
                    message: text,
                })
            }
        }
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, PublishError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PublishError::Config("invalid HMAC key length".to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
