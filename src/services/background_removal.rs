use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::services::capability::{guarded_call, CapabilityError};
use crate::services::health_registry::{Dependency, DependencyHealthRegistry};

const REMOVE_BG_URL: &str = "https://api.remove.bg/v1.0/removebg";

/// Raw background-removal capability.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError>;
}

fn image_part(image: &[u8]) -> Result<Part, CapabilityError> {
    Ok(Part::bytes(image.to_vec())
        .file_name("artwork.png")
        .mime_str("image/png")?)
}

/// Self-hosted rembg service (`POST {endpoint}/remove`).
pub struct RembgRemover {
    http: Client,
    endpoint: String,
}

impl RembgRemover {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BackgroundRemover for RembgRemover {
    async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        let form = Form::new().part("image_file", image_part(image)?);
        let response = self
            .http
            .post(format!("{}/remove", self.endpoint))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rembg_failure(status, &body));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

pub fn classify_rembg_failure(status: StatusCode, body: &str) -> CapabilityError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CapabilityError::AuthInvalid("rembg service rejected credentials - do not retry".to_string())
        }
        _ => CapabilityError::Failed(format!(
            "Self-hosted background removal failed ({}): {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )),
    }
}

/// Remove.bg hosted API.
pub struct RemoveBgRemover {
    http: Client,
    api_key: String,
}

impl RemoveBgRemover {
    pub fn new(api_key: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl BackgroundRemover for RemoveBgRemover {
    async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        let form = Form::new()
            .part("image_file", image_part(image)?)
            .text("size", "full")
            .text("format", "png");

        let response = self
            .http
            .post(REMOVE_BG_URL)
            .header("X-Api-Key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_remove_bg_failure(status, &body));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// 403 means a bad key and 402 means the account is out of credits.
pub fn classify_remove_bg_failure(status: StatusCode, body: &str) -> CapabilityError {
    match status {
        StatusCode::FORBIDDEN => {
            CapabilityError::AuthInvalid("Remove.bg API key invalid - do not retry".to_string())
        }
        StatusCode::PAYMENT_REQUIRED => CapabilityError::QuotaExhausted(
            "Remove.bg API credits exhausted - do not retry".to_string(),
        ),
        _ => {
            let title = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["errors"][0]["title"].as_str().map(str::to_string))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            CapabilityError::Failed(format!("Remove.bg API error ({}): {}", status.as_u16(), title))
        }
    }
}

/// Self-hosted removal first, then the hosted API when the self-hosted
/// service fails for a reason another provider could get past.
pub struct FallbackRemover {
    primary: Arc<dyn BackgroundRemover>,
    fallback: Arc<dyn BackgroundRemover>,
}

impl FallbackRemover {
    pub fn new(primary: Arc<dyn BackgroundRemover>, fallback: Arc<dyn BackgroundRemover>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl BackgroundRemover for FallbackRemover {
    async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        match self.primary.remove_background(image).await {
            Ok(cutout) => Ok(cutout),
            Err(e) if !e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Self-hosted background removal failed, falling back to Remove.bg");
                self.fallback.remove_background(image).await
            }
        }
    }
}

/// S2 client: background removal behind its breaker and sticky flag.
pub struct BackgroundRemovalClient {
    remover: Arc<dyn BackgroundRemover>,
    registry: Arc<DependencyHealthRegistry>,
    timeout: Duration,
}

impl BackgroundRemovalClient {
    pub fn new(
        remover: Arc<dyn BackgroundRemover>,
        registry: Arc<DependencyHealthRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            remover,
            registry,
            timeout,
        }
    }

    pub async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        guarded_call(&self.registry, Dependency::BackgroundRemoval, self.timeout, || {
            self.remover.remove_background(image)
        })
        .await
    }
}
