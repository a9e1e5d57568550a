use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::services::capability::{guarded_call, CapabilityError};
use crate::services::health_registry::{Dependency, DependencyHealthRegistry};

pub const DEFAULT_EXTRACTION_PROMPT: &str = concat!(
    "You are a professional design extraction tool. Extract and enlarge the printed design ",
    "from this garment photo. Output only the artwork, never the fabric or garment, tightly ",
    "cropped to fill the frame at a minimum of 3000x3000 pixels. Preserve every layer, stroke, ",
    "outline, shadow and accent color exactly. Place light designs on a solid black background ",
    "and dark designs on a solid white background; for multicolor designs choose the background ",
    "with maximum contrast. The background must be perfectly uniform."
);

/// Raw generative-image capability: recreate the artwork found in `image`.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn recreate(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<Vec<u8>, CapabilityError>;
}

/// Client for the Gemini `generateContent` REST endpoint.
pub struct GeminiImageGenerator {
    http: Client,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GeminiImageGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    async fn recreate(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<Vec<u8>, CapabilityError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let request_body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    {
                        "inline_data": {
                            "mime_type": mime_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(image),
                        }
                    }
                ]
            }]
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_gemini_failure(status, &body));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        extract_image(parsed)
    }
}

fn extract_image(response: GenerateContentResponse) -> Result<Vec<u8>, CapabilityError> {
    let inline = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .into_iter()
        .flat_map(|c| c.parts)
        .filter_map(|p| p.inline_data)
        .find(|d| d.mime_type.starts_with("image/"))
        .ok_or_else(|| CapabilityError::Failed("No image generated by Gemini".to_string()))?;

    base64::engine::general_purpose::STANDARD
        .decode(inline.data)
        .map_err(|e| CapabilityError::Failed(format!("Gemini returned undecodable image data: {e}")))
}

/// Map a non-success Gemini response onto the caller-facing categories.
pub fn classify_gemini_failure(status: StatusCode, body: &str) -> CapabilityError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CapabilityError::AuthInvalid("Gemini API key invalid - do not retry".to_string())
        }
        StatusCode::TOO_MANY_REQUESTS if body.to_ascii_lowercase().contains("quota") => {
            CapabilityError::QuotaExhausted("Gemini API quota exhausted - do not retry".to_string())
        }
        _ => CapabilityError::Failed(format!("Gemini API error ({}): {}", status.as_u16(), error_summary(body))),
    }
}

fn error_summary(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// S1 client: the generative capability behind its breaker and sticky flag.
pub struct GenerativeImageClient {
    generator: Arc<dyn ImageGenerator>,
    registry: Arc<DependencyHealthRegistry>,
    timeout: Duration,
    prompt: String,
}

impl GenerativeImageClient {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        registry: Arc<DependencyHealthRegistry>,
        timeout: Duration,
        prompt: Option<String>,
    ) -> Self {
        Self {
            generator,
            registry,
            timeout,
            prompt: prompt.unwrap_or_else(|| DEFAULT_EXTRACTION_PROMPT.to_string()),
        }
    }

    pub async fn recreate(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        let mime_type = image::guess_format(image)
            .map(|f| f.to_mime_type())
            .unwrap_or("image/jpeg");

        guarded_call(&self.registry, Dependency::GenerativeImage, self.timeout, || {
            self.generator.recreate(image, mime_type, &self.prompt)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_is_not_retryable() {
        let err = classify_gemini_failure(StatusCode::FORBIDDEN, "");
        assert!(matches!(err, CapabilityError::AuthInvalid(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_quota_429_is_exhaustion_but_plain_rate_limit_is_generic() {
        let quota = classify_gemini_failure(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"You exceeded your current quota","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(matches!(quota, CapabilityError::QuotaExhausted(_)));

        let limited = classify_gemini_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(limited, CapabilityError::Failed(_)));
    }

    #[test]
    fn test_generic_failure_carries_api_message() {
        let err = classify_gemini_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":{"message":"backend overloaded"}}"#,
        );
        assert_eq!(err.to_string(), "Gemini API error (500): backend overloaded");
    }

    #[test]
    fn test_extract_image_takes_first_inline_image() {
        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "here you go" },
                    { "inlineData": { "mimeType": "image/png", "data": data } }
                ]}
            }]
        }))
        .unwrap();
        assert_eq!(extract_image(response).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_text_only_response_is_a_failure() {
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "I cannot do that" }] } }]
        }))
        .unwrap();
        assert!(matches!(extract_image(response), Err(CapabilityError::Failed(_))));
    }
}
