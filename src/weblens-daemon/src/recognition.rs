use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use weblens_service::media::Recognizer;
use weblens_service::{ServiceError, ServiceResult};

const RECOGNITION_PROMPT: &str =
    "List up to ten single-word tags describing this image, comma separated.";
const RECOGNITION_MODEL: &str = "llava";

/// Image tagger backed by an ollama instance. Enabled only when
/// `OLLAMA_HOST` is set; the media service serializes calls and applies the
/// timeout.
pub struct OllamaRecognizer {
    host: String,
    http: reqwest::Client,
}

impl OllamaRecognizer {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Recognizer for OllamaRecognizer {
    async fn tag_image(&self, thumb: &[u8]) -> ServiceResult<Vec<String>> {
        let body = json!({
            "model": RECOGNITION_MODEL,
            "prompt": RECOGNITION_PROMPT,
            "images": [STANDARD.encode(thumb)],
            "stream": false,
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("recognition rpc: {}", e)))?;
        if !response.status().is_success() {
            return Err(ServiceError::RemoteError(format!(
                "recognition rpc returned {}",
                response.status()
            )));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("decode recognition: {}", e)))?;
        let text = parsed
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let tags = text
            .split(',')
            .map(|t| t.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|t| !t.is_empty() && t.len() < 32)
            .take(10)
            .collect();
        Ok(tags)
    }
}
