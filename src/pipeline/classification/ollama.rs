use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::gateway::{GatewayError, GenerationRequest, ModelGateway, ModelInfo};

/// How long a `/api/tags` listing is served from memory.
const MODEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Ollama HTTP gateway for local LLM inference.
pub struct OllamaGateway {
    base_url: String,
    client: reqwest::Client,
    liveness_timeout: Duration,
    model_cache: Mutex<Option<(Instant, Vec<ModelInfo>)>>,
}

impl OllamaGateway {
    /// Create a gateway pointing at an Ollama instance.
    ///
    /// No client-wide request timeout is set; each generation call carries its own.
    pub fn new(base_url: &str, liveness_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            liveness_timeout,
            model_cache: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(timeout)
        } else if e.is_connect() {
            GatewayError::Unavailable(self.base_url.clone())
        } else {
            GatewayError::MalformedResponse(e.to_string())
        }
    }

    fn cached_models(&self) -> Option<Vec<ModelInfo>> {
        let cache = self.model_cache.lock().ok()?;
        match cache.as_ref() {
            Some((at, models)) if at.elapsed() < MODEL_CACHE_TTL => Some(models.clone()),
            _ => None,
        }
    }

    fn store_models(&self, models: &[ModelInfo]) {
        if let Ok(mut cache) = self.model_cache.lock() {
            *cache = Some((Instant::now(), models.to_vec()));
        }
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GatewayError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e, request.timeout))?;

        Ok(parsed.response)
    }

    async fn is_alive(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(self.liveness_timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, url = %url, "Ollama liveness probe failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        if let Some(models) = self.cached_models() {
            return Ok(models);
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.liveness_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.liveness_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let mut models = parsed.models;
        models.sort_by_key(|m| m.size);
        self.store_models(&models);
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_trims_trailing_slash() {
        let gw = OllamaGateway::new("http://localhost:11434/", Duration::from_secs(5)).unwrap();
        assert_eq!(gw.base_url(), "http://localhost:11434");
    }

    #[test]
    fn generate_request_shape() {
        let body = OllamaGenerateRequest {
            model: "gemma3:4b",
            prompt: "p",
            stream: false,
            format: "json",
            options: OllamaOptions { temperature: 0.7, top_p: 0.9, num_predict: None },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"], "json");
        assert!(json["options"].get("num_predict").is_none());
    }

    #[test]
    fn tags_response_tolerates_missing_fields() {
        let parsed: OllamaTagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"phi4-mini:3.8b"}]}"#).unwrap();
        assert_eq!(parsed.models[0].name, "phi4-mini:3.8b");
        assert_eq!(parsed.models[0].size, 0);
    }

    #[test]
    fn model_cache_expires() {
        let gw = OllamaGateway::new("http://localhost:11434", Duration::from_secs(5)).unwrap();
        assert!(gw.cached_models().is_none());

        let models = vec![ModelInfo {
            name: "gemma3:4b".into(),
            size: 1,
            digest: String::new(),
            modified_at: String::new(),
        }];
        gw.store_models(&models);
        assert_eq!(gw.cached_models().unwrap(), models);

        if let Some(past) = Instant::now().checked_sub(MODEL_CACHE_TTL + Duration::from_secs(1)) {
            *gw.model_cache.lock().unwrap() = Some((past, models));
            assert!(gw.cached_models().is_none());
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_not_alive() {
        // Port 9 (discard) is closed on test hosts.
        let gw = OllamaGateway::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(!gw.is_alive().await);
        let err = gw.list_models().await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_) | GatewayError::Timeout(_)));
    }
}
