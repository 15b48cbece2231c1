//! Blocking HTTP adapter for a Gemini-style `generateContent` image endpoint.
//! Owns nothing but the wire format: part encoding, status mapping and the
//! safety-refusal detection. Backoff lives in the module above so every
//! backend gets it for free.

use base64::Engine as _;

use crate::prompt::Part;

use super::{GeneratedImage, GenerateRequest, Generator, GeneratorError};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const ADAPTER_VERSION: &str = "gemini-rest/2";

pub struct GeminiGenerator {
    client: reqwest::blocking::Client,
    api_key: String,
    model_id: String,
    base_url: String,
}

impl GeminiGenerator {
    /// Build from environment: `GEMINI_API_KEY` (or `SPRITE_PIPELINE_API_KEY`)
    /// and an optional `SPRITE_PIPELINE_API_BASE` override for test servers.
    pub fn from_env(model_id: &str) -> Result<GeminiGenerator, GeneratorError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("SPRITE_PIPELINE_API_KEY"))
            .map_err(|_| {
                GeneratorError::InvalidRequest(
                    "GEMINI_API_KEY is not set (a .env file is honored)".to_string(),
                )
            })?;
        let base_url = std::env::var("SPRITE_PIPELINE_API_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;
        Ok(GeminiGenerator {
            client,
            api_key,
            model_id: model_id.to_string(),
            base_url,
        })
    }

    fn request_body(&self, req: &GenerateRequest) -> serde_json::Value {
        let parts: Vec<serde_json::Value> = req
            .parts
            .iter()
            .map(|p| match p {
                Part::Text(t) => serde_json::json!({ "text": t }),
                Part::InlineImage { mime, bytes } => serde_json::json!({
                    "inline_data": {
                        "mime_type": mime,
                        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                    }
                }),
            })
            .collect();
        let mut generation_config = serde_json::json!({
            "seed": req.seed,
            "responseModalities": ["IMAGE"],
        });
        if let Some(t) = req.temperature {
            generation_config["temperature"] = serde_json::json!(t);
        }
        serde_json::json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        })
    }

    fn parse_response(&self, body: &serde_json::Value) -> Result<GeneratedImage, GeneratorError> {
        if let Some(reason) = body
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Err(GeneratorError::SafetyRefused(reason.to_string()));
        }
        let candidate = body
            .pointer("/candidates/0")
            .ok_or_else(|| GeneratorError::Transport("response carried no candidates".into()))?;
        if let Some(finish) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            if finish.eq_ignore_ascii_case("safety") {
                return Err(GeneratorError::SafetyRefused(finish.to_string()));
            }
        }
        let parts = candidate
            .pointer("/content/parts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GeneratorError::Transport("response carried no parts".into()))?;

        let mut reasoning_token: Option<String> = None;
        for p in parts {
            if let Some(text) = p.get("text").and_then(|v| v.as_str()) {
                reasoning_token = Some(text.to_string());
            }
            let inline = p.get("inline_data").or_else(|| p.get("inlineData"));
            if let Some(inline) = inline {
                let mime = inline
                    .get("mime_type")
                    .or_else(|| inline.get("mimeType"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("image/png")
                    .to_string();
                let data = inline
                    .get("data")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GeneratorError::Transport("inline data missing".into()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| GeneratorError::Transport(format!("base64: {e}")))?;
                return Ok(GeneratedImage {
                    image_bytes: bytes,
                    mime,
                    model_id: self.model_id.clone(),
                    reasoning_token,
                });
            }
        }
        Err(GeneratorError::Transport(
            "response carried no inline image".to_string(),
        ))
    }
}

impl Generator for GeminiGenerator {
    fn generate(&mut self, req: &GenerateRequest) -> Result<GeneratedImage, GeneratorError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model_id
        );
        let body = self.request_body(req);
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;
        if !status.is_success() {
            let msg = format!("HTTP {status}: {}", truncate(&text, 300));
            return Err(match status.as_u16() {
                429 => GeneratorError::RateLimited(msg),
                502 | 503 | 504 => GeneratorError::Overloaded(msg),
                400 | 404 | 422 => GeneratorError::InvalidRequest(msg),
                _ => GeneratorError::Transport(msg),
            });
        }
        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| GeneratorError::Transport(format!("invalid response JSON: {e}")))?;
        let image = self.parse_response(&json)?;
        if let Some(token) = &image.reasoning_token {
            // Logged for audit; never fed back into a prompt.
            tracing::debug!(target: "generator", token = %truncate(token, 200), "reasoning token");
        }
        Ok(image)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn adapter_version(&self) -> &str {
        ADAPTER_VERSION
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
