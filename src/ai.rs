use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MODEL: &str = "gemini-2.5-flash";

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// Seam between the orchestrator and the language-model integration, so the
/// reply state machine is testable without network access.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Opens a streaming generation call; each item is one text fragment.
    async fn stream_reply(
        &self,
        system_instruction: &str,
        content: &str,
    ) -> Result<ReplyStream, String>;

    /// Single-request audio transcription.
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, String>;
}

/// Explicit per-key Gemini handle. Rebuilt whenever the stored API key
/// changes; there is deliberately no process-wide client.
pub struct GeminiClient {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiClient {
    /// Returns `None` for an empty key so callers carry an explicit
    /// "AI not configured" state instead of a client that always fails.
    pub fn new(api_key: &str) -> Option<Self> {
        if api_key.trim().is_empty() {
            return None;
        }
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| BASE_URL.to_string());
        Some(Self::with_base_url(api_key, &base_url))
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

fn candidate_text(payload: &Value) -> String {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    async fn stream_reply(
        &self,
        system_instruction: &str,
        content: &str,
    ) -> Result<ReplyStream, String> {
        let url = format!(
            "{}/models/{MODEL}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "systemInstruction": { "parts": [{ "text": system_instruction }] },
                "contents": [{ "parts": [{ "text": content }] }]
            }))
            .send()
            .await
            .map_err(|err| format!("generation request failed: {err}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("generation returned {status}: {body}"));
        }

        let fragments = response.bytes_stream().eventsource().filter_map(|event| async {
            match event {
                Ok(event) => {
                    let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
                        return None;
                    };
                    let text = candidate_text(&payload);
                    if text.is_empty() {
                        None
                    } else {
                        Some(Ok(text))
                    }
                }
                Err(err) => Some(Err(format!("generation stream failed: {err}"))),
            }
        });

        Ok(Box::pin(fragments))
    }

    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, String> {
        let url = format!(
            "{}/models/{MODEL}:generateContent?key={}",
            self.base_url, self.api_key
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "contents": [{
                    "parts": [
                        { "inlineData": { "mimeType": mime_type, "data": encoded } },
                        { "text": "Transcribe this audio." }
                    ]
                }]
            }))
            .send()
            .await
            .map_err(|err| format!("transcription request failed: {err}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("transcription returned {status}: {body}"));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("transcription parse failed: {err}"))?;

        let text = candidate_text(&payload).trim().to_string();
        if text.is_empty() {
            return Err("transcription response had empty content".to_string());
        }
        Ok(text)
    }
}

/// Distinguishes rejected-credential failures from connectivity ones so the
/// operator sees the right notice in the thread.
pub fn is_credential_error(err: &str) -> bool {
    err.contains("API key")
        || err.contains("API Key")
        || err.contains("API_KEY_INVALID")
        || err.contains("PERMISSION_DENIED")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn streams_fragments_from_sse_body() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"!\"}]}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:streamGenerateContent")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url("test-key", &server.uri());
        let mut stream = client.stream_reply("system", "Client: hi").await.unwrap();

        let mut accumulated = String::new();
        while let Some(fragment) = stream.next().await {
            accumulated.push_str(&fragment.unwrap());
        }
        assert_eq!(accumulated, "Hi there!");
    }

    #[tokio::test]
    async fn surfaces_http_errors_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("API_KEY_INVALID"))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url("bad-key", &server.uri());
        let err = client.stream_reply("system", "hi").await.err().unwrap();
        assert!(err.contains("400"));
        assert!(is_credential_error(&err));
    }

    #[tokio::test]
    async fn transcribes_inline_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "  book me in  " }] } }]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url("test-key", &server.uri());
        let text = client.transcribe(b"fake-audio", "audio/webm").await.unwrap();
        assert_eq!(text, "book me in");
    }

    #[test]
    fn empty_key_yields_no_client() {
        assert!(GeminiClient::new("   ").is_none());
        assert!(GeminiClient::new("k").is_some());
    }
}
