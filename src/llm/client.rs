//! Provider HTTP client: Anthropic messages API and OpenAI chat
//! completions, buffered and streaming.

use crate::config::{LlmConfig, Platform};
use crate::error::LlmError;
use crate::llm::{FragmentStream, ModelBackend};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;

/// Reqwest-backed [`ModelBackend`] speaking the configured provider's API.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingProviderKey(
                config.platform.as_str().to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        Ok(Self { http, config })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    // Both providers accept the same body shape for a single-turn prompt.
    fn request_body(&self, prompt: &str, stream: bool) -> Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        let base_url = self.config.base_url.trim_end_matches('/');
        let body = self.request_body(prompt, stream);

        match self.config.platform {
            Platform::Anthropic => self
                .http
                .post(format!("{base_url}/v1/messages"))
                .header("x-api-key", self.config.api_key.as_str())
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body),
            Platform::OpenAi => self
                .http
                .post(format!("{base_url}/v1/chat/completions"))
                .bearer_auth(self.config.api_key.as_str())
                .json(&body),
        }
    }

    async fn send_checked(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, LlmError> {
        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout(self.config.request_timeout_secs)
            } else {
                LlmError::ProviderRequest(error.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| {
                value["error"]["message"]
                    .as_str()
                    .map(str::to_string)
            })
            .unwrap_or_else(|| truncate_body(&body));

        Err(LlmError::ProviderRequest(format!(
            "{} API error ({status}): {message}",
            provider_display_name(self.config.platform)
        )))
    }
}

#[async_trait]
impl ModelBackend for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let builder = self.request(prompt, false).timeout(self.request_timeout());
        let response = self.send_checked(builder).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|error| LlmError::CompletionFailed(format!("invalid response JSON: {error}")))?;

        let text = match self.config.platform {
            Platform::Anthropic => collect_anthropic_text(&body),
            Platform::OpenAi => body["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string),
        };

        text.filter(|text| !text.is_empty())
            .ok_or_else(|| LlmError::CompletionFailed("response contained no text".into()))
    }

    async fn stream(&self, prompt: &str) -> Result<FragmentStream, LlmError> {
        // No whole-body timeout here: a healthy stream can outlive the
        // buffered request budget. The connect timeout still bounds setup.
        let builder = self.request(prompt, true);
        let response = self.send_checked(builder).await?;

        let platform = self.config.platform;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = SseLineBuffer::default();
            let mut finished = false;

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        yield Err(LlmError::ProviderRequest(error.to_string()));
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    match parse_sse_line(platform, &line) {
                        SseItem::Delta(text) => yield Ok(text),
                        SseItem::Done => {
                            finished = true;
                            break 'outer;
                        }
                        SseItem::Ignore => {}
                    }
                }
            }

            if !finished {
                yield Err(LlmError::StreamTruncated);
            }
        };

        Ok(stream.boxed())
    }
}

fn provider_display_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Anthropic => "Anthropic",
        Platform::OpenAi => "OpenAI",
    }
}

fn collect_anthropic_text(body: &Value) -> Option<String> {
    let blocks = body["content"].as_array()?;
    let text = blocks
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    Some(text)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 600;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Accumulates raw bytes and emits complete SSE lines.
#[derive(Default)]
struct SseLineBuffer {
    pending: String,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut lines = Vec::new();
        while let Some(newline_at) = self.pending.find('\n') {
            let line = self.pending[..newline_at].trim_end_matches('\r').to_string();
            self.pending.drain(..=newline_at);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

enum SseItem {
    Delta(String),
    Done,
    Ignore,
}

/// Interpret one SSE line for the given provider.
///
/// Anthropic: `data: {"type":"content_block_delta","delta":{"text":...}}`
/// terminated by a `message_stop` event. OpenAI: `data: {...}` chat chunks
/// terminated by the literal `data: [DONE]`.
fn parse_sse_line(platform: Platform, line: &str) -> SseItem {
    let Some(data) = line.strip_prefix("data:") else {
        return SseItem::Ignore;
    };
    let data = data.trim();

    match platform {
        Platform::Anthropic => {
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                return SseItem::Ignore;
            };
            match event["type"].as_str() {
                Some("content_block_delta") => event["delta"]["text"]
                    .as_str()
                    .map(|text| SseItem::Delta(text.to_string()))
                    .unwrap_or(SseItem::Ignore),
                Some("message_stop") => SseItem::Done,
                _ => SseItem::Ignore,
            }
        }
        Platform::OpenAi => {
            if data == "[DONE]" {
                return SseItem::Done;
            }
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                return SseItem::Ignore;
            };
            event["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|text| !text.is_empty())
                .map(|text| SseItem::Delta(text.to_string()))
                .unwrap_or(SseItem::Ignore)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: par").is_empty());
        let lines = buffer.push(b"tial\r\ndata: next\n\n");
        assert_eq!(lines, ["data: partial", "data: next"]);
    }

    #[test]
    fn anthropic_lines_parse_deltas_and_stop() {
        let delta = r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#;
        match parse_sse_line(Platform::Anthropic, delta) {
            SseItem::Delta(text) => assert_eq!(text, "Hel"),
            _ => panic!("expected delta"),
        }

        assert!(matches!(
            parse_sse_line(Platform::Anthropic, r#"data: {"type":"message_stop"}"#),
            SseItem::Done
        ));
        assert!(matches!(
            parse_sse_line(Platform::Anthropic, "event: message_delta"),
            SseItem::Ignore
        ));
    }

    #[test]
    fn openai_lines_parse_deltas_and_done() {
        let delta = r#"data: {"choices":[{"delta":{"content":"lo!"}}]}"#;
        match parse_sse_line(Platform::OpenAi, delta) {
            SseItem::Delta(text) => assert_eq!(text, "lo!"),
            _ => panic!("expected delta"),
        }

        assert!(matches!(
            parse_sse_line(Platform::OpenAi, "data: [DONE]"),
            SseItem::Done
        ));
        assert!(matches!(
            parse_sse_line(Platform::OpenAi, r#"data: {"choices":[{"delta":{}}]}"#),
            SseItem::Ignore
        ));
    }

    #[test]
    fn anthropic_text_blocks_concatenate() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": " world"}
            ]
        });
        assert_eq!(collect_anthropic_text(&body).as_deref(), Some("Hello world"));
    }
}
