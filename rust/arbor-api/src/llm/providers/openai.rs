//! OpenAI-compatible API driver (chat completions SSE + embeddings).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::domain::TokenUsage;
use crate::events::ProviderEvent;
use crate::llm::{
    CompletionDriver, CompletionRequest, EmbeddingsClient, LlmSettings, ProviderEventStream,
};

/// Driver for OpenAI and compatible APIs.
#[derive(Debug, Clone)]
pub struct OpenAiDriver {
    settings: LlmSettings,
    client: Client,
}

impl OpenAiDriver {
    /// Create a new driver from settings.
    pub fn new(settings: LlmSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()?;
        Ok(Self { settings, client })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn embeddings_url(&self) -> String {
        format!(
            "{}/v1/embeddings",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.settings
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("provider API key required"))
    }
}

#[async_trait]
impl CompletionDriver for OpenAiDriver {
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ProviderEventStream> {
        let model = req.model.as_ref().unwrap_or(&self.settings.model);

        let mut body = serde_json::json!({
            "model": model,
            "messages": req.messages,
            "max_tokens": self.settings.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true}
        });
        if let Some(temperature) = req.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(effort) = &req.reasoning_effort {
            body["reasoning_effort"] = serde_json::json!(effort);
        }

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key()?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("provider API error ({status}): {text}");
        }

        let stream = response.bytes_stream();

        let event_stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut content = String::new();
            let mut usage: Option<TokenUsage> = None;
            let mut started = false;

            futures::pin_mut!(stream);

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Ok(ProviderEvent::Failed { reason: format!("stream error: {e}") });
                        return;
                    }
                };
                let chunk_str = match std::str::from_utf8(&chunk) {
                    Ok(s) => s,
                    Err(e) => {
                        yield Ok(ProviderEvent::Failed { reason: format!("utf-8 error: {e}") });
                        return;
                    }
                };
                buffer.push_str(chunk_str);

                // Process complete SSE frames.
                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            yield Ok(ProviderEvent::Completed {
                                text: content.clone(),
                                usage,
                            });
                            return;
                        }
                        match serde_json::from_str::<StreamChunk>(data) {
                            Ok(parsed) => {
                                if !started {
                                    started = true;
                                    yield Ok(ProviderEvent::Started);
                                }
                                if let Some(reported) = parsed.usage {
                                    usage = Some(TokenUsage {
                                        prompt_tokens: reported.prompt_tokens,
                                        completion_tokens: reported.completion_tokens,
                                        cost_usd: None,
                                    });
                                }
                                for choice in parsed.choices {
                                    if let Some(text) = choice.delta.content {
                                        content.push_str(&text);
                                        yield Ok(ProviderEvent::Delta { text });
                                    }
                                    if let Some(text) = choice.delta.reasoning_content {
                                        yield Ok(ProviderEvent::ReasoningDelta { text });
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("unparseable provider event: {e} - {data}");
                            }
                        }
                    }
                }
            }

            // Stream ended without a [DONE] sentinel; resolve with what we have.
            yield Ok(ProviderEvent::Completed { text: content, usage });
        };

        Ok(Box::pin(event_stream))
    }
}

#[async_trait]
impl EmbeddingsClient for OpenAiDriver {
    async fn create(&self, model: &str, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(self.embeddings_url())
            .bearer_auth(self.api_key()?)
            .json(&serde_json::json!({
                "model": model,
                "input": texts,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("embeddings API error ({status}): {text}");
        }

        let mut parsed: EmbeddingsResponse = response.json().await?;
        // The API does not guarantee input order; indices do.
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// One SSE chunk of a chat-completions stream.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ReportedUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportedUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}
