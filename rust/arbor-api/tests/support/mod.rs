//! Shared test fixtures: scripted providers and canned embeddings.
#![allow(dead_code, reason = "each test target uses a subset of the fixtures")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use arbor_api::events::ProviderEvent;
use arbor_api::llm::{
    BlobStore, CompletionDriver, CompletionRequest, EmbeddingsClient, ProviderEventStream,
};

/// One step of a scripted provider stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit an event.
    Emit(ProviderEvent),
    /// Sleep before the next step.
    Wait(Duration),
}

/// Completion driver that replays a fixed script.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    steps: Vec<ScriptStep>,
}

impl ScriptedDriver {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// A driver that streams the given fragments then completes with
    /// their concatenation and the supplied usage.
    pub fn streaming(fragments: &[&str], usage: Option<arbor_api::domain::TokenUsage>) -> Self {
        let mut steps = vec![ScriptStep::Emit(ProviderEvent::Started)];
        let mut full = String::new();
        for fragment in fragments {
            full.push_str(fragment);
            steps.push(ScriptStep::Emit(ProviderEvent::Delta {
                text: (*fragment).to_string(),
            }));
        }
        steps.push(ScriptStep::Emit(ProviderEvent::Completed { text: full, usage }));
        Self::new(steps)
    }
}

#[async_trait]
impl CompletionDriver for ScriptedDriver {
    async fn stream(&self, _req: CompletionRequest) -> anyhow::Result<ProviderEventStream> {
        let steps = self.steps.clone();
        Ok(Box::pin(async_stream::stream! {
            for step in steps {
                match step {
                    ScriptStep::Wait(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Emit(event) => yield Ok(event),
                }
            }
        }))
    }
}

/// Embeddings client producing deterministic vectors from text bytes.
///
/// Texts sharing a prefix embed close together, which is enough to
/// exercise ranking without a real provider.
#[derive(Debug, Default, Clone)]
pub struct CannedEmbeddings {
    /// Calls observed, for asserting batch behavior.
    pub calls: Arc<Mutex<Vec<usize>>>,
}

impl CannedEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embed_one(text: &str) -> Vec<f32> {
        let bytes = text.as_bytes();
        let mut v = [0.0f32; 8];
        for (i, b) in bytes.iter().enumerate() {
            v[i % 8] += f32::from(*b) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v.to_vec()
    }
}

#[async_trait]
impl EmbeddingsClient for CannedEmbeddings {
    async fn create(&self, _model: &str, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.lock().push(texts.len());
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// Embeddings client that always fails, for degradation tests.
#[derive(Debug, Clone, Default)]
pub struct FailingEmbeddings;

#[async_trait]
impl EmbeddingsClient for FailingEmbeddings {
    async fn create(&self, _model: &str, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embeddings provider unavailable")
    }
}

/// In-memory blob store for ingestion tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<std::collections::HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.lock().insert(key.into(), bytes.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no blob under key {key}"))
    }
}
