//! Generator implementations.
//!
//! Abstraction over candidate sources: feature-gated HTTP providers for
//! hosted LLMs, plus two always-available fixtures the controller tests
//! run against — a fixed-table stub and a record/replay pair.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use requel_dag::PatchPlan;

use crate::{GenerationRequest, Generator, GeneratorError};

// ============================================================================
// Scripted generator (fixed table)
// ============================================================================

/// Returns a fixed table of responses in order; `None` entries are the
/// explicit "no improvement found" signal, and the table's end keeps
/// signalling no improvement.
pub struct ScriptedGenerator {
    responses: Vec<Option<PatchPlan>>,
    cursor: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Option<PatchPlan>>) -> Self {
        Self {
            responses,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A generator that proposes each plan once, in order.
    pub fn plans(plans: Vec<PatchPlan>) -> Self {
        Self::new(plans.into_iter().map(Some).collect())
    }

    /// A generator that always declines.
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn propose(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses.get(index).cloned().flatten())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A generator whose calls always fail; exercises the
/// consume-a-slot-never-fatal failure semantics.
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn propose(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        Err(GeneratorError::Timeout("scripted timeout".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

// ============================================================================
// Record / replay
// ============================================================================

/// Wraps a live generator and records every response, so a session can be
/// turned into a replayable fixture.
pub struct RecordingGenerator<G> {
    inner: G,
    recorded: Mutex<Vec<Option<PatchPlan>>>,
}

impl<G: Generator> RecordingGenerator<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// The recorded tape as JSON, loadable by [`ReplayGenerator`].
    pub fn tape(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&*self.recorded.lock())?)
    }
}

#[async_trait]
impl<G: Generator> Generator for RecordingGenerator<G> {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let response = self.inner.propose(request).await?;
        self.recorded.lock().push(response.clone());
        Ok(response)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Replays a recorded tape without network access.
pub struct ReplayGenerator {
    tape: Vec<Option<PatchPlan>>,
    cursor: AtomicUsize,
}

impl ReplayGenerator {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let tape: Vec<Option<PatchPlan>> = serde_json::from_str(json)?;
        Ok(Self {
            tape,
            cursor: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Generator for ReplayGenerator {
    async fn propose(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        match self.tape.get(index) {
            Some(entry) => Ok(entry.clone()),
            None => Err(GeneratorError::InvalidResponse(
                "replay tape exhausted".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Hosted providers (feature-gated)
// ============================================================================

#[cfg(any(feature = "openai", feature = "anthropic", feature = "local"))]
fn plan_from_completion(content: &str) -> Result<Option<PatchPlan>, GeneratorError> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("no improvement") {
        return Ok(None);
    }
    serde_json::from_str::<PatchPlan>(trimmed)
        .map(Some)
        .map_err(|e| GeneratorError::Parse(e.to_string()))
}

#[cfg(any(feature = "openai", feature = "anthropic", feature = "local"))]
fn request_payload(request: &GenerationRequest) -> String {
    serde_json::to_string_pretty(request).unwrap_or_default()
}

/// OpenAI chat-completions provider.
#[cfg(feature = "openai")]
pub struct OpenAiGenerator {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "openai")]
impl OpenAiGenerator {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "openai")]
#[async_trait]
impl Generator for OpenAiGenerator {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You rewrite SQL queries by returning one JSON patch plan, or the text `no improvement`."},
                {"role": "user", "content": request_payload(request)},
            ],
            "response_format": {"type": "json_object"},
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Api(e.to_string()))?;
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GeneratorError::InvalidResponse("no message content".to_string()))?;
        plan_from_completion(content)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Anthropic messages provider.
#[cfg(feature = "anthropic")]
pub struct AnthropicGenerator {
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

#[cfg(feature = "anthropic")]
impl AnthropicGenerator {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "anthropic")]
#[async_trait]
impl Generator for AnthropicGenerator {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": "You rewrite SQL queries by returning one JSON patch plan, or the text `no improvement`.",
            "messages": [{"role": "user", "content": request_payload(request)}],
        });
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Api(e.to_string()))?;
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;
        let content = parsed["content"][0]["text"]
            .as_str()
            .ok_or_else(|| GeneratorError::InvalidResponse("no text content".to_string()))?;
        plan_from_completion(content)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Local OpenAI-compatible endpoint (llama.cpp, vLLM).
#[cfg(feature = "local")]
pub struct LocalGenerator {
    pub endpoint: String,
    pub model: String,
    client: reqwest::Client,
}

#[cfg(feature = "local")]
impl LocalGenerator {
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "local")]
#[async_trait]
impl Generator for LocalGenerator {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request_payload(request)}],
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Api(e.to_string()))?;
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GeneratorError::InvalidResponse("no message content".to_string()))?;
        plan_from_completion(content)
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use requel_dag::PatchOperation;

    fn plan() -> PatchPlan {
        PatchPlan::new(vec![PatchOperation::ReplaceWherePredicate {
            node: "main".into(),
            predicate: "t.a > 1".into(),
        }])
    }

    #[tokio::test]
    async fn scripted_generator_walks_its_table_then_declines() {
        let generator = ScriptedGenerator::plans(vec![plan()]);
        let request = GenerationRequest::default();
        assert!(generator.propose(&request).await.unwrap().is_some());
        assert!(generator.propose(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_then_replay_produces_the_same_tape() {
        let recording = RecordingGenerator::new(ScriptedGenerator::plans(vec![plan()]));
        let request = GenerationRequest::default();
        let live = recording.propose(&request).await.unwrap();
        recording.propose(&request).await.unwrap();

        let replay = ReplayGenerator::from_json(&recording.tape().unwrap()).unwrap();
        let replayed = replay.propose(&request).await.unwrap();
        assert_eq!(
            serde_json::to_string(&live).unwrap(),
            serde_json::to_string(&replayed).unwrap()
        );
        assert!(replay.propose(&request).await.unwrap().is_none());
        // Past the end of the tape is an error, not a silent decline.
        assert!(replay.propose(&request).await.is_err());
    }

    #[tokio::test]
    async fn failing_generator_errors_every_time() {
        let request = GenerationRequest::default();
        assert!(FailingGenerator.propose(&request).await.is_err());
    }
}
