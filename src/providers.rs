use std::env;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::events::SseDecoder;
use crate::generation::{FragmentStream, Generator, MockGenerator};
use crate::{Role, Turn};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mock,
    Openai,
    Gemini,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Mock => write!(f, "mock"),
            Provider::Openai => write!(f, "openai"),
            Provider::Gemini => write!(f, "gemini"),
        }
    }
}

impl Provider {
    /// Model used when none is configured.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Mock => "mock",
            Provider::Openai => "gpt-4o-mini",
            Provider::Gemini => "gemini-1.5-flash",
        }
    }
}

/// Generation parameters shared by the remote providers.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

/// Stop sequence the remote providers are asked to honour.
pub const STOP_SEQUENCE: &str = "###";

/// Build the generator for `provider`, reading its API key from the
/// environment.
pub fn build_generator(
    provider: Provider,
    params: GenerationParams,
    mock_word_delay: Duration,
) -> Result<Arc<dyn Generator>> {
    match provider {
        Provider::Mock => Ok(Arc::new(MockGenerator::new(mock_word_delay))),
        Provider::Openai => {
            let api_key =
                env::var("OPENAI_API_KEY").map_err(|_| RelayError::MissingApiKey("OPENAI_API_KEY"))?;
            Ok(Arc::new(OpenAiGenerator::new(api_key, params)))
        }
        Provider::Gemini => {
            let api_key =
                env::var("GEMINI_API_KEY").map_err(|_| RelayError::MissingApiKey("GEMINI_API_KEY"))?;
            Ok(Arc::new(GeminiGenerator::new(api_key, params)))
        }
    }
}

type FragmentSender = mpsc::UnboundedSender<Result<String>>;

/// Parses one SSE data payload into an optional text fragment.
type PayloadParser = fn(&str) -> serde_json::Result<Option<String>>;

/// Run `request` in the background and expose its text deltas as a
/// [`FragmentStream`].
///
/// The task ends when the provider finishes, when `cancel` fires, or when the
/// stream is dropped; the HTTP response is dropped with it.
fn spawn_stream(
    provider: &'static str,
    request: reqwest::RequestBuilder,
    parse: PayloadParser,
    cancel: CancellationToken,
) -> FragmentStream {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => debug!(provider, "generation cancelled"),
            _ = tx.closed() => debug!(provider, "fragment consumer went away"),
            result = pump(provider, request, parse, &tx) => {
                if let Err(e) = result {
                    warn!(provider, error = %e, "generation failed");
                    let _ = tx.send(Err(e));
                }
            }
        }
    });

    Box::pin(UnboundedReceiverStream::new(rx))
}

async fn pump(
    provider: &'static str,
    request: reqwest::RequestBuilder,
    parse: PayloadParser,
    tx: &FragmentSender,
) -> Result<()> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await?;
        return Err(RelayError::Provider {
            provider,
            status,
            body,
        });
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for payload in decoder.push(&chunk) {
            if payload == "[DONE]" {
                return Ok(());
            }
            match parse(&payload) {
                Ok(Some(text)) if !text.is_empty() => {
                    if tx.send(Ok(text)).is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(provider, error = %e, "skipping unparseable chunk"),
            }
        }
    }

    Ok(())
}

// -- OpenAI SSE types -------------------------------------------------------

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
pub struct OpenAIChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub delta: OpenAIDelta,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChunk {
    pub choices: Vec<OpenAIChoice>,
}

impl OpenAIChatRequest {
    pub fn new(turns: &[Turn], params: &GenerationParams) -> Self {
        Self {
            model: params.model.clone(),
            messages: turns
                .iter()
                .map(|t| OpenAIChatMessage {
                    role: t.role.to_string(),
                    content: t.content.clone(),
                })
                .collect(),
            max_tokens: params.max_tokens,
            stream: true,
            stop: params.stop.clone(),
        }
    }
}

/// Text delta of the first choice in an OpenAI stream chunk.
pub fn parse_openai_payload(payload: &str) -> serde_json::Result<Option<String>> {
    let chunk: OpenAIChunk = serde_json::from_str(payload)?;
    Ok(chunk.choices.into_iter().next().and_then(|c| c.delta.content))
}

/// Streams chat completions from OpenAI.
pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    params: GenerationParams,
}

impl OpenAiGenerator {
    pub fn new(api_key: String, params: GenerationParams) -> Self {
        Self {
            client: Client::new(),
            api_key,
            params,
        }
    }
}

impl Generator for OpenAiGenerator {
    fn model(&self) -> &str {
        &self.params.model
    }

    fn generate(&self, turns: Vec<Turn>, cancel: CancellationToken) -> FragmentStream {
        let request = self
            .client
            .post(OPENAI_URL)
            .bearer_auth(&self.api_key)
            .json(&OpenAIChatRequest::new(&turns, &self.params));
        spawn_stream("openai", request, parse_openai_payload, cancel)
    }
}

// -- Gemini SSE types -------------------------------------------------------

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    pub generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiChunk {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
}

impl GeminiRequest {
    pub fn new(turns: &[Turn], params: &GenerationParams) -> Self {
        Self {
            contents: turns
                .iter()
                .map(|t| GeminiContent {
                    role: Some(
                        match t.role {
                            Role::User => "user",
                            Role::Assistant => "model",
                        }
                        .to_string(),
                    ),
                    parts: vec![GeminiPart {
                        text: Some(t.content.clone()),
                    }],
                })
                .collect(),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: params.max_tokens,
                stop_sequences: params.stop.clone(),
            },
        }
    }
}

/// Concatenated text parts of the first candidate in a Gemini stream chunk.
pub fn parse_gemini_payload(payload: &str) -> serde_json::Result<Option<String>> {
    let chunk: GeminiChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        }))
}

/// Streams content from Google's generative language API.
pub struct GeminiGenerator {
    client: Client,
    api_key: String,
    params: GenerationParams,
}

impl GeminiGenerator {
    pub fn new(api_key: String, params: GenerationParams) -> Self {
        Self {
            client: Client::new(),
            api_key,
            params,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/{}:streamGenerateContent?alt=sse",
            GEMINI_BASE_URL, self.params.model
        )
    }
}

impl Generator for GeminiGenerator {
    fn model(&self) -> &str {
        &self.params.model
    }

    fn generate(&self, turns: Vec<Turn>, cancel: CancellationToken) -> FragmentStream {
        let request = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&GeminiRequest::new(&turns, &self.params));
        spawn_stream("gemini", request, parse_gemini_payload, cancel)
    }
}
