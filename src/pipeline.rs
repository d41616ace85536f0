//! Layered model calls.
//!
//! A base [`ModelCall`] is wrapped by decorators built from a declarative
//! [`LayerSpec`] list at configuration time. Every layer exposes the same
//! `invoke(prompt)` interface, so layers compose in any order. The first
//! spec in the list is the innermost wrapper.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::extractor::{Entity, ExtractError, Extraction, ExtractionCall, Extractor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub text: String,
    pub tokens_used: u64,
}

/// A language model, or a decorator around one.
#[async_trait]
pub trait ModelCall: Send + Sync {
    fn model_id(&self) -> &str;

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, ExtractError>;
}

/// One decorator in a model pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Re-invoke the model while its output is not valid JSON.
    OutputGuard { max_retries: u32 },
    /// Log prompt and response sizes and latency.
    Audit { sample_length: usize },
}

impl LayerSpec {
    /// Layers requested by an extraction config. Reads the `guardrails` and
    /// `audit` sections; each is enabled by `"enabled": true`.
    pub fn from_extraction_config(config: &Value) -> Vec<LayerSpec> {
        let mut layers = Vec::new();
        let guardrails = &config["guardrails"];
        if guardrails["enabled"].as_bool().unwrap_or(false) {
            let max_retries = guardrails["max_retries"].as_u64().unwrap_or(3) as u32;
            layers.push(LayerSpec::OutputGuard { max_retries });
        }
        let audit = &config["audit"];
        if audit["enabled"].as_bool().unwrap_or(false) {
            let sample_length = audit["sample_length"].as_u64().unwrap_or(200) as usize;
            layers.push(LayerSpec::Audit { sample_length });
        }
        layers
    }
}

/// Wrap `base` with `layers`, innermost first.
pub fn compose(base: Arc<dyn ModelCall>, layers: &[LayerSpec]) -> Arc<dyn ModelCall> {
    layers.iter().fold(base, |inner, spec| match spec {
        LayerSpec::OutputGuard { max_retries } => Arc::new(OutputGuardLayer {
            model_id: format!("guardrails/{}", inner.model_id()),
            inner,
            max_retries: *max_retries,
        }),
        LayerSpec::Audit { sample_length } => Arc::new(AuditLayer {
            model_id: format!("audit/{}", inner.model_id()),
            inner,
            sample_length: *sample_length,
        }),
    })
}

struct OutputGuardLayer {
    inner: Arc<dyn ModelCall>,
    model_id: String,
    max_retries: u32,
}

#[async_trait]
impl ModelCall for OutputGuardLayer {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, ExtractError> {
        let mut tokens_used = 0;
        let mut current = prompt.to_string();
        for attempt in 0..=self.max_retries {
            let response = self.inner.invoke(&current).await?;
            tokens_used += response.tokens_used;
            match serde_json::from_str::<Value>(&response.text) {
                Ok(_) => {
                    return Ok(ModelResponse {
                        text: response.text,
                        tokens_used,
                    })
                }
                Err(err) => {
                    warn!(model = %self.model_id, attempt, error = %err, "model_output_rejected");
                    current = format!(
                        "{prompt}\n\nYour previous response was not valid JSON ({err}). \
                         Respond with JSON only."
                    );
                }
            }
        }
        Err(ExtractError::MalformedResponse(format!(
            "output still invalid after {} correction(s)",
            self.max_retries
        )))
    }
}

struct AuditLayer {
    inner: Arc<dyn ModelCall>,
    model_id: String,
    sample_length: usize,
}

#[async_trait]
impl ModelCall for AuditLayer {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, ExtractError> {
        let start = Instant::now();
        let result = self.inner.invoke(prompt).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                let sample: String = response.text.chars().take(self.sample_length).collect();
                info!(
                    model = %self.model_id,
                    prompt_chars = prompt.len(),
                    response_chars = response.text.len(),
                    tokens_used = response.tokens_used,
                    latency_ms,
                    "model_call_audited"
                );
                debug!(model = %self.model_id, sample = %sample, "model_response_sample");
            }
            Err(err) => {
                warn!(model = %self.model_id, latency_ms, error = %err, "model_call_failed");
            }
        }
        result
    }
}

/// Builds the prompt, runs the layered model and parses entities from its
/// JSON output. Accepts either a bare array of entities or an object with an
/// `extractions` array.
pub struct PipelineExtractor {
    base: Arc<dyn ModelCall>,
    default_layers: Vec<LayerSpec>,
}

impl PipelineExtractor {
    pub fn new(base: Arc<dyn ModelCall>) -> Self {
        Self {
            base,
            default_layers: Vec::new(),
        }
    }

    /// Layers used when a request's config asks for none.
    pub fn with_default_layers(mut self, layers: Vec<LayerSpec>) -> Self {
        self.default_layers = layers;
        self
    }

    fn prompt(call: &ExtractionCall) -> String {
        let description = call.config["prompt_description"]
            .as_str()
            .unwrap_or("Extract the named entities from the document.");
        format!(
            "{description}\nReturn a JSON array of objects with \
             \"extraction_class\" and \"extraction_text\" fields.\n\n---\n{}",
            call.text
        )
    }
}

#[async_trait]
impl Extractor for PipelineExtractor {
    async fn extract(&self, call: ExtractionCall) -> Result<Extraction, ExtractError> {
        let requested = LayerSpec::from_extraction_config(&call.config);
        let layers = if requested.is_empty() {
            &self.default_layers
        } else {
            &requested
        };
        let model = compose(Arc::clone(&self.base), layers);
        let response = model.invoke(&Self::prompt(&call)).await?;
        let entities = parse_entities(&response.text)?;
        Ok(Extraction {
            entities,
            provider: call.model_id,
            tokens_used: response.tokens_used,
        })
    }
}

fn parse_entities(text: &str) -> Result<Vec<Entity>, ExtractError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ExtractError::MalformedResponse(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("extractions") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ExtractError::MalformedResponse(
                    "expected an `extractions` array".into(),
                ))
            }
        },
        _ => {
            return Err(ExtractError::MalformedResponse(
                "expected a JSON array or object".into(),
            ))
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| ExtractError::MalformedResponse(e.to_string()))
        })
        .collect()
}
