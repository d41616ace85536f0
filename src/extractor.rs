//! The extraction capability the worker calls into.
//!
//! Extraction itself is pluggable: anything implementing [`Extractor`] can be
//! wired into the worker. [`NullExtractor`] is the no-model default and
//! [`crate::pipeline::PipelineExtractor`] adapts a layered model call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One extraction request for one pass over a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCall {
    pub model_id: String,
    pub text: String,
    /// Free-form per-request configuration.
    #[serde(default)]
    pub config: Value,
}

/// A single extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub extraction_class: String,
    pub extraction_text: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Entity {
    pub fn new(class: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            extraction_class: class.into(),
            extraction_text: text.into(),
            attributes: Map::new(),
        }
    }

    /// Identity used when merging passes.
    pub fn key(&self) -> (&str, &str) {
        (&self.extraction_class, &self.extraction_text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub provider: String,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExtractError {
    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("provider authentication failed: {0}")]
    Authentication(String),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("extraction failed: {0}")]
    Other(String),
}

impl ExtractError {
    /// Worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transport(_))
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, call: ExtractionCall) -> Result<Extraction, ExtractError>;
}

/// Returns no entities. Used when no model backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExtractor;

#[async_trait]
impl Extractor for NullExtractor {
    async fn extract(&self, call: ExtractionCall) -> Result<Extraction, ExtractError> {
        Ok(Extraction {
            entities: Vec::new(),
            provider: call.model_id,
            tokens_used: 0,
        })
    }
}
