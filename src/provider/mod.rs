//! Generation provider seam.
//!
//! The HTTP layer only ever talks to [`GenerationProvider`]; [`gemini`] holds
//! the one concrete adapter.

pub mod gemini;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use gemini::{GeminiClient, GeminiConfig};

/// Finite, non-restartable sequence of text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// Result of a completed (non-streamed) generation call.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Generated text, `None` when the provider returned no candidate text.
    pub text: Option<String>,
    /// Provider payload as received.
    pub raw: serde_json::Value,
}

impl Generation {
    /// The generated text if it contains anything besides whitespace.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("prompt was blocked by the provider: {0}")]
    Blocked(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError>;

    /// Opens an incremental generation. Errors before the first byte of the
    /// upstream body are returned directly; later ones arrive as stream items.
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError>;
}
