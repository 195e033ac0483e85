//! Backend abstraction
//!
//! The session only orchestrates calls into an inference backend. Everything
//! that touches model weights, the KV cache, the tokenizer or the sampler goes
//! through [`InferenceBackend`], so the session logic can be driven by llama.cpp
//! in production and by a scripted backend in tests.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by an inference backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend not initialized")]
    NotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("No context created")]
    NoContext,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Failed to convert token to bytes: {0}")]
    Detokenize(String),

    #[error("KV cache update failed: {0}")]
    Memory(String),
}

/// A token id as understood by the backend's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TokenId(pub i32);

impl From<i32> for TokenId {
    #[inline]
    fn from(value: i32) -> Self {
        TokenId(value)
    }
}

impl From<TokenId> for i32 {
    #[inline]
    fn from(token: TokenId) -> i32 {
        token.0
    }
}

/// One entry of a decode batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchToken {
    pub token: TokenId,
    /// Absolute position of the token in the context
    pub position: u32,
    /// Whether the output distribution is needed for this token
    pub wants_logits: bool,
}

/// Parameters used to create the decoding context and its sampler
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Number of positions the context can hold
    pub capacity: u32,
    /// Maximum tokens per decode call
    pub batch_size: u32,
    /// Threads used for generation and batch processing
    pub threads: u32,
    /// Sampler chain settings
    pub sampler: SamplerParams,
}

/// Sampler chain settings: top-k, then top-p, then temperature, then a seeded draw.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub seed: u32,
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    /// Path to the loaded model
    pub path: PathBuf,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
}

/// Operations the session needs from an inference backend.
///
/// Implementations own the model, the context and the sampler. Positions are
/// absolute indices into the single sequence the session drives.
pub trait InferenceBackend {
    /// Load a model file. Nothing is retained when this fails.
    fn load_model(&mut self, path: &Path) -> Result<ModelSummary, BackendError>;

    /// Create the decoding context and the sampler for the loaded model.
    fn create_context(&mut self, params: &ContextParams) -> Result<(), BackendError>;

    /// Tokenize text, adding the model's special prefix tokens where it expects them.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    /// Run one forward pass over `batch`.
    fn decode(&mut self, batch: &[BatchToken]) -> Result<(), BackendError>;

    /// Draw one token from the distribution produced by the last decode.
    fn sample(&mut self) -> Result<TokenId, BackendError>;

    /// Returns true for end-of-generation tokens (EOS, EOT and friends).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of a token's text piece. May be a partial UTF-8 sequence.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    /// Drop the cached state for positions `[start, end)`.
    fn remove_positions(&mut self, start: u32, end: u32) -> Result<(), BackendError>;

    /// Add `delta` to the positions of everything cached in `[start, end)`.
    fn shift_positions(&mut self, start: u32, end: u32, delta: i32) -> Result<(), BackendError>;

    /// Clear all cached state while keeping the context alive.
    fn clear_memory(&mut self);

    /// Return the sampler to its freshly created state.
    fn reset_sampler(&mut self);

    /// Free the sampler and the context. Safe to call when none exist.
    fn free_context(&mut self);

    /// Free the model. Safe to call when none is loaded.
    fn free_model(&mut self);

    /// Human readable description of the compute backend.
    fn system_info(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_id_conversions() {
        let token = TokenId::from(42);
        assert_eq!(token, TokenId(42));
        assert_eq!(i32::from(token), 42);
    }

    #[test]
    fn test_backend_error_messages() {
        let err = BackendError::Decode("status 1".to_string());
        assert_eq!(err.to_string(), "Decode failed: status 1");
        assert_eq!(BackendError::NoContext.to_string(), "No context created");
    }
}
