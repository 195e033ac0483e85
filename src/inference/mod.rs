//! Inference runtime
//!
//! A single chat session over llama.cpp: backend binding, chunked decoding,
//! the sliding context window, the session state machine and the worker
//! engine that hosts it.

pub mod backend;
pub mod batcher;
pub mod engine;
pub mod llama;
pub mod model;
pub mod session;
pub mod streaming;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{BackendError, InferenceBackend, ModelSummary, SamplerParams, TokenId};
pub use engine::{ChatEngine, EngineError, EngineOptions, StopHandle};
pub use llama::LlamaCppBackend;
pub use model::{inspect_model_file, ModelFileError, ModelFileInfo, GGUF_MAGIC};
pub use session::{Positions, Session, SessionConfig, SessionError, SessionState};
pub use streaming::{Fragment, StreamToken};
pub use window::ContextWindow;
