//! Chat session
//!
//! Owns one model, one context and one growing conversation, and drives them
//! through the load → prepare → system prompt → user turn → generate cycle.
//!
//! # Cancellation
//!
//! [`Session::stop_generation`] zeroes the stop position, so the very next
//! [`Session::generate_next_token`] returns [`Fragment::EndOfTurn`]. It is
//! observed only between steps: cancellation latency is one generation step.
//!
//! # Threading
//!
//! A session is single-writer. Callers that share one across threads must wrap
//! the whole session in a lock, since its invariants span several fields.

use std::path::Path;
use thiserror::Error;

use crate::inference::backend::{
    BackendError, ContextParams, InferenceBackend, ModelSummary, SamplerParams,
};
use crate::inference::batcher::{DecodeBatcher, DecodeError};
use crate::inference::streaming::{Fragment, Utf8Assembler};
use crate::inference::window::{ContextWindow, ShiftError};
use crate::system::{thread_count, ThreadBudget};
use crate::types::{PromptFormat, Role};

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    ModelLoaded,
    /// Context and sampler exist; no system prompt yet
    SessionReady,
    /// Ready for a user turn
    Idle,
    Generating,
}

/// Errors returned by session operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to prepare session: {0}")]
    SessionInit(String),

    #[error("System prompt too long: {tokens} tokens, limit is {limit}")]
    PromptTooLong { tokens: usize, limit: u32 },

    #[error(
        "Context exhausted: the system prompt uses {system_prompt_position} of {capacity} positions"
    )]
    ContextExhausted {
        system_prompt_position: u32,
        capacity: u32,
    },

    #[error("User turn produced no tokens")]
    EmptyTurn,

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl From<ShiftError> for SessionError {
    fn from(e: ShiftError) -> Self {
        match e {
            ShiftError::Exhausted {
                system_prompt_position,
                capacity,
            } => SessionError::ContextExhausted {
                system_prompt_position,
                capacity,
            },
            ShiftError::Backend(e) => SessionError::Decode(e.to_string()),
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Shift(e) => e.into(),
            DecodeError::Backend { .. } => SessionError::Decode(e.to_string()),
        }
    }
}

/// Fixed parameters of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Context capacity in positions
    pub context_size: u32,
    /// Positions kept free at the end of the context
    pub overflow_headroom: u32,
    /// Tokens per decode call
    pub batch_size: u32,
    pub threads: ThreadBudget,
    pub sampler: SamplerParams,
    pub format: PromptFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: 256,
            overflow_headroom: 4,
            batch_size: 1,
            threads: ThreadBudget::default(),
            sampler: SamplerParams {
                top_k: 40,
                top_p: 0.95,
                temperature: 0.7,
                seed: 0xFFFF_FFFF,
            },
            format: PromptFormat::default(),
        }
    }
}

/// Snapshot of the session's cursor bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positions {
    pub system_prompt: u32,
    pub current: u32,
    pub stop_generation: u32,
    pub capacity: u32,
}

/// A single-sequence chat session over an inference backend
pub struct Session<B: InferenceBackend> {
    backend: B,
    config: SessionConfig,
    state: SessionState,
    window: ContextWindow,
    batcher: DecodeBatcher,
    assembler: Utf8Assembler,
    stop_generation_position: u32,
    model: Option<ModelSummary>,
}

impl<B: InferenceBackend> Session<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        let window = ContextWindow::new(config.context_size, config.overflow_headroom);
        let batcher = DecodeBatcher::new(config.batch_size);
        Self {
            backend,
            config,
            state: SessionState::Unloaded,
            window,
            batcher,
            assembler: Utf8Assembler::new(),
            stop_generation_position: 0,
            model: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn positions(&self) -> Positions {
        Positions {
            system_prompt: self.window.system_prompt_position(),
            current: self.window.current_position(),
            stop_generation: self.stop_generation_position,
            capacity: self.window.capacity(),
        }
    }

    /// Information about the loaded model, if any
    pub fn model(&self) -> Option<&ModelSummary> {
        self.model.as_ref()
    }

    /// Text generated so far in the current (or last finished) turn
    pub fn last_response(&self) -> &str {
        self.assembler.assembled()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Describes the compute backend. Informational only.
    pub fn system_info(&self) -> String {
        self.backend.system_info()
    }

    /// Loads a model file, replacing any model already loaded.
    pub fn load_model(&mut self, path: &Path) -> Result<ModelSummary, SessionError> {
        if path.as_os_str().is_empty() {
            tracing::error!("Model path is empty");
            return Err(SessionError::ModelLoad("model path is empty".to_string()));
        }
        if self.state != SessionState::Unloaded {
            tracing::info!("Replacing loaded model");
            self.unload();
        }

        tracing::debug!("Loading model from: {}", path.display());
        let summary = self.backend.load_model(path).map_err(|e| {
            tracing::error!("Failed to load model: {}", e);
            SessionError::ModelLoad(e.to_string())
        })?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            summary.path.display(),
            summary.param_count,
            summary.vocab_size,
            summary.context_length
        );
        self.model = Some(summary.clone());
        self.state = SessionState::ModelLoaded;
        Ok(summary)
    }

    /// Creates the context and sampler for the loaded model.
    ///
    /// On failure the session stays in `ModelLoaded`.
    pub fn prepare_session(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionState::ModelLoaded], "prepare a session")?;

        let params = ContextParams {
            capacity: self.config.context_size,
            batch_size: self.config.batch_size,
            threads: thread_count(&self.config.threads),
            sampler: self.config.sampler.clone(),
        };
        if let Some(model) = &self.model {
            if params.capacity > model.context_length {
                tracing::warn!(
                    "Context size {} exceeds the model's training context {}",
                    params.capacity,
                    model.context_length
                );
            }
        }

        self.backend.create_context(&params).map_err(|e| {
            tracing::error!("Failed to create context: {}", e);
            SessionError::SessionInit(e.to_string())
        })?;

        self.window = ContextWindow::new(self.config.context_size, self.config.overflow_headroom);
        self.batcher = DecodeBatcher::new(self.config.batch_size);
        self.reset_short_term();
        self.state = SessionState::SessionReady;
        tracing::info!("Session prepared successfully");
        Ok(())
    }

    /// Replaces the whole conversation with a fresh system prompt.
    ///
    /// The prompt is tokenized and checked against the context before anything
    /// is cleared, so a rejected prompt leaves the conversation intact. A turn
    /// still being generated is dropped along with the rest.
    pub fn set_system_prompt(&mut self, text: &str) -> Result<(), SessionError> {
        self.require(
            &[
                SessionState::SessionReady,
                SessionState::Idle,
                SessionState::Generating,
            ],
            "set the system prompt",
        )?;
        tracing::debug!("System prompt received: {}", text);

        let framed = self.config.format.frame(Role::System, text);
        let tokens = self.backend.tokenize(&framed)?;
        if tokens.len() > self.window.limit() as usize {
            tracing::error!("System prompt too long: {} tokens", tokens.len());
            return Err(SessionError::PromptTooLong {
                tokens: tokens.len(),
                limit: self.window.limit(),
            });
        }

        self.reset_long_term();
        self.reset_short_term();
        self.state = SessionState::SessionReady;

        if let Err(e) = self
            .batcher
            .decode(&mut self.backend, &mut self.window, &tokens, false)
        {
            tracing::error!("Failed to decode system tokens: {}", e);
            self.reset_long_term();
            return Err(e.into());
        }

        self.window.seal_system_prompt();
        self.state = SessionState::Idle;
        tracing::info!(
            "System prompt processed successfully ({} tokens)",
            tokens.len()
        );
        Ok(())
    }

    /// Ingests a user turn and arms generation for up to `max_new_tokens`.
    ///
    /// A turn longer than the space next to the system prompt is cut from the
    /// end; the dropped count is logged and the call still succeeds.
    pub fn submit_user_turn(&mut self, text: &str, max_new_tokens: u32) -> Result<(), SessionError> {
        self.require(&[SessionState::Idle], "submit a user turn")?;
        self.reset_short_term();
        tracing::debug!("User prompt received: {}", text);

        let framed = self.config.format.frame(Role::User, text);
        let mut tokens = self.backend.tokenize(&framed)?;

        let budget = self.window.turn_budget() as usize;
        if budget == 0 {
            return Err(SessionError::ContextExhausted {
                system_prompt_position: self.window.system_prompt_position(),
                capacity: self.window.capacity(),
            });
        }
        if tokens.len() > budget {
            tracing::warn!(
                "User prompt too long! Skipped {} tokens",
                tokens.len() - budget
            );
            tokens.truncate(budget);
        }
        if tokens.is_empty() {
            return Err(SessionError::EmptyTurn);
        }

        if let Err(e) = self
            .batcher
            .decode(&mut self.backend, &mut self.window, &tokens, true)
        {
            tracing::error!("Failed to decode user tokens: {}", e);
            tracing::warn!("Partially ingested turn left in context; a reset is advisable");
            return Err(e.into());
        }

        self.stop_generation_position = self
            .window
            .current_position()
            .saturating_add(max_new_tokens);
        self.state = SessionState::Generating;
        tracing::info!(
            "User prompt processed successfully ({} tokens, stop at {})",
            tokens.len(),
            self.stop_generation_position
        );
        Ok(())
    }

    /// Produces the next piece of the assistant's reply.
    ///
    /// Returns [`Fragment::Pending`] when a token was consumed but its bytes do
    /// not complete a character yet; keep polling. [`Fragment::EndOfTurn`] is
    /// returned on every call once the turn is over.
    pub fn generate_next_token(&mut self) -> Result<Fragment, SessionError> {
        match self.state {
            SessionState::Generating => {}
            SessionState::Idle => return Ok(Fragment::EndOfTurn),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "generate a token",
                    state,
                })
            }
        }

        if self.window.is_full() {
            tracing::warn!("Context full! Shifting...");
            match self.window.shift(&mut self.backend) {
                Ok(discarded) => {
                    self.stop_generation_position =
                        self.stop_generation_position.saturating_sub(discarded);
                }
                Err(e) => return Err(self.abandon_turn(e.into())),
            }
        }

        if self.window.current_position() >= self.stop_generation_position {
            tracing::debug!("Reached stop position: {}", self.stop_generation_position);
            self.finish_turn();
            return Ok(Fragment::EndOfTurn);
        }

        let token = match self.backend.sample() {
            Ok(token) => token,
            Err(e) => return Err(self.abandon_turn(e.into())),
        };

        match self
            .batcher
            .decode(&mut self.backend, &mut self.window, &[token], true)
        {
            Ok(discarded) => {
                self.stop_generation_position =
                    self.stop_generation_position.saturating_sub(discarded);
            }
            Err(e) => {
                tracing::error!("llama_decode failed for generated token: {}", e);
                return Err(self.abandon_turn(e.into()));
            }
        }

        if self.backend.is_end_of_generation(token) {
            tracing::debug!("End of generation (EOG token)");
            self.finish_turn();
            return Ok(Fragment::EndOfTurn);
        }

        let bytes = match self.backend.token_to_bytes(token) {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.abandon_turn(e.into())),
        };

        Ok(match self.assembler.push(&bytes) {
            Some(text) => Fragment::Text(text),
            None => Fragment::Pending,
        })
    }

    /// Ends the current turn; the next generate call returns end-of-turn.
    pub fn stop_generation(&mut self) {
        self.reset_short_term();
        if self.state == SessionState::Generating {
            self.state = SessionState::Idle;
        }
        tracing::info!("Generation stopped");
    }

    /// Forgets the conversation, system prompt included, and resets the sampler.
    pub fn reset_conversation(&mut self) {
        self.reset_short_term();
        match self.state {
            SessionState::SessionReady | SessionState::Idle | SessionState::Generating => {
                self.reset_long_term();
                self.backend.reset_sampler();
                self.state = SessionState::SessionReady;
            }
            SessionState::Unloaded | SessionState::ModelLoaded => self.window.reset(),
        }
        tracing::info!("Conversation reset");
    }

    /// Frees sampler, context and model, in that order. Idempotent.
    pub fn unload(&mut self) {
        self.reset_short_term();
        self.window.reset();
        if self.state == SessionState::Unloaded {
            return;
        }
        self.backend.free_context();
        self.backend.free_model();
        self.model = None;
        self.state = SessionState::Unloaded;
        tracing::info!("Resources unloaded");
    }

    fn require(&self, allowed: &[SessionState], operation: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            tracing::error!("Cannot {} while {:?}", operation, self.state);
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Clears the conversation and the backend's cached positions.
    fn reset_long_term(&mut self) {
        self.window.reset();
        self.backend.clear_memory();
    }

    /// Clears per-turn state: stop position, pending bytes and turn text.
    fn reset_short_term(&mut self) {
        self.stop_generation_position = 0;
        self.assembler.clear();
    }

    fn finish_turn(&mut self) {
        self.assembler.discard_pending();
        self.stop_generation_position = 0;
        self.state = SessionState::Idle;
    }

    fn abandon_turn(&mut self, error: SessionError) -> SessionError {
        tracing::error!("Abandoning turn: {}", error);
        self.reset_short_term();
        self.state = SessionState::Idle;
        error
    }
}

impl<B: InferenceBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.unload();
    }
}
