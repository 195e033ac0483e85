//! Chunked decoding
//!
//! Feeds token sequences to the backend in bounded chunks, shifting the
//! context window lazily whenever the next chunk would overflow it.

use thiserror::Error;

use crate::inference::backend::{BackendError, BatchToken, InferenceBackend, TokenId};
use crate::inference::window::{ContextWindow, ShiftError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error(transparent)]
    Shift(#[from] ShiftError),

    #[error("Failed to decode batch at position {position}: {source}")]
    Backend {
        position: u32,
        source: BackendError,
    },
}

/// Splits token sequences into backend-sized chunks.
#[derive(Debug)]
pub struct DecodeBatcher {
    chunk_size: usize,
    chunk: Vec<BatchToken>,
}

impl DecodeBatcher {
    pub fn new(chunk_size: u32) -> Self {
        let chunk_size = chunk_size.max(1) as usize;
        Self {
            chunk_size,
            chunk: Vec::with_capacity(chunk_size),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Decodes `tokens` at the window cursor, advancing it chunk by chunk.
    ///
    /// Logits are requested for the final token only, and only when
    /// `want_last_logit` is set. Returns how many positions were discarded by
    /// shifts along the way. A chunk that still overflows after one shift is
    /// split at the limit. Chunks accepted before a failure stay decoded.
    pub fn decode<B: InferenceBackend>(
        &mut self,
        backend: &mut B,
        window: &mut ContextWindow,
        tokens: &[TokenId],
        want_last_logit: bool,
    ) -> Result<u32, DecodeError> {
        tracing::debug!(
            "Decode {} tokens starting at position {}",
            tokens.len(),
            window.current_position()
        );

        let mut discarded = 0;
        let mut offset = 0;
        while offset < tokens.len() {
            let wanted = (tokens.len() - offset).min(self.chunk_size);
            if !window.has_room(wanted as u32) {
                tracing::warn!("Current batch won't fit into context! Shifting...");
                discarded += window.shift(backend)?;
            }

            // One shift may free less than a full chunk; decode what fits.
            let start = window.current_position();
            let room = window.limit().saturating_sub(start) as usize;
            let take = wanted.min(room);
            if take == 0 {
                continue;
            }

            self.chunk.clear();
            self.chunk.extend(
                tokens[offset..offset + take]
                    .iter()
                    .enumerate()
                    .map(|(j, token)| BatchToken {
                        token: *token,
                        position: start + j as u32,
                        wants_logits: want_last_logit && offset + j + 1 == tokens.len(),
                    }),
            );

            backend.decode(&self.chunk).map_err(|source| {
                tracing::error!("llama_decode failed at position {}: {}", start, source);
                DecodeError::Backend {
                    position: start,
                    source,
                }
            })?;
            window.advance(take as u32);
            offset += take;
        }

        Ok(discarded)
    }
}
