//! Scripted backend for exercising the session without a model file.
//!
//! Tokenization is one token per whitespace separated word. Numeric words map
//! to their value, anything else maps to [`ScriptedBackend::WORD`]. Role
//! markers (`System:`, `User:`, `Assistant:`) produce no tokens so tests can
//! size prompts exactly. Decoded tokens are kept per position, which lets tests
//! check that a shift preserves content and ordering.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use crate::inference::backend::{
    BackendError, BatchToken, ContextParams, InferenceBackend, ModelSummary, SamplerParams,
    TokenId,
};

pub struct ScriptedBackend {
    pub model_loaded: bool,
    pub context: Option<ContextParams>,
    /// Tokens the sampler hands out, in order. Falls back to `FILLER` when empty.
    pub outputs: VecDeque<TokenId>,
    /// Byte pieces per token; unknown tokens render as `"t{id} "`.
    pub pieces: HashMap<TokenId, Vec<u8>>,
    pub decode_calls: Vec<Vec<BatchToken>>,
    pub removed: Vec<(u32, u32)>,
    pub shifted: Vec<(u32, u32, i32)>,
    pub memory_clears: usize,
    pub sampler_resets: usize,
    pub frees: Vec<&'static str>,
    pub fail_load: bool,
    pub fail_context: bool,
    /// Fails the decode call with this zero-based index.
    pub fail_decode_call: Option<usize>,
    resident: BTreeMap<u32, TokenId>,
    logits_ready: bool,
}

impl ScriptedBackend {
    pub const EOG: TokenId = TokenId(2);
    pub const WORD: TokenId = TokenId(7);
    pub const FILLER: TokenId = TokenId(9);

    pub fn new() -> Self {
        Self {
            model_loaded: false,
            context: None,
            outputs: VecDeque::new(),
            pieces: HashMap::new(),
            decode_calls: Vec::new(),
            removed: Vec::new(),
            shifted: Vec::new(),
            memory_clears: 0,
            sampler_resets: 0,
            frees: Vec::new(),
            fail_load: false,
            fail_context: false,
            fail_decode_call: None,
            resident: BTreeMap::new(),
            logits_ready: false,
        }
    }

    /// A backend with a model loaded and a context of `capacity` positions.
    pub fn with_context(capacity: u32) -> Self {
        let mut backend = Self::new();
        backend.model_loaded = true;
        backend.context = Some(ContextParams {
            capacity,
            batch_size: 1,
            threads: 2,
            sampler: SamplerParams {
                top_k: 40,
                top_p: 0.95,
                temperature: 0.7,
                seed: 0,
            },
        });
        backend
    }

    /// Queues tokens for the sampler, registering their byte pieces.
    pub fn script(&mut self, pieces: &[(i32, &[u8])]) {
        for (id, bytes) in pieces {
            self.outputs.push_back(TokenId(*id));
            self.pieces.insert(TokenId(*id), bytes.to_vec());
        }
    }

    pub fn token_at(&self, position: u32) -> Option<TokenId> {
        self.resident.get(&position).copied()
    }

    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    pub fn highest_position(&self) -> Option<u32> {
        self.resident.keys().next_back().copied()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load_model(&mut self, path: &Path) -> Result<ModelSummary, BackendError> {
        if self.fail_load {
            return Err(BackendError::ModelLoad("unsupported format".to_string()));
        }
        self.model_loaded = true;
        Ok(ModelSummary {
            path: path.to_path_buf(),
            vocab_size: 32,
            context_length: 2048,
            param_count: 1_000,
        })
    }

    fn create_context(&mut self, params: &ContextParams) -> Result<(), BackendError> {
        if !self.model_loaded {
            return Err(BackendError::NoModelLoaded);
        }
        if self.fail_context {
            return Err(BackendError::ContextCreate("out of memory".to_string()));
        }
        self.context = Some(params.clone());
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        Ok(text
            .split_whitespace()
            .filter(|word| !matches!(*word, "System:" | "User:" | "Assistant:"))
            .map(|word| word.parse::<i32>().map(TokenId).unwrap_or(Self::WORD))
            .collect())
    }

    fn decode(&mut self, batch: &[BatchToken]) -> Result<(), BackendError> {
        let call = self.decode_calls.len();
        self.decode_calls.push(batch.to_vec());
        if self.fail_decode_call == Some(call) {
            return Err(BackendError::Decode("llama_decode failed w/ 1".to_string()));
        }

        let capacity = self.context.as_ref().ok_or(BackendError::NoContext)?.capacity;
        for entry in batch {
            if entry.position >= capacity {
                return Err(BackendError::Decode(format!(
                    "position {} out of range",
                    entry.position
                )));
            }
            if self.resident.contains_key(&entry.position) {
                return Err(BackendError::Decode(format!(
                    "position {} already occupied",
                    entry.position
                )));
            }
        }
        for entry in batch {
            self.resident.insert(entry.position, entry.token);
        }
        self.logits_ready = batch.last().is_some_and(|entry| entry.wants_logits);
        Ok(())
    }

    fn sample(&mut self) -> Result<TokenId, BackendError> {
        if !self.logits_ready {
            return Err(BackendError::Decode("no logits for last token".to_string()));
        }
        Ok(self.outputs.pop_front().unwrap_or(Self::FILLER))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == Self::EOG
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        Ok(self
            .pieces
            .get(&token)
            .cloned()
            .unwrap_or_else(|| format!("t{} ", token.0).into_bytes()))
    }

    fn remove_positions(&mut self, start: u32, end: u32) -> Result<(), BackendError> {
        self.removed.push((start, end));
        self.resident.retain(|position, _| *position < start || *position >= end);
        Ok(())
    }

    fn shift_positions(&mut self, start: u32, end: u32, delta: i32) -> Result<(), BackendError> {
        self.shifted.push((start, end, delta));
        let moved: Vec<(u32, TokenId)> = self
            .resident
            .range(start..end)
            .map(|(position, token)| (*position, *token))
            .collect();
        for (position, _) in &moved {
            self.resident.remove(position);
        }
        for (position, token) in moved {
            let target = (position as i64 + delta as i64) as u32;
            if self.resident.insert(target, token).is_some() {
                return Err(BackendError::Memory(format!("position {target} collided")));
            }
        }
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.memory_clears += 1;
        self.resident.clear();
        self.logits_ready = false;
    }

    fn reset_sampler(&mut self) {
        self.sampler_resets += 1;
    }

    fn free_context(&mut self) {
        if self.context.take().is_some() {
            self.frees.push("sampler");
            self.frees.push("context");
        }
        self.resident.clear();
    }

    fn free_model(&mut self) {
        if self.model_loaded {
            self.frees.push("model");
        }
        self.model_loaded = false;
    }

    fn system_info(&self) -> String {
        "scripted backend".to_string()
    }
}
