//! llama.cpp binding
//!
//! [`LlamaCppBackend`] implements [`InferenceBackend`] on top of `llama-cpp-2`.
//! The llama types hold raw pointers and are not `Send`; keep a backend on the
//! thread that created it (see [`crate::inference::engine`]).
//!
//! llama.cpp itself is initialized once per process and stays up until the
//! process exits; freeing a backend releases only its sampler, context and
//! model.

use std::ffi::{CStr, CString};
use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::backend::{
    BackendError, BatchToken, ContextParams, InferenceBackend, ModelSummary, SamplerParams,
    TokenId,
};
use crate::inference::model::inspect_model_file;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Initializes llama.cpp once per process and returns the shared handle.
///
/// Dynamic ggml backends are loaded from `backend_path` on the first call only.
fn shared_backend(backend_path: Option<&Path>) -> Result<&'static LlamaBackend, BackendError> {
    BACKEND.get_or_try_init(|| {
        if let Some(dir) = backend_path {
            load_backend_plugins(dir)?;
        }
        llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default());
        let backend = LlamaBackend::init().map_err(|e| {
            tracing::error!("Failed to init backend: {}", e);
            BackendError::NotInitialized
        })?;
        tracing::info!("LlamaBackend initialized");
        Ok(backend)
    })
}

fn load_backend_plugins(dir: &Path) -> Result<(), BackendError> {
    let path = CString::new(dir.to_string_lossy().as_bytes()).map_err(|_| {
        BackendError::ModelLoad(format!("invalid backend path: {}", dir.display()))
    })?;
    tracing::info!("Loading ggml backends from {}", dir.display());
    // SAFETY: `path` is a valid NUL-terminated string that outlives the call.
    unsafe { llama_cpp_sys_2::ggml_backend_load_all_from_path(path.as_ptr()) };
    Ok(())
}

/// llama.cpp backend for a single sequence.
///
/// Field order is drop order: sampler, then context, then model. The context
/// borrows the boxed model, which must outlive it. The decode batch is
/// allocated with the context and reused for every call.
pub struct LlamaCppBackend {
    sampler: Option<LlamaSampler>,
    batch: Option<LlamaBatch<'static>>,
    batch_capacity: usize,
    context: Option<LlamaContext<'static>>,
    model: Option<Box<LlamaModel>>,
    backend: &'static LlamaBackend,
    gpu_layers: u32,
    /// Batch index of the entry whose logits the next sample reads
    logits_index: Option<i32>,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp (idempotent) and returns an empty backend.
    pub fn init(backend_path: Option<&Path>) -> Result<Self, BackendError> {
        let backend = shared_backend(backend_path)?;
        Ok(Self {
            sampler: None,
            batch: None,
            batch_capacity: 0,
            context: None,
            model: None,
            backend,
            gpu_layers: 0,
            logits_index: None,
        })
    }

    /// Layers to offload to the GPU for models loaded afterwards.
    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }

    fn model(&self) -> Result<&LlamaModel, BackendError> {
        self.model.as_deref().ok_or(BackendError::NoModelLoaded)
    }

    fn context_mut(&mut self) -> Result<&mut LlamaContext<'static>, BackendError> {
        self.context.as_mut().ok_or(BackendError::NoContext)
    }
}

fn build_sampler(params: &SamplerParams) -> LlamaSampler {
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(params.seed),
    ])
}

impl InferenceBackend for LlamaCppBackend {
    fn load_model(&mut self, path: &Path) -> Result<ModelSummary, BackendError> {
        inspect_model_file(path).map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        self.free_context();
        self.free_model();

        let params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(self.backend, path, &params)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        let summary = ModelSummary {
            path: path.to_path_buf(),
            vocab_size: model.n_vocab(),
            context_length: model.n_ctx_train(),
            param_count: model.n_params(),
        };
        self.model = Some(Box::new(model));
        Ok(summary)
    }

    fn create_context(&mut self, params: &ContextParams) -> Result<(), BackendError> {
        self.free_context();

        let model = self.model.as_deref().ok_or(BackendError::NoModelLoaded)?;
        // SAFETY: the model is boxed, so its address is stable, and every path
        // that drops it (free_model, Drop field order) drops the context first.
        let model: &'static LlamaModel = unsafe { &*(model as *const LlamaModel) };

        let threads = params.threads as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.capacity))
            .with_n_batch(params.batch_size)
            .with_n_ubatch(params.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = model
            .new_context(self.backend, ctx_params)
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;

        tracing::debug!(
            "Context created: n_ctx={} n_batch={} threads={}",
            params.capacity,
            params.batch_size,
            params.threads
        );
        self.context = Some(context);
        self.batch_capacity = params.batch_size.max(1) as usize;
        self.batch = Some(LlamaBatch::new(self.batch_capacity, 1));
        self.sampler = Some(build_sampler(&params.sampler));
        self.logits_index = None;
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let tokens = self
            .model()?
            .str_to_token(text, AddBos::Always)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| TokenId(t.0)).collect())
    }

    fn decode(&mut self, batch: &[BatchToken]) -> Result<(), BackendError> {
        if self.context.is_none() {
            return Err(BackendError::NoContext);
        }
        if batch.len() > self.batch_capacity {
            tracing::debug!(
                "Growing decode batch from {} to {} tokens",
                self.batch_capacity,
                batch.len()
            );
            self.batch_capacity = batch.len();
            self.batch = Some(LlamaBatch::new(self.batch_capacity, 1));
        }
        let llama_batch = self.batch.as_mut().ok_or(BackendError::NoContext)?;
        llama_batch.clear();

        let mut logits_index = None;
        for (i, entry) in batch.iter().enumerate() {
            llama_batch
                .add(
                    LlamaToken(entry.token.0),
                    entry.position as i32,
                    &[0],
                    entry.wants_logits,
                )
                .map_err(|e| BackendError::Decode(format!("Failed to add token to batch: {e}")))?;
            if entry.wants_logits {
                logits_index = Some(i as i32);
            }
        }

        self.context
            .as_mut()
            .ok_or(BackendError::NoContext)?
            .decode(llama_batch)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        self.logits_index = logits_index;
        Ok(())
    }

    fn sample(&mut self) -> Result<TokenId, BackendError> {
        let index = self
            .logits_index
            .ok_or_else(|| BackendError::Decode("no logits for last token".to_string()))?;
        let context = self.context.as_ref().ok_or(BackendError::NoContext)?;
        let sampler = self.sampler.as_mut().ok_or(BackendError::NoContext)?;

        // `sample` also accepts the token into the chain.
        let token = sampler.sample(context, index);
        Ok(TokenId(token.0))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model
            .as_deref()
            .is_some_and(|model| model.is_eog_token(LlamaToken(token.0)))
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.model()?
            .token_to_bytes(LlamaToken(token.0), Special::Tokenize)
            .map_err(|e| BackendError::Detokenize(e.to_string()))
    }

    fn remove_positions(&mut self, start: u32, end: u32) -> Result<(), BackendError> {
        let removed = self
            .context_mut()?
            .clear_kv_cache_seq(Some(0), Some(start), Some(end))
            .map_err(|e| BackendError::Memory(e.to_string()))?;
        if removed {
            Ok(())
        } else {
            Err(BackendError::Memory(format!(
                "could not remove positions [{start}, {end})"
            )))
        }
    }

    fn shift_positions(&mut self, start: u32, end: u32, delta: i32) -> Result<(), BackendError> {
        self.context_mut()?
            .kv_cache_seq_add(0, Some(start), Some(end), delta)
            .map_err(|e| BackendError::Memory(e.to_string()))
    }

    fn clear_memory(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.clear_kv_cache();
        }
        self.logits_index = None;
    }

    fn reset_sampler(&mut self) {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }
    }

    fn free_context(&mut self) {
        if self.sampler.take().is_some() {
            tracing::debug!("Sampler freed");
        }
        self.batch = None;
        self.batch_capacity = 0;
        if self.context.take().is_some() {
            tracing::debug!("Context freed");
        }
        self.logits_index = None;
    }

    fn free_model(&mut self) {
        self.free_context();
        if self.model.take().is_some() {
            tracing::debug!("Model freed");
        }
    }

    fn system_info(&self) -> String {
        // SAFETY: llama.cpp returns a pointer to a static NUL-terminated buffer.
        let features = unsafe { CStr::from_ptr(llama_cpp_sys_2::llama_print_system_info()) }
            .to_string_lossy()
            .into_owned();
        format!(
            "{}\nGPU offload: {}, mmap: {}, mlock: {}",
            features.trim_end(),
            self.backend.supports_gpu_offload(),
            self.backend.supports_mmap(),
            self.backend.supports_mlock()
        )
    }
}
