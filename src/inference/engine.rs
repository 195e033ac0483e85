//! Chat engine
//!
//! Runs a [`Session`] on a dedicated worker thread and exposes it through
//! channels.
//!
//! # Architecture
//!
//! The llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) hold
//! raw pointers and are not `Send`, so the backend is created on the worker
//! thread and never leaves it. Blocking operations reply on a one-shot channel;
//! a user turn streams [`StreamToken`]s. Cancellation goes through a shared
//! [`StopHandle`] the worker checks between generation steps.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::inference::backend::{BackendError, InferenceBackend, ModelSummary};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::session::{Session, SessionConfig, SessionError};
use crate::inference::streaming::{Fragment, StreamToken};

/// Errors that can occur while talking to the engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything needed to start an engine over llama.cpp
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Directory holding dynamic ggml backends
    pub backend_path: Option<PathBuf>,
    /// Layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    pub session: SessionConfig,
}

/// Cancels the turn being streamed. Cheap to clone and safe to share.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

type Reply<T> = Sender<Result<T, EngineError>>;

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        response_tx: Reply<ModelSummary>,
    },
    PrepareSession {
        response_tx: Reply<()>,
    },
    SetSystemPrompt {
        text: String,
        response_tx: Reply<()>,
    },
    SubmitTurn {
        text: String,
        max_new_tokens: u32,
        token_tx: Sender<StreamToken>,
    },
    Reset {
        response_tx: Reply<()>,
    },
    Unload {
        response_tx: Reply<()>,
    },
    SystemInfo {
        response_tx: Reply<String>,
    },
    Shutdown,
}

/// Chat engine owning one session on a worker thread
pub struct ChatEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    stop: StopHandle,
    /// Cached model info (updated after load)
    model_info: Option<ModelSummary>,
}

impl ChatEngine {
    /// Creates an engine with no worker running
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            stop: StopHandle::default(),
            model_info: None,
        }
    }

    /// Starts the worker over llama.cpp. Calling it again is a no-op.
    pub fn init(&mut self, options: EngineOptions) -> Result<(), EngineError> {
        let EngineOptions {
            backend_path,
            gpu_layers,
            session,
        } = options;
        self.start(
            move || {
                LlamaCppBackend::init(backend_path.as_deref())
                    .map(|backend| backend.with_gpu_layers(gpu_layers))
            },
            session,
        )
    }

    /// Starts the worker over any backend.
    ///
    /// `factory` runs on the worker thread, so the backend itself never has to
    /// be `Send`.
    pub fn start<B, F>(&mut self, factory: F, config: SessionConfig) -> Result<(), EngineError>
    where
        B: InferenceBackend + 'static,
        F: FnOnce() -> Result<B, BackendError> + Send + 'static,
    {
        if self.command_tx.is_some() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), EngineError>>();
        let stop = self.stop.clone();

        let handle = thread::Builder::new()
            .name("aichat-worker".to_string())
            .spawn(move || match factory() {
                Ok(backend) => {
                    let _ = ready_tx.send(Ok(()));
                    worker_thread_main(Session::new(backend, config), command_rx, stop);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
                }
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;
        if let Err(e) = ready {
            let _ = handle.join();
            tracing::error!("Engine failed to start: {}", e);
            return Err(e);
        }

        self.command_tx = Some(command_tx);
        self.worker_handle = Some(handle);
        tracing::info!("ChatEngine worker thread started");
        Ok(())
    }

    /// Returns true once the worker is running
    pub fn is_initialized(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<&ModelSummary> {
        self.model_info.as_ref()
    }

    /// A handle that cancels the turn currently streaming
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or(EngineError::NotInitialized)?
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Sends a command and blocks until the worker replies
    fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> Result<T, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(command(response_tx))?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    pub fn load_model<P: AsRef<Path>>(&mut self, path: P) -> Result<ModelSummary, EngineError> {
        let path = path.as_ref().to_path_buf();
        let summary = self.request(|response_tx| WorkerCommand::LoadModel { path, response_tx })?;
        self.model_info = Some(summary.clone());
        Ok(summary)
    }

    pub fn prepare_session(&self) -> Result<(), EngineError> {
        self.request(|response_tx| WorkerCommand::PrepareSession { response_tx })
    }

    pub fn set_system_prompt(&self, text: &str) -> Result<(), EngineError> {
        let text = text.to_string();
        self.request(|response_tx| WorkerCommand::SetSystemPrompt { text, response_tx })
    }

    /// Submits a user turn and returns the stream of its reply.
    ///
    /// The stream ends with [`StreamToken::Done`] or [`StreamToken::Error`].
    pub fn submit_turn(
        &self,
        text: &str,
        max_new_tokens: u32,
    ) -> Result<Receiver<StreamToken>, EngineError> {
        let (token_tx, token_rx) = mpsc::channel();
        self.stop.clear();
        self.send(WorkerCommand::SubmitTurn {
            text: text.to_string(),
            max_new_tokens,
            token_tx,
        })?;
        Ok(token_rx)
    }

    pub fn reset_conversation(&self) -> Result<(), EngineError> {
        self.request(|response_tx| WorkerCommand::Reset { response_tx })
    }

    /// Frees the model and its context. The worker keeps running.
    pub fn unload(&mut self) -> Result<(), EngineError> {
        self.request(|response_tx| WorkerCommand::Unload { response_tx })?;
        self.model_info = None;
        Ok(())
    }

    pub fn system_info(&self) -> Result<String, EngineError> {
        self.request(|response_tx| WorkerCommand::SystemInfo { response_tx })
    }
}

impl Default for ChatEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        // A turn still streaming ends at its next step.
        self.stop.stop();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the session and processes commands until shutdown.
fn worker_thread_main<B: InferenceBackend>(
    mut session: Session<B>,
    command_rx: Receiver<WorkerCommand>,
    stop: StopHandle,
) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel { path, response_tx }) => {
                let _ = response_tx.send(session.load_model(&path).map_err(Into::into));
            }
            Ok(WorkerCommand::PrepareSession { response_tx }) => {
                let _ = response_tx.send(session.prepare_session().map_err(Into::into));
            }
            Ok(WorkerCommand::SetSystemPrompt { text, response_tx }) => {
                let _ = response_tx.send(session.set_system_prompt(&text).map_err(Into::into));
            }
            Ok(WorkerCommand::SubmitTurn {
                text,
                max_new_tokens,
                token_tx,
            }) => {
                stream_turn(&mut session, &text, max_new_tokens, &token_tx, &stop);
            }
            Ok(WorkerCommand::Reset { response_tx }) => {
                session.reset_conversation();
                let _ = response_tx.send(Ok(()));
            }
            Ok(WorkerCommand::Unload { response_tx }) => {
                session.unload();
                let _ = response_tx.send(Ok(()));
            }
            Ok(WorkerCommand::SystemInfo { response_tx }) => {
                let _ = response_tx.send(Ok(session.system_info()));
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
    session.unload();
}

/// Ingests one user turn and streams the reply until it ends.
fn stream_turn<B: InferenceBackend>(
    session: &mut Session<B>,
    text: &str,
    max_new_tokens: u32,
    tx: &Sender<StreamToken>,
    stop: &StopHandle,
) {
    if let Err(e) = session.submit_user_turn(text, max_new_tokens) {
        let _ = tx.send(StreamToken::Error(e.to_string()));
        return;
    }

    loop {
        if stop.is_stopped() {
            tracing::debug!("Generation stopped by user");
            session.stop_generation();
        }

        match session.generate_next_token() {
            Ok(Fragment::Text(fragment)) => {
                if tx.send(StreamToken::Token(fragment)).is_err() {
                    tracing::debug!("Receiver dropped, stopping generation");
                    session.stop_generation();
                }
            }
            Ok(Fragment::Pending) => {}
            Ok(Fragment::EndOfTurn) => {
                let _ = tx.send(StreamToken::Done);
                break;
            }
            Err(e) => {
                let _ = tx.send(StreamToken::Error(e.to_string()));
                break;
            }
        }
    }
}
