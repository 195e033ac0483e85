//! aichat - terminal chat over a local GGUF model
//!
//! Ctrl-C stops the reply being streamed; `/quit` or end of input exits.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aichat::config::{load_settings, save_settings, settings_path, RuntimeSettings};
use aichat::inference::{ChatEngine, EngineError, StopHandle, StreamToken};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the GGUF model file
    #[arg(short, long)]
    model: PathBuf,

    /// System prompt that opens the conversation
    #[arg(short, long, default_value = "You are a helpful assistant.")]
    system: String,

    /// Maximum tokens generated per reply (overrides the settings file)
    #[arg(short = 'n', long)]
    max_tokens: Option<u32>,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to load dynamic ggml backends from
    #[arg(long)]
    backend_path: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let directive: Directive = "aichat=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(directive))
        .init();

    info!("Starting aichat v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref());
    if let Some(max_tokens) = args.max_tokens {
        settings.max_new_tokens = max_tokens.max(1);
    }
    if args.backend_path.is_some() {
        settings.backend_path = args.backend_path.clone();
    }
    if args.save_config {
        let saved = settings_path(args.config.as_deref())
            .and_then(|path| save_settings(&settings, &path).map(|()| path));
        match saved {
            Ok(path) => info!("Settings written to {}", path.display()),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let mut engine = ChatEngine::new();
    if let Err(e) = engine.init(settings.engine_options()) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    let stop = engine.stop_handle();
    tokio::spawn(forward_interrupts(stop));

    let repl = tokio::task::spawn_blocking(move || run(engine, &args, &settings));
    match repl.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: chat loop panicked: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Turns every Ctrl-C into a stop request for the streaming reply.
async fn forward_interrupts(stop: StopHandle) {
    while tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received, stopping generation");
        stop.stop();
    }
}

fn run(mut engine: ChatEngine, args: &Args, settings: &RuntimeSettings) -> Result<(), EngineError> {
    let model = engine.load_model(&args.model)?;
    engine.prepare_session()?;
    engine.set_system_prompt(&args.system)?;
    info!(
        "Ready: {} (context {} of {} trained)",
        model.path.display(),
        settings.context_size,
        model.context_length
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = stdout.flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        }

        let input = line.trim();
        let result = match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => engine
                .reset_conversation()
                .and_then(|()| engine.set_system_prompt(&args.system))
                .map(|()| println!("(conversation reset)")),
            "/info" => engine.system_info().map(|info| println!("{info}")),
            _ if input.starts_with("/system ") => engine
                .set_system_prompt(input.trim_start_matches("/system ").trim())
                .map(|()| println!("(system prompt replaced)")),
            _ => stream_reply(&engine, input, settings.max_new_tokens, &mut stdout),
        };
        // Session errors end the command, not the program.
        if let Err(e) = result {
            eprintln!("error: {e}");
        }
    }

    engine.unload()?;
    Ok(())
}

fn stream_reply(
    engine: &ChatEngine,
    input: &str,
    max_new_tokens: u32,
    stdout: &mut io::Stdout,
) -> Result<(), EngineError> {
    for token in engine.submit_turn(input, max_new_tokens)? {
        match token {
            StreamToken::Token(text) => {
                print!("{text}");
                let _ = stdout.flush();
            }
            StreamToken::Done => break,
            StreamToken::Error(message) => {
                println!();
                eprintln!("error: {message}");
                return Ok(());
            }
        }
    }
    println!();
    Ok(())
}
