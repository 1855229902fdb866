//! llm-session - chat with a local GGUF model from the terminal
//!
//! Usage: `llm-session [model.gguf] [params.json]`
//!
//! Lines typed on stdin are sent as user turns. `/reset` starts a new
//! conversation, `/quit` exits.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llm_session::config;
use llm_session::llama::LlamaChat;
use llm_session::{StopReason, StreamToken, Turn};

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive("llm_session=info".parse()?))
        .init();

    info!("Starting llm-session v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args_os().skip(1);
    let model_path = args.next().map(PathBuf::from);
    let mut params = match args.next() {
        Some(path) => config::load_params_from(path)?,
        None => config::load_params(),
    };
    if model_path.is_some() {
        params.model_path = model_path;
    }

    let chat = LlamaChat::start(params)?;
    let info = chat.model_info();
    info!("Ready: {} ({} token window)", info.path, info.context_window);

    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush()?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/reset" => chat.reset()?,
            text => {
                for token in chat.prompt(vec![Turn::user(text)])? {
                    match token {
                        StreamToken::Token(fragment) => {
                            print!("{fragment}");
                            stdout.flush()?;
                        }
                        StreamToken::Done(reason) => {
                            println!();
                            if reason == StopReason::ContextExceeded {
                                eprintln!("context window is full, use /reset to start over");
                            }
                            break;
                        }
                        StreamToken::Error(e) => {
                            println!();
                            eprintln!("error: {e}");
                            break;
                        }
                    }
                }
            }
        }
        print!("> ");
        stdout.flush()?;
    }

    Ok(())
}
