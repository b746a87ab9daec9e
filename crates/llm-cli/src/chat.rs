use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use llm_core::{GenerateEvent, SamplingParams, Session, SessionConfig, StubEngine, generate_events};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::Cli;

fn default_replies() -> Vec<String> {
    [
        "Hello! This reply comes from the stub engine's built-in script.",
        "Each turn drains one canned reply; pass --script to supply your own.",
        "Once the script runs out, every turn ends immediately.",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn load_script(args: &Cli) -> anyhow::Result<Vec<String>> {
    match &args.script {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading script {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing script {}", path.display()))
        }
        None => Ok(default_replies()),
    }
}

pub async fn execute(args: Cli) -> anyhow::Result<()> {
    let replies = load_script(&args)?;
    info!(replies = replies.len(), "Starting scripted chat session");

    let engine = StubEngine::scripted(replies);
    let config = SessionConfig {
        n_ctx: args.ctx_size,
        sampling: SamplingParams {
            temperature: args.temp,
            min_p: args.min_p,
            seed: args.seed,
        },
        system_prompt: args.system.clone(),
    };
    let mut session = Session::new(engine, config);
    session.load_model(&args.model)?;
    let session = Arc::new(Mutex::new(session));

    println!("Session ready. Type your message, or /help for commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if !run_command(command, &session)? {
                break;
            }
            continue;
        }

        let (tx, mut rx) = mpsc::channel(64);

        // Move the shared session into the blocking task for this turn.
        let session_clone = session.clone();
        let prompt = line.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = session_clone.lock().unwrap();
            generate_events(&mut guard, &prompt, tx);
        });

        while let Some(event) = rx.recv().await {
            match event {
                GenerateEvent::Token(piece) => {
                    print!("{piece}");
                    stdout.flush()?;
                }
                GenerateEvent::Done {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    println!();
                    eprintln!("  [prompt: {prompt_tokens} tok, gen: {completion_tokens} tok]");
                }
                GenerateEvent::Error(err) => {
                    eprintln!("\nError: {err}");
                    if session.lock().unwrap().poisoned().is_some() {
                        eprintln!("The session can no longer generate; /clear to recover.");
                    }
                }
            }
        }

        println!();
    }

    Ok(())
}

/// Handle a slash command; returns `false` when the loop should exit.
fn run_command(command: &str, session: &Arc<Mutex<Session<StubEngine>>>) -> anyhow::Result<bool> {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some("help") => {
            println!("Commands:");
            println!("  /help         show this help");
            println!("  /clear        reset the conversation");
            println!("  /save <file>  write the transcript as JSON");
            println!("  /exit         quit");
        }
        Some("clear") => {
            session.lock().unwrap().reset();
            println!("Conversation cleared.");
        }
        Some("save") => match parts.next() {
            Some(path) => {
                let guard = session.lock().unwrap();
                let json = serde_json::to_string_pretty(guard.messages())?;
                std::fs::write(path, json).with_context(|| format!("writing {path}"))?;
                println!("Transcript saved to {path}");
            }
            None => eprintln!("Usage: /save <file>"),
        },
        Some("exit") | Some("quit") => return Ok(false),
        _ => eprintln!("Unknown command: /{command} (try /help)"),
    }
    Ok(true)
}
