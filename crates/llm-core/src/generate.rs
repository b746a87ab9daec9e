//! Streaming generation over an async channel.

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Engine;
use crate::session::{Session, TokenEvent};

/// Events emitted while a generation turn runs.
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    /// A new text piece was decoded.
    Token(String),
    /// Generation finished and the assistant message is committed.
    Done {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An error occurred; the rendered error message.
    Error(String),
}

/// Run one turn of `session` to completion, forwarding events over `tx`.
///
/// This is intended to be called inside `tokio::task::spawn_blocking`,
/// with the receiver consumed on the async side. The function returns
/// when generation finishes, fails, or the receiver is dropped. A
/// dropped receiver cancels the turn mid-decode and leaves the session
/// with the turn still open; reset the session before reusing it.
pub fn generate_events<E: Engine>(
    session: &mut Session<E>,
    user_text: &str,
    tx: mpsc::Sender<GenerateEvent>,
) {
    if let Err(err) = session.send(user_text) {
        let _ = tx.blocking_send(GenerateEvent::Error(err.to_string()));
        return;
    }

    loop {
        match session.next_token() {
            Ok(TokenEvent::Piece(piece)) => {
                if tx.blocking_send(GenerateEvent::Token(piece)).is_err() {
                    debug!("Generation cancelled (receiver dropped)");
                    return;
                }
            }
            Ok(TokenEvent::Done(completion)) => {
                let _ = tx.blocking_send(GenerateEvent::Done {
                    prompt_tokens: completion.prompt_tokens,
                    completion_tokens: completion.completion_tokens,
                });
                return;
            }
            Err(err) => {
                let _ = tx.blocking_send(GenerateEvent::Error(err.to_string()));
                return;
            }
        }
    }
}
