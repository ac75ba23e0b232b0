//! A session on its own thread.
//!
//! Completions block for as long as generation runs, so callers that must
//! stay responsive move the [`Session`] into a [`SessionActor`] and talk to
//! it over channels.
//!
//! ```text
//! ┌─────────────┐      Command       ┌──────────────────┐
//! │   Caller     │ ─────────────────> │  Session actor   │
//! │              │ <───────────────── │  (own thread)    │
//! └─────────────┘       Event        │  owns: Session   │
//!                                     └──────────────────┘
//! ```
//!
//! # Token batching
//!
//! Streamed text is buffered and emitted every 10 pieces or 50ms, whichever
//! comes first, so fast models do not flood the event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::CompletionParams;
use crate::engine::{CompletionResult, InterruptHandle};
use crate::error::{CactusError, Result};
use crate::session::Session;

/// Maximum streamed pieces to buffer before emitting.
const TOKEN_BATCH_SIZE: usize = 10;

/// Maximum time to buffer streamed text before emitting (milliseconds).
const TOKEN_BATCH_INTERVAL_MS: u64 = 50;

/// Commands sent to the actor.
#[derive(Debug)]
pub enum ActorCommand {
    Complete(Box<CompletionParams>),
    Rewind,
    Shutdown,
}

/// Events sent back by the actor.
#[derive(Debug, Clone)]
pub enum ActorEvent {
    /// Streamed text, possibly several tokens' worth.
    Token(String),
    Done(Box<CompletionResult>),
    Error(String),
    /// The actor released its session and exited.
    Stopped,
}

/// Handle to a session running on a dedicated thread.
pub struct SessionActor {
    cmd_tx: Sender<ActorCommand>,
    event_rx: Receiver<ActorEvent>,
    interrupt: InterruptHandle,
    shutting_down: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionActor {
    /// Move `session` onto a new thread.
    pub fn spawn(session: Session) -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<ActorCommand>(16);
        let (event_tx, event_rx) = bounded::<ActorEvent>(256);
        let interrupt = session.interrupt_handle();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let flag = shutting_down.clone();
        let thread = thread::Builder::new()
            .name("cactus-session".into())
            .spawn(move || actor_loop(session, cmd_rx, event_tx, flag))
            .map_err(CactusError::Thread)?;

        Ok(SessionActor {
            cmd_tx,
            event_rx,
            interrupt,
            shutting_down,
            thread: Some(thread),
        })
    }

    /// Queue a completion.
    pub fn complete(&self, params: CompletionParams) -> Result<()> {
        self.cmd_tx
            .send(ActorCommand::Complete(Box::new(params)))
            .map_err(|_| CactusError::ActorClosed)
    }

    /// Queue a rewind.
    pub fn rewind(&self) -> Result<()> {
        self.cmd_tx
            .send(ActorCommand::Rewind)
            .map_err(|_| CactusError::ActorClosed)
    }

    /// Stop the running completion. Queued commands still run.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn try_recv(&self) -> Option<ActorEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv(&self) -> Option<ActorEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ActorEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Interrupt, skip queued completions, release the session and join.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shutting_down.store(true, Ordering::Release);
        self.interrupt.interrupt();

        // The actor may be blocked on a full event channel; keep draining.
        loop {
            match self.cmd_tx.try_send(ActorCommand::Shutdown) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(_)) => {
                    let _ = self.event_rx.recv_timeout(Duration::from_millis(10));
                }
            }
        }
        while !thread.is_finished() {
            let _ = self.event_rx.recv_timeout(Duration::from_millis(10));
        }
        let _ = thread.join();
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn actor_loop(
    mut session: Session,
    cmd_rx: Receiver<ActorCommand>,
    event_tx: Sender<ActorEvent>,
    shutting_down: Arc<AtomicBool>,
) {
    let id = session.id();
    debug!(session = %id, "session actor started");
    loop {
        match cmd_rx.recv() {
            Ok(ActorCommand::Complete(params)) => {
                if shutting_down.load(Ordering::Acquire) {
                    debug!(session = %id, "skipping queued completion during shutdown");
                    continue;
                }
                run_completion(&mut session, &params, &event_tx);
            }

            Ok(ActorCommand::Rewind) => {
                if let Err(e) = session.rewind() {
                    warn!(session = %id, error = %e, "rewind failed");
                    let _ = event_tx.send(ActorEvent::Error(e.to_string()));
                }
            }

            Ok(ActorCommand::Shutdown) | Err(_) => break,
        }
    }

    session.release();
    debug!(session = %id, "session actor stopped");
    let _ = event_tx.send(ActorEvent::Stopped);
}

/// Run one completion, batching streamed text into events.
fn run_completion(session: &mut Session, params: &CompletionParams, event_tx: &Sender<ActorEvent>) {
    let mut buffer = String::new();
    let mut pieces = 0usize;
    let mut last_emit = Instant::now();

    let result = session.completion(params, |text| {
        buffer.push_str(text);
        pieces += 1;

        let should_emit = pieces >= TOKEN_BATCH_SIZE
            || last_emit.elapsed() >= Duration::from_millis(TOKEN_BATCH_INTERVAL_MS);
        if should_emit && !buffer.is_empty() {
            let _ = event_tx.send(ActorEvent::Token(std::mem::take(&mut buffer)));
            pieces = 0;
            last_emit = Instant::now();
        }
        true
    });

    if !buffer.is_empty() {
        let _ = event_tx.send(ActorEvent::Token(buffer));
    }

    let event = match result {
        Ok(result) => ActorEvent::Done(Box::new(result)),
        Err(e) => ActorEvent::Error(e.to_string()),
    };
    let _ = event_tx.send(event);
}
