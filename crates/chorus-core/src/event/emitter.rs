//! Single ordered event channel for one orchestration run.
//!
//! Built on `tokio::sync::mpsc::unbounded_channel`, so emitting never blocks
//! the run. Every envelope is stamped with a strictly increasing `seq`, and
//! stamping and sending happen under one lock so envelopes reach the
//! receiver in `seq` order even when parallel agents emit at once.
//! Emitting after the receiver is gone is a no-op: a caller that stopped
//! listening does not fail the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use chorus_types::event::{EventEnvelope, OrchestrationEvent};

/// Cloneable sender half of a run's event channel.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: Uuid,
    conversation_id: Uuid,
    sender: mpsc::UnboundedSender<EventEnvelope>,
    /// Next `seq` to stamp. Held while sending.
    seq: Arc<Mutex<u64>>,
    terminal_sent: Arc<AtomicBool>,
}

impl EventEmitter {
    /// Create an emitter and the receiver the calling layer drains.
    pub fn channel(
        run_id: Uuid,
        conversation_id: Uuid,
    ) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let emitter = Self {
            run_id,
            conversation_id,
            sender,
            seq: Arc::new(Mutex::new(0)),
            terminal_sent: Arc::new(AtomicBool::new(false)),
        };
        (emitter, receiver)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn lock_seq(&self) -> MutexGuard<'_, u64> {
        self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp and send an event.
    ///
    /// At most one terminal event is ever delivered; later ones are dropped.
    pub fn emit(&self, event: OrchestrationEvent) {
        let mut next = self.lock_seq();
        if event.is_terminal()
            && self
                .terminal_sent
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            tracing::warn!(kind = event.kind(), "dropping second terminal event");
            return;
        }

        let seq = *next;
        *next += 1;
        match &event {
            OrchestrationEvent::AgentChunk { agent_id, text } => {
                tracing::trace!(seq, agent_id = %agent_id, len = text.len(), "agent_chunk");
            }
            other => tracing::debug!(seq, kind = other.kind(), "event"),
        }

        let envelope = EventEnvelope {
            run_id: self.run_id,
            conversation_id: self.conversation_id,
            seq,
            at: Utc::now(),
            event,
        };
        // Receiver dropped: nobody is listening any more.
        let _ = self.sender.send(envelope);
    }

    /// Whether a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("run_id", &self.run_id)
            .field("seq", &*self.lock_seq())
            .finish()
    }
}
