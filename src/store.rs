//! Per-client conversation state.
//!
//! ## Design
//! - Two keyed tables behind one mutex: in-flight generations and histories.
//! - Per client, the generation slot is a two-state machine:
//!   `Idle` → `Generating` on [`ConversationStore::begin`],
//!   `Generating` → `Idle` on [`ConversationStore::finish`] or pre-emption.
//! - `begin` cancels any previous generation and registers the new one under
//!   a single lock acquisition, so at most one generation per client is ever
//!   registered.
//! - The lock is never held across an `.await`.
//!
//! Entries live for the process lifetime; nothing is evicted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::{ClientId, Turn};

/// Observable state of a client's generation slot.
#[derive(Debug, Clone)]
pub enum GenerationState {
    Idle,
    Generating {
        generation: u64,
        cancel: CancellationToken,
    },
}

impl GenerationState {
    pub fn is_generating(&self) -> bool {
        matches!(self, GenerationState::Generating { .. })
    }
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Tables {
    in_flight: HashMap<ClientId, InFlight>,
    histories: HashMap<ClientId, Vec<Turn>>,
    next_generation: u64,
}

/// What [`ConversationStore::begin`] hands back to the caller that now owns
/// the client's slot.
#[derive(Debug)]
pub struct Registration {
    /// Identifies this generation when finishing it.
    pub generation: u64,
    /// Fires when a newer question supersedes this one.
    pub cancel: CancellationToken,
    /// Prior history followed by the new user turn.
    pub turns: Vec<Turn>,
    /// Generation number that was cancelled to make room, if any.
    pub preempted: Option<u64>,
}

/// In-memory owner of every client's history and in-flight generation.
#[derive(Debug, Default)]
pub struct ConversationStore {
    tables: Mutex<Tables>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `client`'s generation slot for a new question.
    ///
    /// Cancels and unregisters whatever was in flight, snapshots the history
    /// plus the new user turn, and registers a fresh cancellation handle.
    pub fn begin(&self, client: &ClientId, question: &str) -> Registration {
        let mut tables = self.lock();

        let preempted = tables.in_flight.remove(client).map(|previous| {
            previous.cancel.cancel();
            previous.generation
        });

        let mut turns = tables.histories.get(client).cloned().unwrap_or_default();
        turns.push(Turn::user(question));

        tables.next_generation += 1;
        let generation = tables.next_generation;
        let cancel = CancellationToken::new();
        tables.in_flight.insert(
            client.clone(),
            InFlight {
                generation,
                cancel: cancel.clone(),
            },
        );

        Registration {
            generation,
            cancel,
            turns,
            preempted,
        }
    }

    /// Release `client`'s slot if `generation` still holds it.
    ///
    /// When it does, the optional exchange (user turn, assistant turn) is
    /// appended to the history and the slot returns to idle. When a newer
    /// generation has taken over, nothing is touched and `false` is returned.
    pub fn finish(
        &self,
        client: &ClientId,
        generation: u64,
        exchange: Option<(Turn, Turn)>,
    ) -> bool {
        let mut tables = self.lock();

        let current = tables
            .in_flight
            .get(client)
            .is_some_and(|f| f.generation == generation);
        if !current {
            return false;
        }

        tables.in_flight.remove(client);
        if let Some((question, answer)) = exchange {
            let history = tables.histories.entry(client.clone()).or_default();
            history.push(question);
            history.push(answer);
        }
        true
    }

    pub fn state(&self, client: &ClientId) -> GenerationState {
        match self.lock().in_flight.get(client) {
            Some(f) => GenerationState::Generating {
                generation: f.generation,
                cancel: f.cancel.clone(),
            },
            None => GenerationState::Idle,
        }
    }

    /// Snapshot of `client`'s transcript.
    pub fn history(&self, client: &ClientId) -> Vec<Turn> {
        self.lock().histories.get(client).cloned().unwrap_or_default()
    }

    /// Number of clients with a generation in flight.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Number of clients with a recorded transcript.
    pub fn client_count(&self) -> usize {
        self.lock().histories.len()
    }

    /// Clients with a recorded transcript, sorted.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self.lock().histories.keys().cloned().collect();
        clients.sort();
        clients
    }
}
