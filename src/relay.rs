//! Conversation relay: one in-flight generation per client.
//!
//! [`Relay::handle_question`] claims the client's slot in the
//! [`ConversationStore`] (cancelling whatever was running), streams the
//! generator's fragments to the caller's sink, and records the exchange when
//! it still owns the slot at the end. The newest question always wins.
//!
//! Event framing per call is always `ThinkingStarted`, fragments,
//! `ThinkingStopped`, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::StreamEvent;
use crate::generation::Generator;
use crate::store::ConversationStore;
use crate::tokens::{count_tokens, fit_context};
use crate::{ClientId, Turn};

/// Fragment sent in place of an answer when generation fails.
pub const FALLBACK_MESSAGE: &str = "I'm sorry, I couldn't understand that.";

/// Where the relay writes events for one request.
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pause between `ThinkingStarted` and the generation call.
    pub think_delay: Duration,
    /// Longest wait for the next fragment before the generation is abandoned.
    pub idle_timeout: Duration,
    /// Token budget for the outbound turn list; `None` sends full history.
    pub max_context_tokens: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            think_delay: Duration::ZERO,
            idle_timeout: Duration::from_secs(30),
            max_context_tokens: None,
        }
    }
}

/// How a call to [`Relay::handle_question`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The generator finished; the exchange was recorded.
    Completed,
    /// The generator failed; the fallback answer was recorded.
    Failed,
    /// No fragment within the idle timeout; handled like a failure.
    TimedOut,
    /// A newer question for the same client took over; nothing recorded.
    Superseded,
    /// The event sink closed (client went away); nothing recorded.
    Disconnected,
}

impl RelayOutcome {
    /// Whether this outcome writes the exchange into history.
    pub fn records_history(&self) -> bool {
        matches!(
            self,
            RelayOutcome::Completed | RelayOutcome::Failed | RelayOutcome::TimedOut
        )
    }
}

impl std::fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Failed => "failed",
            RelayOutcome::TimedOut => "timed_out",
            RelayOutcome::Superseded => "superseded",
            RelayOutcome::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone)]
pub struct Relay {
    store: Arc<ConversationStore>,
    generator: Arc<dyn Generator>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        store: Arc<ConversationStore>,
        generator: Arc<dyn Generator>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.generator.model()
    }

    /// Answer `question` for `client`, writing events to `sink`.
    ///
    /// `question` must already be non-empty after trimming. Dropping the
    /// receiving end of `sink` is treated as the client going away.
    pub async fn handle_question(
        &self,
        client: &ClientId,
        question: &str,
        sink: EventSink,
    ) -> RelayOutcome {
        let model = self.generator.model().to_string();
        let registration = self.store.begin(client, question);
        let generation = registration.generation;
        let cancel = registration.cancel;

        if let Some(previous) = registration.preempted {
            info!(%client, previous, generation, "pre-empted in-flight generation");
        }

        let turns = match self.config.max_context_tokens {
            Some(limit) => fit_context(registration.turns, &model, limit),
            None => registration.turns,
        };
        info!(
            %client,
            generation,
            turns = turns.len(),
            input_tokens = count_tokens(question, &model),
            "question received"
        );

        let _ = sink.send(StreamEvent::ThinkingStarted);

        let mut answer = String::new();
        let mut outcome = self.stream_answer(turns, &cancel, &sink, &mut answer).await;
        // Stop the capability on every exit path; the token is ours alone.
        cancel.cancel();

        if matches!(outcome, RelayOutcome::Failed | RelayOutcome::TimedOut) {
            answer = FALLBACK_MESSAGE.to_string();
            let _ = sink.send(StreamEvent::Fragment(answer.clone()));
        }

        // History is written before STOP_THINKING goes out.
        let exchange = outcome
            .records_history()
            .then(|| (Turn::user(question), Turn::assistant(answer.as_str())));
        let still_current = self.store.finish(client, generation, exchange);
        if !still_current {
            outcome = RelayOutcome::Superseded;
        }

        let _ = sink.send(StreamEvent::ThinkingStopped);

        info!(
            %client,
            generation,
            %outcome,
            output_tokens = count_tokens(&answer, &model),
            "generation finished"
        );
        outcome
    }

    async fn stream_answer(
        &self,
        turns: Vec<Turn>,
        cancel: &CancellationToken,
        sink: &EventSink,
        answer: &mut String,
    ) -> RelayOutcome {
        if !self.config.think_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Superseded,
                _ = sink.closed() => return RelayOutcome::Disconnected,
                _ = tokio::time::sleep(self.config.think_delay) => {}
            }
        }

        let mut fragments = self.generator.generate(turns, cancel.clone());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Superseded,
                _ = sink.closed() => return RelayOutcome::Disconnected,
                next = tokio::time::timeout(self.config.idle_timeout, fragments.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!(timeout = ?self.config.idle_timeout, "no fragment before idle timeout");
                    return RelayOutcome::TimedOut;
                }
                Ok(None) => return RelayOutcome::Completed,
                Ok(Some(Ok(fragment))) => {
                    answer.push_str(&fragment);
                    if sink.send(StreamEvent::Fragment(fragment)).is_err() {
                        debug!("event sink closed mid-stream");
                        return RelayOutcome::Disconnected;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "generation capability failed");
                    return RelayOutcome::Failed;
                }
            }
        }
    }
}
