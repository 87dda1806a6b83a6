//! Client side of the streaming transport.
//!
//! - [`ChatClient`] opens one `POST /stream` per question and hands back a
//!   [`Subscription`]: a cancelable feed of decoded [`StreamEvent`]s.
//! - [`ChatView`] folds events into what a UI shows: a transcript of
//!   finalized messages plus the answer currently streaming in.
//! - [`ChatSession`] ties the two together and pre-empts its own previous
//!   question when a new one is asked.
//!
//! Connections are released when the stream ends, when it fails, and when
//! the subscription is cancelled or dropped.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::events::{SseDecoder, StreamEvent};

#[derive(Debug, Serialize)]
struct QuestionBody<'a> {
    question: &'a str,
}

// ---------------------------------------------------------------------------
// ChatClient / Subscription
// ---------------------------------------------------------------------------

/// HTTP client for a relay server. Keeps the server-issued identity cookie
/// so consecutive questions share one conversation.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    /// `base_url` is the server root, e.g. `http://localhost:8000`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/stream", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a stream for `question`.
    pub fn ask(&self, question: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let request = self
            .http
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&QuestionBody { question });
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("subscription cancelled"),
                result = read_events(request, &tx) => {
                    if let Err(e) = result {
                        let _ = tx.send(Err(e));
                    }
                }
            }
        });

        Subscription {
            events: rx,
            cancel,
            task,
        }
    }
}

async fn read_events(
    request: reqwest::RequestBuilder,
    tx: &mpsc::UnboundedSender<Result<StreamEvent>>,
) -> Result<()> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await?;
        return Err(RelayError::Server {
            status: status.as_u16(),
            body,
        });
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for payload in decoder.push(&chunk) {
            let event = StreamEvent::from_data(&payload)?;
            let terminal = event.is_terminal();
            if tx.send(Ok(event)).is_err() || terminal {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Live feed of one question's events.
///
/// Dropping it tears down the underlying connection.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<Result<StreamEvent>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Next event, or `None` once the stream has ended or been cancelled.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        self.events.recv().await
    }

    /// Stop listening and release the connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the background reader has exited (connection released).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// ChatView
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    User,
    Assistant,
}

/// A finalized transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub author: Author,
    pub content: String,
}

/// What the UI should be showing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    Thinking,
    Streaming,
}

/// Accumulates stream events into a transcript.
#[derive(Debug)]
pub struct ChatView {
    transcript: Vec<Message>,
    buffer: String,
    state: ViewState,
    active_ask: Option<u64>,
    next_ask: u64,
}

impl Default for ChatView {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatView {
    pub fn new() -> Self {
        Self {
            transcript: Vec::new(),
            buffer: String::new(),
            state: ViewState::Idle,
            active_ask: None,
            next_ask: 1,
        }
    }

    /// Record a new question and return the id its events must carry.
    ///
    /// An answer still streaming for an earlier question is abandoned: its
    /// partial text never reaches the transcript.
    pub fn begin_ask(&mut self, question: &str) -> u64 {
        if self.active_ask.is_some() {
            self.abandon();
        }
        self.transcript.push(Message {
            author: Author::User,
            content: question.to_string(),
        });
        let id = self.next_ask;
        self.next_ask += 1;
        self.active_ask = Some(id);
        self.state = ViewState::Thinking;
        id
    }

    /// Drop whatever is streaming and go idle.
    pub fn abandon(&mut self) {
        self.buffer.clear();
        self.active_ask = None;
        self.state = ViewState::Idle;
    }

    /// Apply an event for ask `ask_id`; events for abandoned asks are
    /// ignored.
    ///
    /// Returns the committed message text when a `ThinkingStopped` finalizes
    /// a non-empty answer.
    pub fn apply(&mut self, ask_id: u64, event: StreamEvent) -> Option<&str> {
        if self.active_ask != Some(ask_id) {
            return None;
        }

        match event {
            StreamEvent::ThinkingStarted => {
                self.state = ViewState::Thinking;
                None
            }
            StreamEvent::Fragment(text) => {
                self.buffer.push_str(&text);
                self.state = ViewState::Streaming;
                None
            }
            StreamEvent::ThinkingStopped => self.commit(),
        }
    }

    /// Finalize the running buffer and go idle.
    fn commit(&mut self) -> Option<&str> {
        self.active_ask = None;
        self.state = ViewState::Idle;
        if self.buffer.is_empty() {
            debug!("stream ended without any answer text");
            return None;
        }
        self.transcript.push(Message {
            author: Author::Assistant,
            content: std::mem::take(&mut self.buffer),
        });
        self.transcript.last().map(|m| m.content.as_str())
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Answer text received so far for the active question.
    pub fn streaming_text(&self) -> Option<&str> {
        (self.state == ViewState::Streaming).then_some(self.buffer.as_str())
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn active_ask(&self) -> Option<u64> {
        self.active_ask
    }
}

// ---------------------------------------------------------------------------
// ChatSession
// ---------------------------------------------------------------------------

/// One UI session: a client, a view, and at most one open subscription.
#[derive(Debug)]
pub struct ChatSession {
    client: ChatClient,
    view: ChatView,
    current: Option<(u64, Subscription)>,
}

impl ChatSession {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            view: ChatView::new(),
            current: None,
        }
    }

    /// Ask `question`, abandoning and tearing down any open stream first.
    pub fn ask(&mut self, question: &str) -> Result<()> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RelayError::BadRequest("question must not be empty".into()));
        }
        if let Some((_, previous)) = self.current.take() {
            previous.cancel();
        }
        let id = self.view.begin_ask(question);
        self.current = Some((id, self.client.ask(question)));
        Ok(())
    }

    /// Wait for the next event of the open stream and fold it into the view.
    ///
    /// Returns `Ok(None)` when no stream is open. A transport failure retires
    /// the pending answer (committing what arrived) before the error is
    /// returned, so the view never stays stuck thinking.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        let Some((id, subscription)) = self.current.as_mut() else {
            return Ok(None);
        };
        let id = *id;

        match subscription.next().await {
            Some(Ok(event)) => {
                let terminal = event.is_terminal();
                self.view.apply(id, event.clone());
                if terminal {
                    self.current = None;
                }
                Ok(Some(event))
            }
            Some(Err(e)) => {
                self.view.apply(id, StreamEvent::ThinkingStopped);
                self.current = None;
                Err(e)
            }
            None => {
                self.view.apply(id, StreamEvent::ThinkingStopped);
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Cancel the open stream, if any, without asking anything new.
    pub fn cancel(&mut self) {
        if let Some((_, subscription)) = self.current.take() {
            subscription.cancel();
            self.view.abandon();
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.current.is_some()
    }

    pub fn view(&self) -> &ChatView {
        &self.view
    }
}
