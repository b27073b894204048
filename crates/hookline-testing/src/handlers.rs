//! Scripted handlers for exercising dispatch and retry paths.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use hookline_core::{EventContext, EventId, HandlerResult, Topic, WebhookHandler};

/// What a scripted handler does on one call.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Returns a successful result.
    Succeed,
    /// Returns `Err` with the message.
    Error(String),
    /// Returns `Ok` with a failed result carrying the message.
    Reject(String),
    /// Panics with the message.
    Panic(String),
    /// Sleeps for the duration, then succeeds.
    Sleep(Duration),
}

impl Outcome {
    /// Shorthand for [`Outcome::Error`].
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Handler that follows a queue of outcomes, then a fallback.
#[derive(Debug)]
pub struct ScriptedHandler {
    topics: Vec<Topic>,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: AtomicUsize,
    seen: Mutex<Vec<EventId>>,
}

impl ScriptedHandler {
    /// Creates a handler for `topics` that succeeds unless scripted otherwise.
    pub fn new(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            topics: topics.into_iter().collect(),
            script: Mutex::new(VecDeque::new()),
            fallback: Outcome::Succeed,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queues an outcome for the next unscripted call.
    #[must_use]
    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(outcome);
        self
    }

    /// Sets the outcome once the script runs out.
    #[must_use]
    pub fn otherwise(mut self, outcome: Outcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Number of `process` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Event ids in the order they were processed.
    pub fn seen(&self) -> Vec<EventId> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl WebhookHandler for ScriptedHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn topics(&self) -> &[Topic] {
        &self.topics
    }

    async fn process(&self, context: &EventContext) -> anyhow::Result<HandlerResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).push(context.event_id().clone());

        let outcome = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            Outcome::Succeed => Ok(HandlerResult::success(format!("processed {}", context.topic()))),
            Outcome::Error(message) => Err(anyhow::anyhow!(message)),
            Outcome::Reject(message) => Ok(HandlerResult::failure(message)),
            Outcome::Panic(message) => panic!("{message}"),
            Outcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(HandlerResult::success("processed after delay"))
            },
        }
    }
}
