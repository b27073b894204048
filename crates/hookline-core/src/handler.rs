//! Handler seam for topic-specific business logic.

use async_trait::async_trait;

use crate::models::{EventContext, HandlerResult, Topic};

/// Processes events for one or more topics.
///
/// Implementations may fail by returning an error, by returning a failed
/// [`HandlerResult`], by panicking, or by never finishing. The dispatcher
/// converts all four into a recorded failure.
#[async_trait]
pub trait WebhookHandler: Send + Sync + std::fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Topics this handler should be registered for.
    fn topics(&self) -> &[Topic];

    /// Processes one event.
    async fn process(&self, context: &EventContext) -> anyhow::Result<HandlerResult>;
}
