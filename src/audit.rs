//! Built-in handler that acknowledges events and logs an audit line.

use async_trait::async_trait;
use hookline_core::{EventContext, HandlerResult, Topic, WebhookHandler};
use serde_json::json;
use tracing::info;

/// Acknowledges every event on its topics after logging it.
#[derive(Debug, Clone)]
pub struct AuditHandler {
    topics: Vec<Topic>,
}

impl AuditHandler {
    /// Creates a handler for `topics`.
    pub fn new(topics: Vec<Topic>) -> Self {
        Self { topics }
    }
}

#[async_trait]
impl WebhookHandler for AuditHandler {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn topics(&self) -> &[Topic] {
        &self.topics
    }

    async fn process(&self, context: &EventContext) -> anyhow::Result<HandlerResult> {
        let resource_id = context.payload().resource_id();
        info!(
            event_id = %context.event_id(),
            topic = %context.topic(),
            shop = %context.shop(),
            resource = context.topic().resource(),
            resource_id,
            "webhook audited"
        );

        Ok(HandlerResult::success(format!("audited {}", context.topic()))
            .with_data(json!({ "resourceId": resource_id })))
    }
}
