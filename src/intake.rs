//! Newline-delimited JSON event intake.
//!
//! Each line carries one verified webhook request:
//! `{"topic": "orders/create", "shop": "shop.example.com", "payload": {...}}`
//! with an optional `headers` object. Malformed lines are logged and skipped.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use hookline_delivery::WebhookEngine;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One inbound webhook request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEvent {
    /// Topic string as sent by the platform.
    pub topic: String,
    /// Shop domain as sent by the platform.
    pub shop: String,
    /// Raw JSON body.
    pub payload: Value,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Counters for one intake run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    /// Lines dispatched to the engine.
    pub dispatched: usize,
    /// Dispatched events whose first attempt succeeded.
    pub succeeded: usize,
    /// Lines skipped as malformed or rejected at ingest.
    pub rejected: usize,
}

/// Parses one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some).context("malformed event line")
}

/// Reads events from `reader` and dispatches them until EOF or `token` is
/// cancelled.
pub async fn run<R>(engine: &WebhookEngine, reader: R, token: &CancellationToken) -> Result<IntakeSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IntakeSummary::default();
    let mut line_number = 0usize;

    loop {
        let line = tokio::select! {
            () = token.cancelled() => {
                info!("intake cancelled");
                break;
            },
            line = lines.next_line() => line.context("failed to read event input")?,
        };
        let Some(line) = line else {
            debug!("intake reached end of input");
            break;
        };
        line_number += 1;

        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(error) => {
                warn!(line = line_number, error = %format!("{error:#}"), "skipping malformed event line");
                summary.rejected += 1;
                continue;
            },
        };

        let context = match engine.ingest(&event.topic, &event.shop, event.payload, event.headers) {
            Ok(context) => context,
            Err(error) => {
                warn!(line = line_number, topic = %event.topic, shop = %event.shop, error = %error, "rejected webhook request");
                summary.rejected += 1;
                continue;
            },
        };

        let result = engine.dispatch(&context).await;
        summary.dispatched += 1;
        if result.is_success() {
            summary.succeeded += 1;
        }
    }

    info!(
        dispatched = summary.dispatched,
        succeeded = summary.succeeded,
        rejected = summary.rejected,
        "intake finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_event_with_optional_headers() {
        let event = parse_line(r#"{"topic":"orders/create","shop":"shop.example.com","payload":{"id":1}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "orders/create");
        assert_eq!(event.payload, json!({ "id": 1 }));
        assert!(event.headers.is_empty());

        let event = parse_line(
            r#"{"topic":"orders/paid","shop":"s.example.com","payload":{},"headers":{"x-request-id":"abc"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.headers.get("x-request-id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_line("{not json").is_err());
        assert!(parse_line(r#"{"topic":"orders/create"}"#).is_err());
    }
}
