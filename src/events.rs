// Usage-accounting events emitted at the authentication boundary and around
// upstream completion calls.
//
// Events are handed to an external sink (the `EventLogger` trait) and then
// discarded; the gateway never persists them itself. Dispatch is best-effort:
// every log call runs on a detached task with its own timeout so a slow or
// broken sink can never hold up a client response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribution used when no actor could be resolved for a request.
pub const ANONYMOUS: &str = "anonymous";

/// The fixed set of usage-accounting event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    /// Token could not be resolved to an actor (401).
    Unauthorized,
    /// Actor resolved but entitlement is disabled (403).
    AccessDenied,
    /// Emitted by the enforcement layer that consumes `Actor::rate_limit`;
    /// the gateway core computes the limit value but does not enforce it.
    #[allow(dead_code)]
    RateLimited,
    /// A completion call is about to be forwarded upstream.
    CompletionsStarted,
    /// A completion call finished (any exit path after the started event).
    CompletionsFinished,
}

/// A single fire-and-forget usage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    /// Name of the actor source that resolved the caller, or "anonymous".
    pub source: String,
    /// Actor identifier, or "anonymous".
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    /// Open map of scalar metadata (model, counts, status codes, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(name: EventName, source: &str, identifier: &str) -> Self {
        Self {
            name,
            source: source.to_string(),
            identifier: identifier.to_string(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Event attributed to no actor (failed authentication).
    pub fn anonymous(name: EventName) -> Self {
        Self::new(name, ANONYMOUS, ANONYMOUS)
    }

    /// Attach a metadata field (builder style).
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// External event sink. Implementations are append-only and order-tolerant;
/// duplicates on retry are acceptable, so no idempotence contract is assumed.
#[async_trait]
pub trait EventLogger: Send + Sync {
    async fn log_event(&self, event: Event) -> anyhow::Result<()>;
}

/// Default sink: emits events as structured tracing output. Stands in until a
/// durable analytics backend is wired up by the host.
pub struct TracingLogger;

#[async_trait]
impl EventLogger for TracingLogger {
    async fn log_event(&self, event: Event) -> anyhow::Result<()> {
        tracing::info!(
            target: "tokengate::events",
            name = ?event.name,
            source = %event.source,
            identifier = %event.identifier,
            metadata = %serde_json::Value::Object(event.metadata),
            "usage event"
        );
        Ok(())
    }
}

/// Hands events to the sink on detached tasks so callers never wait on it.
///
/// Sink failures and timeouts are logged locally and never surfaced to the
/// client. The timeout is deliberately decoupled from any request deadline:
/// a cancelled request must still be able to get its final event out.
#[derive(Clone)]
pub struct EventDispatcher {
    sink: Arc<dyn EventLogger>,
    timeout: Duration,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EventLogger>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Fire-and-forget. Safe to call from sync contexts (e.g. Drop impls)
    /// as long as a tokio runtime is running.
    pub fn dispatch(&self, event: Event) {
        let sink = self.sink.clone();
        let budget = self.timeout;
        tokio::spawn(async move {
            let name = event.name;
            match tokio::time::timeout(budget, sink.log_event(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!("event sink rejected {name:?} event: {err:#}");
                }
                Err(_) => {
                    tracing::warn!("event sink timed out after {budget:?} logging {name:?}");
                }
            }
        });
    }
}
