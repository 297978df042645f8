//! Line-delimited JSON inbound adapter.
//!
//! Each line is one message:
//!
//! ```text
//! {"headers":{"event-type":"OrderPlaced","x-correlation-id":"order-7"},"body":{...}}
//! ```
//!
//! The `event-type` header is resolved through a fixed `match` over the event
//! types the host consumes. Every message runs in its own correlation scope
//! built from its headers.

use std::collections::HashMap;
use std::sync::Arc;

use common::CorrelationContext;
use pipeline::{CancellationToken, Mediator};
use saga::{HandleSagaEvent, SagaEvent, SagaOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{HostError, Result};
use crate::order::{OrderCancelled, OrderPlaced, PaymentCharged, StockReserved};

pub const EVENT_TYPE_HEADER: &str = "event-type";

/// One inbound message as read from the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl InboundMessage {
    pub fn new(event_type: &str, body: serde_json::Value) -> Self {
        Self {
            headers: HashMap::from([(EVENT_TYPE_HEADER.to_string(), event_type.to_string())]),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn event_type(&self) -> Result<&str> {
        self.headers
            .get(EVENT_TYPE_HEADER)
            .map(String::as_str)
            .ok_or(HostError::MissingHeader(EVENT_TYPE_HEADER))
    }
}

/// Counts of messages handled by [`InboundAdapter::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Decodes inbound messages and sends them through the mediator.
pub struct InboundAdapter {
    mediator: Arc<Mediator>,
}

impl InboundAdapter {
    pub fn new(mediator: Arc<Mediator>) -> Self {
        Self { mediator }
    }

    /// Dispatches one message in a correlation scope built from its headers.
    pub async fn dispatch(
        &self,
        message: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome> {
        let event_type = message.event_type()?.to_string();
        let context = CorrelationContext::from_headers(&message.headers);
        let correlation_id = context.correlation_id().to_string();
        let causation_id = context.causation_id().map(str::to_string);
        let body = message.body;

        CorrelationContext::scope(context, async move {
            match event_type.as_str() {
                OrderPlaced::EVENT_TYPE => {
                    self.send::<OrderPlaced>(body, correlation_id, causation_id, cancel)
                        .await
                }
                StockReserved::EVENT_TYPE => {
                    self.send::<StockReserved>(body, correlation_id, causation_id, cancel)
                        .await
                }
                PaymentCharged::EVENT_TYPE => {
                    self.send::<PaymentCharged>(body, correlation_id, causation_id, cancel)
                        .await
                }
                OrderCancelled::EVENT_TYPE => {
                    self.send::<OrderCancelled>(body, correlation_id, causation_id, cancel)
                        .await
                }
                other => Err(HostError::UnknownEventType(other.to_string())),
            }
        })
        .await
    }

    async fn send<E>(
        &self,
        body: serde_json::Value,
        correlation_id: String,
        causation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SagaOutcome>
    where
        E: SagaEvent + DeserializeOwned,
    {
        let event: E = serde_json::from_value(body)?;
        let mut request = HandleSagaEvent::new(event, correlation_id);
        request.causation_id = causation_id;
        Ok(self.mediator.send(request, cancel).await?)
    }

    /// Processes messages from `reader` until EOF or cancellation.
    ///
    /// A message that fails is logged and counted; processing continues with
    /// the next line.
    pub async fn run<R>(&self, reader: R, cancel: &CancellationToken) -> Result<InboundSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut summary = InboundSummary::default();

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("inbound adapter cancelled");
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let result = match serde_json::from_str::<InboundMessage>(&line) {
                Ok(message) => self.dispatch(message, cancel).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(outcome) => {
                    summary.processed += 1;
                    tracing::info!(saga_id = %outcome.saga_id(), ?outcome, "message processed");
                }
                Err(error) => {
                    summary.failed += 1;
                    tracing::warn!(error = %error, "message failed");
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            failed = summary.failed,
            "inbound stream finished"
        );
        Ok(summary)
    }
}
