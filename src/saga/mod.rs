//! Saga correlation helpers.
//!
//! Saga info arrives on the inbound message and is never modified. It decides
//! where saga results are sent and lets a failed step tell the saga it is over.

use serde::{Deserialize, Serialize};

use crate::event_bus::EventBus;
use crate::message::{Message, MessageContext, Payload, Result, SagaInfo};
use crate::transport::Transport;

/// Saga result sent when a step fails for a reason other than a business rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailure {
    pub error: String,
}

impl Message for SagaFailure {
    const TYPE_NAME: &'static str = "SagaFailure";
}

impl SagaFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Record a `SagaFailure` result on the bus.
pub fn finish_with_error(bus: &mut EventBus, cause: &str) -> Result<()> {
    bus.finish_saga(&SagaFailure::new(cause))
}

/// Wrap saga results as replies to the saga's reply endpoint.
///
/// Returns nothing unless the inbound message belongs to a saga with both an id
/// and a reply endpoint. Every reply gets a fresh message id and carries the saga
/// info back unchanged.
pub fn saga_reply_contexts(
    saga_info: Option<&SagaInfo>,
    results: &[Payload],
    producer: &str,
    transport: &dyn Transport,
) -> Vec<MessageContext> {
    let Some(info) = saga_info else {
        return Vec::new();
    };
    let Some(topic) = info.reply_topic() else {
        return Vec::new();
    };

    results
        .iter()
        .map(|result| {
            transport.wrap_message(
                result.clone(),
                topic,
                None,
                None,
                Some(info.clone()),
                producer,
            )
        })
        .collect()
}
