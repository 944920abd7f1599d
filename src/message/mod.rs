//! Message envelopes.
//!
//! This module contains:
//! - `Message` trait: typed payloads that can travel through a transport
//! - `Payload`: type-erased message body, tagged with its type name
//! - `MessageContext`: the envelope a message travels in (ids, topic, key, saga info, offset)
//! - `MessageState`: an outbound context plus its optional completion handle

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Result type for message operations.
pub type Result<T> = std::result::Result<T, MessageError>;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode '{type_name}': {source}")]
    Encode {
        type_name: String,
        source: serde_json::Error,
    },

    #[error("Failed to decode '{type_name}': {source}")]
    Decode {
        type_name: String,
        source: serde_json::Error,
    },

    #[error("Payload type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch { expected: String, actual: String },
}

// ============================================================================
// Payloads
// ============================================================================

/// A typed message that can be wrapped into a `MessageContext`.
///
/// `TYPE_NAME` is the runtime discriminator used by the handler registry.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of this message type.
    const TYPE_NAME: &'static str;

    /// Destination topic. Defaults to the type name.
    fn topic(&self) -> String {
        Self::TYPE_NAME.to_string()
    }

    /// Partition key. Messages sharing a key are handled in order.
    fn key(&self) -> Option<String> {
        None
    }
}

/// Type-erased message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub body: serde_json::Value,
}

impl Payload {
    pub fn new(type_name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            body,
        }
    }

    /// Encode a typed message.
    pub fn from_message<M: Message>(message: &M) -> Result<Self> {
        let body = serde_json::to_value(message).map_err(|source| MessageError::Encode {
            type_name: M::TYPE_NAME.to_string(),
            source,
        })?;
        Ok(Self::new(M::TYPE_NAME, body))
    }

    /// Decode into a typed message, checking the type name first.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if self.type_name != M::TYPE_NAME {
            return Err(MessageError::TypeMismatch {
                expected: M::TYPE_NAME.to_string(),
                actual: self.type_name.clone(),
            });
        }
        serde_json::from_value(self.body.clone()).map_err(|source| MessageError::Decode {
            type_name: self.type_name.clone(),
            source,
        })
    }
}

/// Saga correlation carried by messages that belong to a multi-step workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInfo {
    pub saga_id: String,
    pub reply_end_point: Option<String>,
}

impl SagaInfo {
    pub fn new(saga_id: impl Into<String>, reply_end_point: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            reply_end_point: Some(reply_end_point.into()),
        }
    }

    /// Reply destination, present only when both saga id and endpoint are non-empty.
    pub fn reply_topic(&self) -> Option<&str> {
        if self.saga_id.trim().is_empty() {
            return None;
        }
        self.reply_end_point
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Transport cursor needed to acknowledge a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub partition: u32,
    pub offset: u64,
}

/// Envelope a message travels in.
///
/// Built once with the `with_*` methods and read through accessors afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    message_id: String,
    correlation_id: Option<String>,
    topic: String,
    key: Option<String>,
    payload: Payload,
    tags: Vec<String>,
    saga_info: Option<SagaInfo>,
    producer: Option<String>,
    sent_time: DateTime<Utc>,
    #[serde(skip)]
    offset: Option<Offset>,
}

impl MessageContext {
    /// Wrap a payload for `topic` with a freshly generated message id.
    pub fn new(payload: Payload, topic: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            topic: topic.into(),
            key: None,
            payload,
            tags: Vec::new(),
            saga_info: None,
            producer: None,
            sent_time: Utc::now(),
            offset: None,
        }
    }

    /// Wrap a typed message using its own topic and key.
    pub fn from_message<M: Message>(message: &M) -> Result<Self> {
        let payload = Payload::from_message(message)?;
        Ok(Self::new(payload, message.topic()).with_key(message.key()))
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_saga_info(mut self, saga_info: Option<SagaInfo>) -> Self {
        self.saga_info = saga_info;
        self
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Attach the transport cursor. Set by transports at receipt.
    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn type_name(&self) -> &str {
        &self.payload.type_name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn saga_info(&self) -> Option<&SagaInfo> {
        self.saga_info.as_ref()
    }

    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    pub fn sent_time(&self) -> DateTime<Utc> {
        self.sent_time
    }

    pub fn offset(&self) -> Option<Offset> {
        self.offset
    }
}

// ============================================================================
// Outbound state
// ============================================================================

/// Acknowledgement returned to callers waiting on a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub message_id: String,
    pub topic: String,
    pub sent_at: DateTime<Utc>,
}

/// An outbound message queued on a sender.
#[derive(Debug)]
pub struct MessageState {
    context: MessageContext,
    completion: Option<oneshot::Sender<MessageResponse>>,
}

impl MessageState {
    /// Fire-and-forget state, produced by a live handler or reloaded from the
    /// outbox.
    pub fn new(context: MessageContext) -> Self {
        Self {
            context,
            completion: None,
        }
    }

    /// State whose sender will be notified once the transport accepts it.
    pub fn with_completion(context: MessageContext) -> (Self, oneshot::Receiver<MessageResponse>) {
        let (tx, rx) = oneshot::channel();
        let state = Self {
            context,
            completion: Some(tx),
        };
        (state, rx)
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Route a message that carries no topic to `topic`.
    pub fn default_topic(&mut self, topic: &str) {
        if self.context.topic.is_empty() {
            self.context.topic = topic.to_string();
        }
    }

    /// Resolve the waiting caller, if any. A caller that gave up is ignored.
    pub fn complete(self) -> MessageResponse {
        let response = MessageResponse {
            message_id: self.context.message_id.clone(),
            topic: self.context.topic.clone(),
            sent_at: Utc::now(),
        };
        if let Some(completion) = self.completion {
            let _ = completion.send(response.clone());
        }
        response
    }
}
