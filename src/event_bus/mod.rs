//! Scoped collector for messages produced while one handler runs.
//!
//! A fresh `EventBus` is created for every handler scope and dropped when the
//! scope ends, so no handler ever observes another handler's output.

use crate::message::{Message, Payload, Result};

/// A message collected on the bus, not yet wrapped into a context.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub payload: Payload,
    pub topic: String,
    pub key: Option<String>,
}

impl OutgoingMessage {
    pub fn from_message<M: Message>(message: &M) -> Result<Self> {
        Ok(Self {
            payload: Payload::from_message(message)?,
            topic: message.topic(),
            key: message.key(),
        })
    }
}

/// Per-invocation collector of commands, events and saga results.
#[derive(Debug, Default)]
pub struct EventBus {
    commands: Vec<OutgoingMessage>,
    events: Vec<OutgoingMessage>,
    publish_anyway: Vec<OutgoingMessage>,
    saga_results: Vec<Payload>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command for the command channel.
    pub fn send_command<C: Message>(&mut self, command: &C) -> Result<()> {
        self.commands.push(OutgoingMessage::from_message(command)?);
        Ok(())
    }

    /// Queue an event. Dropped if the handling transaction fails.
    pub fn publish<E: Message>(&mut self, event: &E) -> Result<()> {
        self.events.push(OutgoingMessage::from_message(event)?);
        Ok(())
    }

    pub fn publish_all<'a, E, I>(&mut self, events: I) -> Result<()>
    where
        E: Message + 'a,
        I: IntoIterator<Item = &'a E>,
    {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }

    /// Queue an event that is sent even if the handling transaction fails.
    pub fn publish_anyway<E: Message>(&mut self, event: &E) -> Result<()> {
        let outgoing = OutgoingMessage::from_message(event)?;
        self.events.push(outgoing.clone());
        self.publish_anyway.push(outgoing);
        Ok(())
    }

    /// Record a saga result, replied to the saga's endpoint.
    pub fn finish_saga<R: Message>(&mut self, result: &R) -> Result<()> {
        self.saga_results.push(Payload::from_message(result)?);
        Ok(())
    }

    pub fn finish_saga_payload(&mut self, result: Payload) {
        self.saga_results.push(result);
    }

    pub fn commands(&self) -> &[OutgoingMessage] {
        &self.commands
    }

    /// Events to publish on success, publish-anyway events included.
    pub fn events(&self) -> &[OutgoingMessage] {
        &self.events
    }

    pub fn publish_anyway_events(&self) -> &[OutgoingMessage] {
        &self.publish_anyway
    }

    pub fn saga_results(&self) -> &[Payload] {
        &self.saga_results
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.events.is_empty()
            && self.publish_anyway.is_empty()
            && self.saga_results.is_empty()
    }

    /// Reset every queue.
    pub fn clear_messages(&mut self) {
        self.commands.clear();
        self.events.clear();
        self.publish_anyway.clear();
        self.saga_results.clear();
    }
}
