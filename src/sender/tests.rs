use super::*;
use crate::store::{InMemoryMessageStore, StoreTransaction};
use crate::test_utils::{ShipOrder, TestMessage};
use crate::transport::MockTransport;

fn fast_config() -> SenderConfig {
    SenderConfig {
        retry_interval_ms: 10,
        ..SenderConfig::default()
    }
}

fn sender_with(transport: &MockTransport) -> MessageSender {
    MessageSender::new("commands", Arc::new(transport.clone()), fast_config())
}

fn context(n: u32) -> MessageContext {
    MessageContext::from_message(&TestMessage::new(n)).unwrap()
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_failures_then_success_delivers_once() {
    let transport = MockTransport::new();
    transport.fail_next_sends(3);
    let sender = sender_with(&transport);
    sender.start().await.unwrap();

    let message = context(1);
    let responses = sender.send(vec![message.clone()]).await.unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message_id, message.message_id());
    assert_eq!(transport.send_attempts(), 4);
    assert_eq!(transport.sent_count().await, 1);
    assert_eq!(sender.sent_count(), 1);
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn test_future_resolves_only_after_success() {
    let transport = MockTransport::new();
    transport.fail_next_sends(usize::MAX);
    let sender = sender_with(&transport);
    sender.start().await.unwrap();

    let mut delivery = Box::pin(sender.send(vec![context(1)]));
    let early = tokio::time::timeout(Duration::from_millis(50), &mut delivery).await;
    assert!(early.is_err(), "delivery resolved while sends were failing");
    assert!(transport.send_attempts() > 1);

    transport.fail_next_sends(0);
    let responses = tokio::time::timeout(Duration::from_secs(2), delivery)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(transport.sent_count().await, 1);
}

#[tokio::test]
async fn test_failed_message_blocks_those_behind_it() {
    let transport = MockTransport::new();
    transport.fail_next_sends(2);
    let sender = sender_with(&transport);
    sender.start().await.unwrap();

    let messages: Vec<_> = (0..5).map(context).collect();
    sender.send(messages.clone()).await.unwrap();

    let sent: Vec<String> = transport
        .sent()
        .await
        .iter()
        .map(|c| c.message_id().to_string())
        .collect();
    let expected: Vec<String> = messages.iter().map(|c| c.message_id().to_string()).collect();
    assert_eq!(sent, expected);
}

#[tokio::test]
async fn test_cancel_abandons_wait_but_message_is_still_sent() {
    let transport = MockTransport::new();
    let sender = sender_with(&transport);

    let result = sender
        .send_with_cancel(vec![context(1)], futures::future::ready(()))
        .await;
    assert!(matches!(result, Err(SendError::Cancelled)));
    assert_eq!(sender.pending_count(), 1);

    sender.start().await.unwrap();
    wait_until(|| sender.pending_count() == 0).await;
    assert_eq!(transport.sent_count().await, 1);
}

#[tokio::test]
async fn test_default_topic_for_untargeted_messages() {
    let transport = MockTransport::new();
    let sender = MessageSender::new(
        "events",
        Arc::new(transport.clone()),
        SenderConfig {
            default_topic: Some("fallback".to_string()),
            ..fast_config()
        },
    );
    sender.start().await.unwrap();

    let untargeted = context(1).with_topic("");
    let targeted = context(2);
    let responses = sender.send(vec![untargeted, targeted]).await.unwrap();

    assert_eq!(responses[0].topic, "fallback");
    assert_eq!(responses[1].topic, TestMessage::TYPE_NAME);
    let sent = transport.sent().await;
    assert_eq!(sent[0].topic(), "fallback");
}

#[tokio::test]
async fn test_start_reloads_unsent_and_marks_them_sent() {
    let transport = MockTransport::new();
    let store = InMemoryMessageStore::new();
    let inbound = context(0);
    let command = MessageContext::from_message(&ShipOrder::new("o-1")).unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.record_handled(&inbound, "sub", &[command.clone()], &[])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let sender = sender_with(&transport).with_store(Arc::new(store.clone()));
    sender.start().await.unwrap();

    wait_until(|| sender.sent_count() == 1).await;
    assert_eq!(transport.sent().await[0].message_id(), command.message_id());
    assert!(store.load_unsent().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reload_disabled() {
    let transport = MockTransport::new();
    let store = InMemoryMessageStore::new();
    let mut tx = store.begin().await.unwrap();
    tx.record_handled(&context(0), "sub", &[context(1)], &[])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let sender = MessageSender::new(
        "commands",
        Arc::new(transport.clone()),
        SenderConfig {
            reload_unsent: false,
            ..fast_config()
        },
    )
    .with_store(Arc::new(store));
    sender.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.send_attempts(), 0);
}

#[tokio::test]
async fn test_stop_keeps_message_and_restart_resumes() {
    let transport = MockTransport::new();
    transport.fail_next_sends(usize::MAX);
    let sender = sender_with(&transport);
    sender.start().await.unwrap();
    assert_eq!(sender.status(), WorkerStatus::Running);

    let delivery = sender.send(vec![context(1), context(2)]);
    wait_until(|| transport.send_attempts() > 0).await;

    sender.stop().await.unwrap();
    assert_eq!(sender.status(), WorkerStatus::Stopped);
    assert_eq!(sender.pending_count(), 2);

    transport.fail_next_sends(0);
    sender.start().await.unwrap();

    let responses = tokio::time::timeout(Duration::from_secs(2), delivery)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(transport.sent_count().await, 2);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let transport = MockTransport::new();
    let sender = sender_with(&transport);
    assert_eq!(sender.status(), WorkerStatus::NotStarted);

    sender.start().await.unwrap();

    assert!(matches!(sender.start().await, Err(SendError::AlreadyRunning)));
}

#[tokio::test]
async fn test_send_message_wraps_with_producer() {
    let transport = MockTransport::new();
    let sender = sender_with(&transport);
    sender.start().await.unwrap();

    let response = sender.send_message(&ShipOrder::new("o-2")).await.unwrap();

    assert_eq!(response.topic, "shipping");
    let sent = transport.sent().await;
    assert_eq!(sent[0].producer(), Some("commands"));
    assert_eq!(sent[0].key(), Some("o-2"));
}

#[tokio::test]
async fn test_send_states_is_fire_and_forget() {
    let transport = MockTransport::new();
    let sender = sender_with(&transport);
    sender.start().await.unwrap();

    sender.send_states(vec![MessageState::new(context(1)), MessageState::new(context(2))]);

    wait_until(|| sender.sent_count() == 2).await;
    assert_eq!(transport.sent_count().await, 2);
}
