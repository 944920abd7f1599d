use super::*;
use crate::test_utils::{OrderPlaced, ShipOrder};

fn inbound() -> MessageContext {
    MessageContext::from_message(&OrderPlaced::new("o-1")).unwrap()
}

fn command() -> MessageContext {
    MessageContext::from_message(&ShipOrder::new("o-1")).unwrap()
}

#[tokio::test]
async fn test_commit_writes_record_outbox_and_state_together() {
    let store = InMemoryMessageStore::new();
    let inbound = inbound();

    let mut tx = store.begin().await.unwrap();
    tx.apply_changes(&[StateChange::Put {
        key: "order/o-1".to_string(),
        value: serde_json::json!("placed"),
    }])
    .await
    .unwrap();
    tx.record_handled(&inbound, "sub.Handler", &[command()], &[])
        .await
        .unwrap();

    // Nothing visible before commit.
    assert!(!store.has_handled(inbound.message_id(), "sub.Handler").await.unwrap());
    assert!(store.load_unsent().await.unwrap().is_empty());

    tx.commit().await.unwrap();

    assert!(store.has_handled(inbound.message_id(), "sub.Handler").await.unwrap());
    assert_eq!(store.load_unsent().await.unwrap().len(), 1);
    assert_eq!(
        store.state("order/o-1").await.unwrap(),
        Some(serde_json::json!("placed"))
    );
}

#[tokio::test]
async fn test_failed_commit_leaves_nothing_behind() {
    let store = InMemoryMessageStore::new();
    store.set_fail_on_commit(true);
    let inbound = inbound();

    let mut tx = store.begin().await.unwrap();
    tx.apply_changes(&[StateChange::Put {
        key: "order/o-1".to_string(),
        value: serde_json::json!("placed"),
    }])
    .await
    .unwrap();
    tx.record_handled(&inbound, "sub.Handler", &[command()], &[])
        .await
        .unwrap();

    assert!(tx.commit().await.is_err());
    assert_eq!(store.handled_count().await, 0);
    assert!(store.outbox().await.is_empty());
    assert_eq!(store.state("order/o-1").await.unwrap(), None);
}

#[tokio::test]
async fn test_rollback_discards_staged_writes() {
    let store = InMemoryMessageStore::new();
    let inbound = inbound();

    let mut tx = store.begin().await.unwrap();
    tx.record_handled(&inbound, "sub.Handler", &[command()], &[])
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.handled_count().await, 0);
    assert!(store.outbox().await.is_empty());
}

#[tokio::test]
async fn test_subscriptions_are_independent() {
    let store = InMemoryMessageStore::new();
    let inbound = inbound();

    let mut tx = store.begin().await.unwrap();
    tx.record_handled(&inbound, "sub.A", &[], &[]).await.unwrap();
    tx.commit().await.unwrap();

    assert!(store.has_handled(inbound.message_id(), "sub.A").await.unwrap());
    assert!(!store.has_handled(inbound.message_id(), "sub.B").await.unwrap());
}

#[tokio::test]
async fn test_mark_sent_removes_from_unsent() {
    let store = InMemoryMessageStore::new();
    let command = command();

    let mut tx = store.begin().await.unwrap();
    tx.record_handled(&inbound(), "sub", &[command.clone()], &[])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    store.mark_sent(command.message_id()).await.unwrap();
    store.mark_sent("unknown").await.unwrap();

    assert!(store.load_unsent().await.unwrap().is_empty());
    assert!(store.outbox().await[0].sent);
}

#[tokio::test]
async fn test_record_failure_counts_as_handled_and_keeps_outbox() {
    let store = InMemoryMessageStore::new();
    let inbound = inbound();
    let notification = command();

    store
        .record_failure(&inbound, "sub", "boom", &[notification.clone()])
        .await
        .unwrap();

    assert!(store.has_handled(inbound.message_id(), "sub").await.unwrap());
    let failures = store.failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error, "boom");
    assert_eq!(failures[0].outbox.len(), 1);
    assert_eq!(
        store.load_unsent().await.unwrap()[0].message_id(),
        notification.message_id()
    );
}

#[tokio::test]
async fn test_duplicate_outbox_ids_are_ignored() {
    let store = InMemoryMessageStore::new();
    let command = command();

    for subscription in ["sub.A", "sub.B"] {
        let mut tx = store.begin().await.unwrap();
        tx.record_handled(&inbound(), subscription, &[command.clone()], &[])
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    assert_eq!(store.outbox().await.len(), 1);
}
