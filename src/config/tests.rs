use super::*;
use crate::store::StoreType;
use std::io::Write;

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.consumer.mailbox_batch_count, 100);
    assert_eq!(config.consumer.mailbox_worker_count, 16);
    assert_eq!(config.sender.retry_interval_ms, 2000);
    assert!(config.sender.reload_unsent);
    assert_eq!(config.store.store_type, StoreType::Memory);
    assert_eq!(config.subscription.topics, vec!["orders".to_string()]);
}

#[test]
fn test_load_from_file_keeps_unset_defaults() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "consumer:\n  mailbox_worker_count: 4\nstore:\n  type: sqlite\n  path: /tmp/courier-test.db\nsender:\n  default_topic: fallback"
    )
    .unwrap();

    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.consumer.mailbox_worker_count, 4);
    assert_eq!(config.consumer.mailbox_batch_count, 100);
    assert_eq!(config.store.store_type, StoreType::Sqlite);
    assert_eq!(config.store.path, "/tmp/courier-test.db");
    assert_eq!(config.sender.default_topic.as_deref(), Some("fallback"));
    assert_eq!(config.sender.retry_interval_ms, 2000);
}

#[test]
fn test_load_missing_explicit_file_fails() {
    assert!(Config::load(Some("/nonexistent/courier.yaml")).is_err());
}
