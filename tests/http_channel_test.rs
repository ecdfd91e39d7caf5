use chrono::{TimeZone, Utc};
use httpmock::prelude::*;
use partner_exchange::adapters::memory::{MemoryLedger, MemorySequenceAllocator, MemoryStagingStore};
use partner_exchange::adapters::{transform_for, HttpMailboxChannel};
use partner_exchange::core::exchange::{ExchangeCycle, ExchangePorts, ExchangeSettings};
use partner_exchange::domain::model::{FileState, PartnerKind, Record, RecordState};
use partner_exchange::domain::ports::{DomesticLedger, RemoteChannel, StagingStore};
use partner_exchange::ExchangeError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn channel(server: &MockServer) -> HttpMailboxChannel {
    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), "Bearer mailbox-token".to_string());
    HttpMailboxChannel::new(&server.url("/visa"), Duration::from_secs(5))
        .unwrap()
        .with_headers(headers)
}

#[tokio::test]
async fn test_list_sends_headers_and_parses_names() {
    let server = MockServer::start();
    let list_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/visa/outbox")
            .header("Authorization", "Bearer mailbox-token");
        then.status(200)
            .header("Content-Type", "application/json")
            .json_body(serde_json::json!(["ACK_001.txt", "ACK_002.txt"]));
    });

    let names = channel(&server).list("outbox").await.unwrap();

    list_mock.assert();
    assert_eq!(names, vec!["ACK_001.txt", "ACK_002.txt"]);
}

#[tokio::test]
async fn test_missing_mailbox_lists_as_empty() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/visa/outbox");
        then.status(404);
    });

    assert!(channel(&server).list("outbox").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_missing_file_is_not_found() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/visa/outbox/ACK_404.txt");
        then.status(404);
    });

    let err = channel(&server)
        .fetch("outbox", "ACK_404.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::NotFound { .. }));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/visa/outbox");
        then.status(503);
    });

    let err = channel(&server).list("outbox").await.unwrap_err();
    assert!(matches!(err, ExchangeError::ChannelUnavailable { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_full_cycle_over_http() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/visa/outbox");
        then.status(200)
            .json_body(serde_json::json!(["ACK_001.txt"]));
    });
    let fetch_mock = server.mock(|when, then| {
        when.method(GET).path("/visa/outbox/ACK_001.txt");
        then.status(200).body("D;R0;ACCEPTED\n");
    });
    let send_mock = server.mock(|when, then| {
        when.method(PUT)
            .path("/visa/inbox/batch_240601_080000_1.txt")
            .body_contains("D;R1;15;EUR;");
        then.status(201);
    });

    let memory_ledger = MemoryLedger::new().with_records(vec![
        Record::new("R0"),
        Record::new("R1").with_field("amount", 15).with_field("currency", "EUR"),
    ]);
    let ledger: Arc<dyn DomesticLedger> = Arc::new(memory_ledger.clone());
    let inbound = MemoryStagingStore::new();
    let outbound = MemoryStagingStore::new();

    // R0 已在先前的批次送出
    memory_ledger.reserve_pending().await.unwrap();
    memory_ledger
        .commit_consumed("VISA_240531_080000_6.txt", &["R0".to_string()])
        .await
        .unwrap();
    memory_ledger.release(&["R1".to_string()]).await.unwrap();

    let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    let cycle = ExchangeCycle::new(
        ExchangeSettings::new("visa"),
        ExchangePorts {
            channel: Arc::new(channel(&server)),
            inbound: Arc::new(inbound.clone()),
            outbound: Arc::new(outbound.clone()),
            allocator: Arc::new(MemorySequenceAllocator::new()),
            transform: transform_for(PartnerKind::Visa, Vec::new(), ledger.clone()),
            ledger,
        },
    )
    .with_clock(Arc::new(move || at));

    let report = cycle.run().await;

    assert!(report.is_success(), "failures: {:?}", report.failures());
    fetch_mock.assert();
    send_mock.assert();
    assert_eq!(inbound.state("ACK_001.txt").await.unwrap(), Some(FileState::Processed));
    assert_eq!(
        outbound.state("batch_240601_080000_1.txt").await.unwrap(),
        Some(FileState::Processed)
    );
    assert_eq!(memory_ledger.state_of("R1"), Some(RecordState::Consumed));
    assert_eq!(memory_ledger.responses().len(), 1);
}
